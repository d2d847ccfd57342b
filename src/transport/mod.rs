// WebSocket transport layer module

pub mod websocket;

pub use websocket::{open, split, ChannelReader, ChannelWriter, TransportEvent, WsStream};
