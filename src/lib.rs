// Library root

pub mod chunking;
pub mod client;
pub mod codec;
pub mod common;
pub mod protocol;
pub mod retransmission;
pub mod transport;

pub use client::{ConsoleSession, ConnectionHandle, ConsoleSink, UploadOutcome};
pub use common::config::ClientConfig;
pub use common::error::{Error, Result};
