// WebSocket channel plumbing

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::common::error::{Error, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Largest text frame accepted from the server.
pub const MAX_FRAME_BYTES: usize = 64 << 20;

/// Close code reported when the socket drops without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// What the read half observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Closed { code: u16, reason: String },
    Error(String),
}

/// Open the channel, failing after `timeout`.
pub async fn open(url: &Url, timeout: Duration) -> Result<WsStream> {
    debug!("Transport: connecting to {}", url);
    let (stream, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
        .await
        .map_err(|_| Error::WebSocket(format!("Connect to {} timed out", url)))??;
    Ok(stream)
}

/// Split an open stream into independently owned halves.
pub fn split(stream: WsStream) -> (ChannelWriter, ChannelReader) {
    let (sink, stream) = stream.split();
    (ChannelWriter { sink }, ChannelReader { stream, done: false })
}

pub struct ChannelWriter {
    sink: SplitSink<WsStream, Message>,
}

impl ChannelWriter {
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Send a close frame with `code`. Errors are returned but the writer is
    /// unusable afterwards either way.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.sink.send(Message::Close(Some(frame))).await?;
        Ok(())
    }
}

pub struct ChannelReader {
    stream: SplitStream<WsStream>,
    done: bool,
}

impl ChannelReader {
    /// Next frame or close. Returns `None` once a close has been reported.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.done {
            return None;
        }
        loop {
            let event = match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > MAX_FRAME_BYTES {
                        warn!("Transport: dropping {} byte frame", text.len());
                        continue;
                    }
                    TransportEvent::Frame(text.as_str().to_owned())
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => TransportEvent::Frame(text),
                    Err(_) => {
                        warn!("Transport: dropping non-UTF-8 binary frame ({} bytes)", data.len());
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                        .unwrap_or((1005, String::new()));
                    TransportEvent::Closed { code, reason }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(TransportEvent::Error(e.to_string()));
                }
                None => TransportEvent::Closed {
                    code: ABNORMAL_CLOSURE,
                    reason: "stream ended".to_string(),
                },
            };
            if matches!(event, TransportEvent::Closed { .. }) {
                self.done = true;
            }
            return Some(event);
        }
    }
}
