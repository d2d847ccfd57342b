// Common type definitions and constants

use std::fmt;
use std::time::Duration;
use serde::{Serialize, Deserialize};

pub type UploadId = String;
pub type ChunkIndex = u32;

/// Lifecycle of the real-time channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
}

impl ConnectionState {
    /// Status label shown by the console for this state.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Open => "connected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Disconnected | ConnectionState::Reconnecting => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    Initializing,
    Transferring,
    Retrying,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Completed | UploadState::Failed | UploadState::Cancelled)
    }
}

// Channel
pub const DEFAULT_WS_PATH: &str = "/project/ws";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const LOG_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const LOG_READ_LIMIT: u32 = 1000;
pub const AVAILABILITY_PROBE_INTERVAL: Duration = Duration::from_secs(2);
/// Normal-closure code; a close with this code suppresses reconnection.
pub const NORMAL_CLOSURE: u16 = 1000;
pub const SUBSCRIBED_CHANNELS: [&str; 3] = ["pmon", "deployment", "logs"];

// Reconnect policy
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(2000);
pub const RECONNECT_MULTIPLIER: u32 = 2;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

// Uploads
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1MB
pub const MAX_CHUNK_SIZE: usize = 10 * 1024 * 1024; // 10MB
pub const MIN_CHUNK_SIZE: usize = 64 * 1024; // 64KB
pub const MAX_CONCURRENT_CHUNKS: usize = 3;
pub const CHUNK_RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(1000);

// Tokens
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
