// HTTP surface of the console service, as seen by the client

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::common::error::{Error, Result};
use crate::common::types::{ChunkIndex, UploadId};
use crate::protocol::LogFileInfo;

/// Byte-level progress callback: `(bytes_sent, bytes_total)`.
pub type ByteProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// A freshly issued anti-forgery token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    #[serde(rename = "csrfToken")]
    pub token: String,
    /// Lifetime in seconds from issuance.
    pub expires_in: u64,
}

impl TokenGrant {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.expires_in)
    }
}

/// Body of the upload-init request (token added by the transport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUpload {
    pub upload_id: UploadId,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub restart_project: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUpload {
    pub upload_id: UploadId,
    pub chunk_index: ChunkIndex,
    pub total_chunks: u32,
    pub data: Bytes,
}

/// Result of a `read since offset` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogRead {
    pub lines: Vec<String>,
    pub last_id: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryPage {
    pub history: Vec<HistoryEntry>,
    pub total_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    /// 0 means the deployment succeeded.
    pub status: i64,
    pub status_message: Option<String>,
}

impl HistoryEntry {
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerAction {
    Start,
    Stop,
    Restart,
}

impl ManagerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerAction::Start => "start",
            ManagerAction::Stop => "stop",
            ManagerAction::Restart => "restart",
        }
    }
}

impl fmt::Display for ManagerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManagerAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(ManagerAction::Start),
            "stop" => Ok(ManagerAction::Stop),
            "restart" => Ok(ManagerAction::Restart),
            other => Err(Error::ConfigError(format!("Unknown manager action: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerCommand {
    pub action: ManagerAction,
    pub shm_id: i64,
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CommandReply {
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
}

/// Every HTTP call the session makes. State-changing calls take the token and
/// fail with [`Error::Forbidden`] when the server rejects it.
#[async_trait]
pub trait ConsoleApi: Send + Sync {
    async fn fetch_token(&self) -> Result<TokenGrant>;

    async fn init_upload(&self, request: &InitUpload, token: &str) -> Result<()>;

    async fn upload_chunk(&self, chunk: ChunkUpload, token: &str) -> Result<()>;

    async fn finalize_upload(&self, upload_id: &str, token: &str) -> Result<()>;

    /// Single-request upload of a whole file, reporting bytes as they are sent.
    async fn upload_whole(
        &self,
        file: &Path,
        restart: bool,
        token: &str,
        progress: ByteProgress,
    ) -> Result<()>;

    async fn list_log_files(&self) -> Result<Vec<LogFileInfo>>;

    async fn read_log(&self, file: &str, since: u64, limit: u32) -> Result<LogRead>;

    async fn deployment_history(&self) -> Result<HistoryPage>;

    async fn manager_command(&self, command: &ManagerCommand, token: &str) -> Result<CommandReply>;

    async fn restart_instance(&self, hostname: &str, token: &str) -> Result<()>;

    /// Reachability check; any non-success status is an error.
    async fn probe(&self) -> Result<()>;
}
