// Protocol message types for the real-time channel

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::common::types::SUBSCRIBED_CHANNELS;

/// Control messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        channels: Vec<String>,
    },
    SubscribeLog {
        file: String,
        #[serde(rename = "startPos")]
        start_pos: u64,
    },
    UnsubscribeLog,
    GetLogFiles,
    Heartbeat,
}

impl ClientMessage {
    /// The fixed channel subscription issued on every open.
    pub fn subscribe_all() -> Self {
        ClientMessage::Subscribe {
            channels: SUBSCRIBED_CHANNELS.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn subscribe_log(file: impl Into<String>, start_pos: u64) -> Self {
        ClientMessage::SubscribeLog {
            file: file.into(),
            start_pos,
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::SerializationError(e.to_string()))
    }
}

/// Inbound message kinds. Anything the client does not know becomes `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Pmon(StatusSnapshot),
    Deployment(DeploymentUpdate),
    Log(LogTail),
    LogContent(LogTail),
    LogFiles(LogFileList),
    Heartbeat,
    Notification(ServerNotification),
    Error(ServerError),
    Unknown { kind: String },
}

impl ServerMessage {
    /// Wire tag of this message.
    pub fn kind(&self) -> &str {
        match self {
            ServerMessage::Pmon(_) => "pmon",
            ServerMessage::Deployment(_) => "deployment",
            ServerMessage::Log(_) => "log",
            ServerMessage::LogContent(_) => "logContent",
            ServerMessage::LogFiles(_) => "logFiles",
            ServerMessage::Heartbeat => "heartbeat",
            ServerMessage::Notification(_) => "notification",
            ServerMessage::Error(_) => "error",
            ServerMessage::Unknown { kind } => kind,
        }
    }
}

/// Process-monitor status of every project instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSnapshot {
    pub instances: Vec<InstanceStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceStatus {
    pub hostname: Option<String>,
    pub project_name: Option<String>,
    pub progs: Vec<ManagerStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerStatus {
    #[serde(deserialize_with = "loose_string")]
    pub manager: String,
    #[serde(deserialize_with = "loose_string")]
    pub state: String,
    #[serde(deserialize_with = "loose_string")]
    pub pid: String,
    #[serde(deserialize_with = "loose_string")]
    pub start_mode: String,
    #[serde(deserialize_with = "loose_string")]
    pub restart_count: String,
    #[serde(deserialize_with = "loose_string")]
    pub start_time: String,
    #[serde(deserialize_with = "loose_string")]
    pub man_num: String,
    pub shm_id: Option<i64>,
}

impl ManagerStatus {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Started,
    Progress,
    Completed,
    Failed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentUpdate {
    pub status: DeploymentStatus,
    #[serde(default)]
    pub details: DeploymentDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeploymentDetails {
    pub file_name: Option<String>,
    pub message: Option<String>,
    pub progress: Option<u8>,
}

/// Log lines for one file; `last_pos` is the server offset after these lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogTail {
    pub file: Option<String>,
    pub lines: Vec<String>,
    pub last_pos: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFileList {
    pub files: Vec<LogFileInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFileInfo {
    pub name: String,
    /// Size in KB as reported by the server.
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl Default for NoticeLevel {
    fn default() -> Self {
        NoticeLevel::Info
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerNotification {
    pub level: NoticeLevel,
    pub title: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerError {
    pub message: Option<String>,
}

/// Accepts a string, number or bool and keeps its text form; null becomes empty.
fn loose_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}
