// Collaborator surface: where the session reports what it observes

use std::sync::{Mutex, PoisonError};

use crate::common::types::{ConnectionState, UploadState};
use crate::protocol::{
    DeploymentUpdate, LogFileInfo, NoticeLevel, ServerNotification, StatusSnapshot,
};

/// A user-visible notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Info, title, message)
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Success, title, message)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Warning, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, title, message)
    }
}

impl From<ServerNotification> for Notice {
    fn from(n: ServerNotification) -> Self {
        Self::new(n.level, n.title.unwrap_or_default(), n.message.unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    pub state: UploadState,
    /// 0..=100
    pub percent: u8,
    pub message: String,
}

impl UploadProgress {
    pub fn new(state: UploadState, percent: u8, message: impl Into<String>) -> Self {
        Self {
            state,
            percent: percent.min(100),
            message: message.into(),
        }
    }
}

/// Rendering side of the console. The session decides when to call; the sink
/// decides what to show. Every method defaults to doing nothing.
pub trait ConsoleSink: Send + Sync {
    fn connection_status(&self, _state: ConnectionState) {}

    fn status_snapshot(&self, _snapshot: &StatusSnapshot) {}

    fn deployment(&self, _update: &DeploymentUpdate) {}

    /// `replace` is set for initial content, which supersedes earlier lines.
    fn log_lines(&self, _file: Option<&str>, _lines: &[String], _replace: bool) {}

    fn log_files(&self, _files: &[LogFileInfo]) {}

    fn notify(&self, _notice: &Notice) {}

    fn upload_progress(&self, _progress: &UploadProgress) {}

    /// Deployment history is stale and should be fetched again.
    fn history_changed(&self) {}
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ConsoleSink for NullSink {}

/// Everything a [`RecordingSink`] has seen.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Connection(ConnectionState),
    Snapshot(StatusSnapshot),
    Deployment(DeploymentUpdate),
    LogLines {
        file: Option<String>,
        lines: Vec<String>,
        replace: bool,
    },
    LogFiles(Vec<LogFileInfo>),
    Notice(Notice),
    Progress(UploadProgress),
    HistoryChanged,
}

/// Sink that keeps every call in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: SinkEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Notice(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn progress(&self) -> Vec<UploadProgress> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }
}

impl ConsoleSink for RecordingSink {
    fn connection_status(&self, state: ConnectionState) {
        self.push(SinkEvent::Connection(state));
    }

    fn status_snapshot(&self, snapshot: &StatusSnapshot) {
        self.push(SinkEvent::Snapshot(snapshot.clone()));
    }

    fn deployment(&self, update: &DeploymentUpdate) {
        self.push(SinkEvent::Deployment(update.clone()));
    }

    fn log_lines(&self, file: Option<&str>, lines: &[String], replace: bool) {
        self.push(SinkEvent::LogLines {
            file: file.map(str::to_owned),
            lines: lines.to_vec(),
            replace,
        });
    }

    fn log_files(&self, files: &[LogFileInfo]) {
        self.push(SinkEvent::LogFiles(files.to_vec()));
    }

    fn notify(&self, notice: &Notice) {
        self.push(SinkEvent::Notice(notice.clone()));
    }

    fn upload_progress(&self, progress: &UploadProgress) {
        self.push(SinkEvent::Progress(progress.clone()));
    }

    fn history_changed(&self) {
        self.push(SinkEvent::HistoryChanged);
    }
}
