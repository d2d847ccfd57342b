// Protocol module - wire message definitions

pub mod envelope;
pub mod messages;

pub use envelope::MessageEnvelope;
pub use messages::{
    ClientMessage, DeploymentDetails, DeploymentStatus, DeploymentUpdate, InstanceStatus,
    LogFileInfo, LogFileList, LogTail, ManagerStatus, NoticeLevel, ServerError,
    ServerMessage, ServerNotification, StatusSnapshot,
};
