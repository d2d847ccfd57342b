// Client module - console session over HTTP and the real-time channel

pub mod api;
pub mod connection;
pub mod driver;
pub mod http;
pub mod session;
pub mod sink;
pub mod timer;
pub mod token;
pub mod transfer;

pub use api::{
    ByteProgress, CommandReply, ConsoleApi, HistoryEntry, HistoryPage, LogRead, ManagerAction,
    ManagerCommand,
};
pub use connection::{ConnectionManager, ReconnectPolicy, Subscription};
pub use driver::ConnectionHandle;
pub use http::HttpConsoleApi;
pub use sink::{ConsoleSink, Notice, NullSink, RecordingSink, SinkEvent, UploadProgress};
pub use token::TokenManager;
pub use transfer::{format_size, UploadOutcome, UploadPipeline};

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};

use crate::common::config::ClientConfig;
use crate::common::error::{Error, Result};
use crate::protocol::LogFileInfo;

/// Tally of a fleet-wide restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Main client interface: one token cache, one upload slot, one channel.
pub struct ConsoleSession {
    config: ClientConfig,
    api: Arc<dyn ConsoleApi>,
    sink: Arc<dyn ConsoleSink>,
    tokens: Arc<TokenManager>,
    uploads: UploadPipeline,
    channel: ConnectionHandle,
}

impl ConsoleSession {
    /// Session against the console's HTTP API.
    pub fn new(config: ClientConfig, sink: Arc<dyn ConsoleSink>) -> Result<Self> {
        let api = Arc::new(HttpConsoleApi::new(config.clone())?);
        Self::with_api(config, api, sink)
    }

    /// Session over any [`ConsoleApi`]. Must be called inside a tokio runtime.
    pub fn with_api(
        config: ClientConfig,
        api: Arc<dyn ConsoleApi>,
        sink: Arc<dyn ConsoleSink>,
    ) -> Result<Self> {
        config.validate()?;
        let tokens = Arc::new(TokenManager::with_margin(
            api.clone(),
            config.token_refresh_margin,
        ));
        let uploads = UploadPipeline::new(&config, api.clone(), tokens.clone(), sink.clone());
        let channel = ConnectionHandle::spawn(&config, api.clone(), sink.clone())?;
        Ok(Self {
            config,
            api,
            sink,
            tokens,
            uploads,
            channel,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn channel(&self) -> &ConnectionHandle {
        &self.channel
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn connect(&self) -> Result<()> {
        self.channel.connect()
    }

    pub fn close(&self) -> Result<()> {
        self.channel.close()
    }

    pub async fn upload_chunked(&self, path: &Path, restart: bool) -> UploadOutcome {
        self.uploads.upload_chunked(path, restart).await
    }

    pub async fn upload_whole(&self, path: &Path, restart: bool) -> UploadOutcome {
        self.uploads.upload_whole(path, restart).await
    }

    /// `false` when no upload is running.
    pub fn cancel_upload(&self) -> bool {
        self.uploads.cancel()
    }

    pub fn upload_progress(&self) -> Option<UploadProgress> {
        self.uploads.latest_progress()
    }

    pub fn is_uploading(&self) -> bool {
        self.uploads.is_busy()
    }

    /// Start, stop or restart one manager of one instance.
    pub async fn manager_command(&self, command: &ManagerCommand) -> Result<CommandReply> {
        let result = self
            .with_token(|token| async move { self.api.manager_command(command, &token).await })
            .await;

        match &result {
            Ok(reply) if reply.success => {
                info!("Client: {} manager {} on {}", command.action, command.shm_id, command.hostname);
                self.sink.notify(&Notice::success(
                    "Command Sent",
                    reply
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("{} command sent", command.action)),
                ));
            }
            Ok(reply) => {
                let reason = reply
                    .error
                    .clone()
                    .or_else(|| reply.message.clone())
                    .unwrap_or_else(|| "Unknown error".to_string());
                warn!("Client: {} command rejected: {}", command.action, reason);
                self.sink.notify(&Notice::error("Command Failed", reason));
            }
            Err(e) => self.report_failure("Command Failed", e),
        }
        result
    }

    pub async fn restart_instance(&self, hostname: &str) -> Result<()> {
        self.with_token(|token| async move { self.api.restart_instance(hostname, &token).await })
            .await
    }

    /// Restart every host in turn, then report one summary notice.
    pub async fn restart_all_instances(&self, hostnames: &[String]) -> RestartSummary {
        let mut summary = RestartSummary {
            succeeded: 0,
            failed: 0,
        };
        for hostname in hostnames {
            match self.restart_instance(hostname).await {
                Ok(()) => summary.succeeded += 1,
                Err(e) => {
                    warn!("Client: restart of {} failed: {}", hostname, e);
                    summary.failed += 1;
                }
            }
        }

        if summary.failed == 0 {
            self.sink.notify(&Notice::success(
                "Restart Initiated",
                format!("All {} instances restarting", summary.succeeded),
            ));
        } else {
            self.sink.notify(&Notice::warning(
                "Partial Restart",
                format!("{} succeeded, {} failed", summary.succeeded, summary.failed),
            ));
        }
        summary
    }

    pub async fn deployment_history(&self) -> Result<HistoryPage> {
        self.api.deployment_history().await
    }

    pub async fn log_files(&self) -> Result<Vec<LogFileInfo>> {
        self.api.list_log_files().await
    }

    pub async fn read_log(&self, file: &str, since: u64) -> Result<LogRead> {
        self.api.read_log(file, since, self.config.log_read_limit).await
    }

    pub async fn probe(&self) -> Result<()> {
        self.api.probe().await
    }

    /// Run a state-changing call with the session token. The token is refreshed
    /// afterwards whatever the outcome; a rejection is reported as a security error.
    async fn with_token<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.tokens.acquire().await?;
        let result = call(token).await;
        self.tokens.rotate_quietly().await;
        if matches!(result, Err(Error::Forbidden)) {
            self.sink.notify(&Notice::error(
                "Security Error",
                "Request was rejected. Please try again.",
            ));
        }
        result
    }

    fn report_failure(&self, title: &str, error: &Error) {
        if !error.is_forbidden() {
            self.sink.notify(&Notice::error(title, error.to_string()));
        }
    }
}
