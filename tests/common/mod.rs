// Shared in-memory console for integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pmlink::client::api::*;
use pmlink::protocol::LogFileInfo;
use pmlink::{Error, Result};
use tempfile::NamedTempFile;
use tokio::sync::Notify;

/// Order in which chunk requests started and settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTrace {
    Started(u32),
    Finished(u32),
}

/// Records every call; failures are scripted per chunk index.
#[derive(Default)]
pub struct FakeConsole {
    pub token_fetches: AtomicU32,
    pub inits: Mutex<Vec<InitUpload>>,
    pub finalizes: Mutex<Vec<String>>,
    /// chunk index -> sizes of every accepted upload of that chunk
    pub chunks: Mutex<BTreeMap<u32, Vec<usize>>>,
    pub chunk_calls: AtomicU32,
    pub in_flight: AtomicU32,
    pub peak_in_flight: AtomicU32,
    pub chunk_trace: Mutex<Vec<ChunkTrace>>,
    pub log_reads: AtomicU32,
    pub tokens_seen: Mutex<Vec<String>>,
    pub whole_uploads: AtomicU32,
    pub commands: Mutex<Vec<ManagerCommand>>,
    pub restarts: Mutex<Vec<String>>,

    /// chunk index -> how many times it fails before being accepted
    pub chunk_failures: Mutex<HashMap<u32, u32>>,
    pub forbid_chunks: bool,
    pub fail_init: bool,
    pub chunk_delay: Option<Duration>,
    pub read_delay: Option<Duration>,
    pub failing_hosts: Vec<String>,
    pub command_reply: Option<CommandReply>,
    pub chunk_seen: Notify,
}

impl FakeConsole {
    pub fn accepted_chunks(&self) -> Vec<u32> {
        self.chunks.lock().unwrap().keys().copied().collect()
    }

    pub fn finalize_count(&self) -> usize {
        self.finalizes.lock().unwrap().len()
    }

    pub fn fail_chunk(&self, index: u32, times: u32) {
        self.chunk_failures.lock().unwrap().insert(index, times);
    }

    fn accept_chunk(&self, chunk: &ChunkUpload) -> Result<()> {
        if self.forbid_chunks {
            return Err(Error::Forbidden);
        }
        {
            let mut failures = self.chunk_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&chunk.chunk_index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Status {
                        status: 502,
                        message: format!("chunk {} dropped", chunk.chunk_index),
                    });
                }
            }
        }
        self.chunks
            .lock()
            .unwrap()
            .entry(chunk.chunk_index)
            .or_default()
            .push(chunk.data.len());
        Ok(())
    }
}

#[async_trait]
impl ConsoleApi for FakeConsole {
    async fn fetch_token(&self) -> Result<TokenGrant> {
        let n = self.token_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenGrant {
            token: format!("csrf-{}", n),
            expires_in: 3600,
        })
    }

    async fn init_upload(&self, request: &InitUpload, token: &str) -> Result<()> {
        self.tokens_seen.lock().unwrap().push(token.to_string());
        if self.fail_init {
            return Err(Error::Status {
                status: 500,
                message: "init rejected".to_string(),
            });
        }
        self.inits.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn upload_chunk(&self, chunk: ChunkUpload, token: &str) -> Result<()> {
        self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        self.tokens_seen.lock().unwrap().push(token.to_string());
        self.chunk_seen.notify_one();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.chunk_trace.lock().unwrap().push(ChunkTrace::Started(chunk.chunk_index));

        if let Some(delay) = self.chunk_delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.accept_chunk(&chunk);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.chunk_trace.lock().unwrap().push(ChunkTrace::Finished(chunk.chunk_index));
        result
    }

    async fn finalize_upload(&self, upload_id: &str, token: &str) -> Result<()> {
        self.tokens_seen.lock().unwrap().push(token.to_string());
        self.finalizes.lock().unwrap().push(upload_id.to_string());
        Ok(())
    }

    async fn upload_whole(&self, file: &Path, _restart: bool, _token: &str, progress: ByteProgress) -> Result<()> {
        let total = std::fs::metadata(file)?.len();
        progress(total / 2, total);
        progress(total, total);
        self.whole_uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_log_files(&self) -> Result<Vec<LogFileInfo>> {
        Ok(vec![LogFileInfo {
            name: "PVSS_II.log".to_string(),
            size: 12,
        }])
    }

    async fn read_log(&self, _file: &str, since: u64, _limit: u32) -> Result<LogRead> {
        self.log_reads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(LogRead {
            lines: vec![format!("line after {}", since)],
            last_id: Some(since + 1),
            error: None,
        })
    }

    async fn deployment_history(&self) -> Result<HistoryPage> {
        Ok(HistoryPage::default())
    }

    async fn manager_command(&self, command: &ManagerCommand, token: &str) -> Result<CommandReply> {
        self.tokens_seen.lock().unwrap().push(token.to_string());
        self.commands.lock().unwrap().push(command.clone());
        Ok(self.command_reply.clone().unwrap_or(CommandReply {
            success: true,
            message: Some("ok".to_string()),
            error: None,
        }))
    }

    async fn restart_instance(&self, hostname: &str, token: &str) -> Result<()> {
        self.tokens_seen.lock().unwrap().push(token.to_string());
        self.restarts.lock().unwrap().push(hostname.to_string());
        if self.failing_hosts.iter().any(|h| h == hostname) {
            return Err(Error::Status {
                status: 500,
                message: format!("{} unreachable", hostname),
            });
        }
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}

/// Temp file of `size` bytes with a position-dependent pattern.
pub fn archive(size: usize) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    file
}
