// reqwest implementation of the console HTTP surface

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use log::debug;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

use super::api::{
    ByteProgress, ChunkUpload, CommandReply, ConsoleApi, HistoryPage, InitUpload, LogRead,
    ManagerCommand, TokenGrant,
};
use crate::common::config::ClientConfig;
use crate::common::error::{Error, Result};
use crate::protocol::LogFileInfo;

pub struct HttpConsoleApi {
    client: Client,
    config: ClientConfig,
}

impl HttpConsoleApi {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn get(&self, path: &str) -> Result<RequestBuilder> {
        Ok(self
            .client
            .get(self.config.endpoint(path)?)
            .timeout(self.config.request_timeout))
    }

    fn post(&self, path: &str) -> Result<RequestBuilder> {
        Ok(self
            .client
            .post(self.config.endpoint(path)?)
            .timeout(self.config.request_timeout))
    }
}

/// Map non-success statuses: 403 is the token rejection, anything else keeps the body.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::FORBIDDEN {
        return Err(Error::Forbidden);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status.canonical_reason().unwrap_or("request failed").to_string()
        } else {
            body
        };
        return Err(Error::Status {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response)
}

async fn json_body<T: DeserializeOwned>(response: Response) -> Result<T> {
    let text = check(response).await?.text().await?;
    Ok(serde_json::from_str(&text)?)
}

#[async_trait]
impl ConsoleApi for HttpConsoleApi {
    async fn fetch_token(&self) -> Result<TokenGrant> {
        let response = self.get("/project/csrftoken")?.send().await?;
        json_body(response)
            .await
            .map_err(|e| Error::TokenUnavailable(e.to_string()))
    }

    async fn init_upload(&self, request: &InitUpload, token: &str) -> Result<()> {
        let mut body = serde_json::to_value(request)?;
        body["csrfToken"] = json!(token);
        let response = self.post("/project/upload/init")?.json(&body).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn upload_chunk(&self, chunk: ChunkUpload, token: &str) -> Result<()> {
        debug!(
            "HTTP: chunk {}/{} ({} bytes) for {}",
            chunk.chunk_index + 1,
            chunk.total_chunks,
            chunk.data.len(),
            chunk.upload_id
        );
        let part = Part::bytes(chunk.data.to_vec()).file_name(format!("chunk_{}", chunk.chunk_index));
        let form = Form::new()
            .text("uploadId", chunk.upload_id)
            .text("chunkIndex", chunk.chunk_index.to_string())
            .text("totalChunks", chunk.total_chunks.to_string())
            .part("chunk", part)
            .text("csrfToken", token.to_string());

        let response = self.post("/project/upload/chunk")?.multipart(form).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn finalize_upload(&self, upload_id: &str, token: &str) -> Result<()> {
        let response = self
            .post("/project/upload/finalize")?
            .json(&json!({ "uploadId": upload_id, "csrfToken": token }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn upload_whole(
        &self,
        file: &Path,
        restart: bool,
        token: &str,
        progress: ByteProgress,
    ) -> Result<()> {
        let handle = tokio::fs::File::open(file)
            .await
            .map_err(|_| Error::FileNotFound(file.display().to_string()))?;
        let total = handle.metadata().await?.len();
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let sent = Arc::new(AtomicU64::new(0));
        let stream = ReaderStream::new(handle).inspect_ok(move |bytes| {
            let now = sent.fetch_add(bytes.len() as u64, Ordering::Relaxed) + bytes.len() as u64;
            progress(now, total);
        });
        let part = Part::stream_with_length(Body::wrap_stream(stream), total).file_name(file_name);
        let form = Form::new()
            .part("dateiupload", part)
            .text("restartProject", restart.to_string())
            .text("csrfToken", token.to_string());

        // No request timeout: large archives take as long as they take.
        let response = self
            .client
            .post(self.config.endpoint("/project/download")?)
            .multipart(form)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn list_log_files(&self) -> Result<Vec<LogFileInfo>> {
        #[derive(Deserialize)]
        struct Files {
            #[serde(default)]
            files: Vec<LogFileInfo>,
        }
        let response = self.get("/logs/files")?.send().await?;
        let files: Files = json_body(response).await?;
        Ok(files.files)
    }

    async fn read_log(&self, file: &str, since: u64, limit: u32) -> Result<LogRead> {
        let response = self
            .get("/logs/read")?
            .query(&[
                ("file", file.to_string()),
                ("since", since.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;
        let read: LogRead = json_body(response).await?;
        match read.error {
            Some(error) => Err(Error::Http(format!("Log read failed: {}", error))),
            None => Ok(read),
        }
    }

    async fn deployment_history(&self) -> Result<HistoryPage> {
        let response = self.get("/project/history")?.send().await?;
        json_body(response).await
    }

    async fn manager_command(&self, command: &ManagerCommand, token: &str) -> Result<CommandReply> {
        let mut body = serde_json::to_value(command)?;
        body["csrfToken"] = json!(token);
        let response = self.post("/project/manager")?.json(&body).send().await?;
        json_body(response).await
    }

    async fn restart_instance(&self, hostname: &str, token: &str) -> Result<()> {
        let response = self
            .post("/project/restart")?
            .json(&json!({ "restart": true, "hostname": hostname, "csrfToken": token }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let response = self
            .client
            .head(self.config.endpoint("/")?)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}
