// Configuration types and parsing

use std::path::Path;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use url::Url;
use crate::common::error::{Error, Result};
use super::types::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub ws_path: String,
    pub chunk_size: usize,
    pub max_concurrent_chunks: usize,
    pub chunk_retry_attempts: u32,
    #[serde(with = "millis")]
    pub retry_backoff_step: Duration,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "millis")]
    pub reconnect_base_delay: Duration,
    pub reconnect_multiplier: u32,
    pub max_reconnect_attempts: u32,
    #[serde(with = "millis")]
    pub log_poll_interval: Duration,
    pub log_read_limit: u32,
    #[serde(with = "millis")]
    pub token_refresh_margin: Duration,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    #[serde(with = "opt_millis")]
    pub availability_probe_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            ws_path: DEFAULT_WS_PATH.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: MAX_CONCURRENT_CHUNKS,
            chunk_retry_attempts: CHUNK_RETRY_ATTEMPTS,
            retry_backoff_step: RETRY_BACKOFF_STEP,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
            reconnect_multiplier: RECONNECT_MULTIPLIER,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            log_poll_interval: LOG_POLL_INTERVAL,
            log_read_limit: LOG_READ_LIMIT,
            token_refresh_margin: TOKEN_REFRESH_MARGIN,
            request_timeout: DEFAULT_TIMEOUT,
            availability_probe_interval: Some(AVAILABILITY_PROBE_INTERVAL),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Load a JSON config file; absent fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.base_url)
            .map_err(|e| Error::ConfigError(format!("Invalid base URL {}: {}", self.base_url, e)))?;
        if self.chunk_size < MIN_CHUNK_SIZE || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::ConfigError(format!(
                "Chunk size must be between {} and {}",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(Error::ConfigError("Batch size must be at least 1".to_string()));
        }
        if self.chunk_retry_attempts == 0 {
            return Err(Error::ConfigError("Chunk retry attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn with_chunk_size(mut self, size: usize) -> Result<Self> {
        if size < MIN_CHUNK_SIZE || size > MAX_CHUNK_SIZE {
            return Err(Error::ConfigError(format!(
                "Chunk size must be between {} and {}",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        self.chunk_size = size;
        Ok(self)
    }

    pub fn with_ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    pub fn with_retry_backoff_step(mut self, step: Duration) -> Self {
        self.retry_backoff_step = step;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_log_poll_interval(mut self, interval: Duration) -> Self {
        self.log_poll_interval = interval;
        self
    }

    pub fn with_availability_probe(mut self, interval: Option<Duration>) -> Self {
        self.availability_probe_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Absolute URL for an HTTP endpoint path.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| Error::ConfigError(format!("Invalid base URL {}: {}", self.base_url, e)))?;
        base.join(path)
            .map_err(|e| Error::ConfigError(format!("Invalid endpoint {}: {}", path, e)))
    }

    /// Channel URL: the base URL with its scheme switched to ws/wss.
    pub fn ws_url(&self) -> Result<Url> {
        let mut url = self.endpoint(&self.ws_path)?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| Error::ConfigError(format!("Cannot derive channel URL from {}", self.base_url)))?;
        Ok(url)
    }
}

mod millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = ClientConfig::default();
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.max_concurrent_chunks, 3);
        assert_eq!(config.chunk_retry_attempts, 3);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_base_delay, Duration::from_millis(2000));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.log_poll_interval, Duration::from_secs(3));
        assert_eq!(config.token_refresh_margin, Duration::from_secs(60));
    }

    #[test]
    fn test_chunk_size_bounds() {
        assert!(ClientConfig::default().with_chunk_size(1024).is_err());
        assert!(ClientConfig::default().with_chunk_size(MAX_CHUNK_SIZE + 1).is_err());
        let config = ClientConfig::default().with_chunk_size(MIN_CHUNK_SIZE).unwrap();
        assert_eq!(config.chunk_size, MIN_CHUNK_SIZE);
    }

    #[test]
    fn test_ws_url_follows_scheme() {
        let config = ClientConfig::new("http://console.local:8080");
        assert_eq!(config.ws_url().unwrap().as_str(), "ws://console.local:8080/project/ws");

        let config = ClientConfig::new("https://console.local");
        assert_eq!(config.ws_url().unwrap().as_str(), "wss://console.local/project/ws");
    }

    #[test]
    fn test_endpoint_join() {
        let config = ClientConfig::new("http://10.0.0.5:8080");
        let url = config.endpoint("/project/upload/init").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.5:8080/project/upload/init");
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"base_url": "http://plant-a:9000", "heartbeat_interval": 5000}}"#).unwrap();
        file.flush().unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.base_url, "http://plant-a:9000");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.availability_probe_interval, Some(AVAILABILITY_PROBE_INTERVAL));
    }

    #[test]
    fn test_from_file_rejects_bad_url() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"base_url": "not a url"}}"#).unwrap();
        file.flush().unwrap();

        assert!(matches!(ClientConfig::from_file(file.path()), Err(Error::ConfigError(_))));
    }
}
