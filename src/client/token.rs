// Anti-forgery token cache

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use super::api::ConsoleApi;
use crate::common::error::{Error, Result};
use crate::common::types::TOKEN_REFRESH_MARGIN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub expires_at: Instant,
}

/// Holds the one token of a session.
///
/// `acquire` serves the cached token until it is within the refresh margin of its
/// expiry. `consume` drops it unconditionally; a token is single use for
/// state-changing requests. Concurrent `acquire` calls are not coalesced, so two
/// callers racing on an empty cache may each fetch.
pub struct TokenManager {
    api: Arc<dyn ConsoleApi>,
    margin: Duration,
    cached: Mutex<Option<Token>>,
}

impl TokenManager {
    pub fn new(api: Arc<dyn ConsoleApi>) -> Self {
        Self::with_margin(api, TOKEN_REFRESH_MARGIN)
    }

    pub fn with_margin(api: Arc<dyn ConsoleApi>, margin: Duration) -> Self {
        Self {
            api,
            margin,
            cached: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Token>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached token, or a fresh one when missing or about to expire.
    pub async fn acquire(&self) -> Result<String> {
        if let Some(token) = self.valid_cached() {
            return Ok(token);
        }

        let grant = self.api.fetch_token().await.map_err(|e| match e {
            Error::TokenUnavailable(_) => e,
            other => Error::TokenUnavailable(other.to_string()),
        })?;
        if grant.token.is_empty() {
            warn!("Token: server issued an empty token");
            return Err(Error::TokenUnavailable("empty token".to_string()));
        }

        debug!("Token: fetched, valid for {}s", grant.expires_in);
        let token = Token {
            value: grant.token.clone(),
            expires_at: Instant::now() + grant.lifetime(),
        };
        *self.slot() = Some(token);
        Ok(grant.token)
    }

    fn valid_cached(&self) -> Option<String> {
        let slot = self.slot();
        let token = slot.as_ref()?;
        let now = Instant::now();
        if now + self.margin < token.expires_at {
            Some(token.value.clone())
        } else {
            None
        }
    }

    /// Forget the cached token regardless of its remaining lifetime.
    pub fn consume(&self) {
        *self.slot() = None;
    }

    /// Consume, then fetch a replacement.
    pub async fn rotate(&self) -> Result<String> {
        self.consume();
        self.acquire().await
    }

    /// Rotate and log instead of failing; a later `acquire` retries anyway.
    pub async fn rotate_quietly(&self) {
        if let Err(e) = self.rotate().await {
            warn!("Token: refresh failed: {}", e);
        }
    }

    pub fn cached(&self) -> Option<Token> {
        self.slot().clone()
    }
}
