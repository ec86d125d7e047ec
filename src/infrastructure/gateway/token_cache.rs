use crate::domain::gateway::GatewayError;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Instant,
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken, GatewayError>;
}

/// Caches the gateway access token and refreshes it shortly before expiry.
///
/// The lock is held across the fetch, so concurrent callers that find the
/// token stale wait for one refresh instead of each starting their own.
pub struct TokenCache<S> {
    source: S,
    cached: Mutex<Option<AccessToken>>,
    refresh_margin: Duration,
}

impl<S: TokenSource> TokenCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
            refresh_margin: Duration::from_secs(60),
        }
    }

    pub async fn get(&self) -> Result<String, GatewayError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now() + self.refresh_margin
        {
            return Ok(token.value.clone());
        }

        debug!("Refreshing gateway access token");
        let fresh = self.source.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    /// Drops the cached token, e.g. after the gateway rejected it.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}
