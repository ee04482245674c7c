//! Agent credential lifecycle
//!
//! The token is renewed at 75% of its validity window. A renewed token is
//! pushed into the live session as a credential frame so open streams keep
//! running, and is what the next reconnect presents.

use std::sync::Arc;
use std::time::Duration;

use kuberde_auth::{IssuedToken, TokenSource};
use kuberde_common::retry::{retry_with_backoff, RetryConfig};
use kuberde_mux::MuxSession;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};

/// Attempts per renewal before the agent gives up
pub const REFRESH_ATTEMPTS: u32 = 5;

/// Slot holding the session the refreshed token is pushed into
pub type ActiveSession = Arc<Mutex<Option<MuxSession>>>;

/// Holds the agent's current bearer token
pub struct Credentials {
    source: Option<Arc<dyn TokenSource>>,
    current: RwLock<Option<IssuedToken>>,
    retry: RetryConfig,
}

impl Credentials {
    /// Credentials from `source`; `None` connects without a token
    pub fn new(source: Option<Arc<dyn TokenSource>>) -> Self {
        Self {
            source,
            current: RwLock::new(None),
            retry: RetryConfig {
                max_attempts: REFRESH_ATTEMPTS,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
                backoff_multiplier: 2.0,
            },
        }
    }

    #[cfg(test)]
    fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Current token, fetching one if none is held
    pub async fn bearer(&self) -> Result<Option<String>> {
        if self.source.is_none() {
            return Ok(None);
        }
        let cached = self.current.read().as_ref().map(|t| t.access_token.clone());
        match cached {
            Some(token) => Ok(Some(token)),
            None => Ok(Some(self.renew().await?.access_token)),
        }
    }

    /// Drop the held token so the next [`Self::bearer`] fetches a new one
    pub fn invalidate(&self) {
        *self.current.write() = None;
    }

    /// Fetch a new token with retries and hold it
    pub async fn renew(&self) -> Result<IssuedToken> {
        let source = self
            .source
            .clone()
            .ok_or_else(|| AgentError::config("no token source configured"))?;
        let issued = retry_with_backoff(&self.retry, "fetch_token", || {
            let source = source.clone();
            async move { source.fetch().await }
        })
        .await?;
        debug!(expires_in = ?issued.expires_in, "Obtained agent token");
        *self.current.write() = Some(issued.clone());
        Ok(issued)
    }

    fn refresh_after(&self) -> Option<Duration> {
        self.current.read().as_ref().and_then(IssuedToken::refresh_after)
    }

    /// Renew ahead of expiry until `shutdown`
    ///
    /// Returns an error once a renewal exhausts its retries; the agent
    /// treats that as fatal.
    pub async fn run_refresh(&self, active: ActiveSession, shutdown: CancellationToken) -> Result<()> {
        if self.source.is_none() {
            return Ok(());
        }
        loop {
            let held = self.current.read().is_some();
            let wait = match self.refresh_after() {
                Some(wait) => wait,
                None if held => {
                    debug!("Token does not expire, refresh loop idle");
                    shutdown.cancelled().await;
                    return Ok(());
                }
                None => Duration::ZERO,
            };
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }

            let issued = self.renew().await?;
            info!(expires_in = ?issued.expires_in, "Agent token renewed");

            let session = active.lock().clone();
            if let Some(session) = session {
                if let Err(e) = session.send_credential(&issued.access_token).await {
                    warn!(error = %e, "Could not present renewed token; it will be used on reconnect");
                }
            }
        }
    }
}
