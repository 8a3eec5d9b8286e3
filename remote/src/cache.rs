//! Keeps one session warm across transfers
//!
//! The cache holds at most one session. [`SessionCache::acquire`] probes the cached session and
//! hands it out again when it still answers; otherwise the session is closed and a new one is
//! created, retrying connection failures a bounded number of times. Probing, discarding and
//! creating all happen under one lock, so concurrent callers never race to build two sessions.

use crate::{Connector, Result, Target, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// total connection attempts, including the first one
    pub attempts: u32,
    /// pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

pub struct SessionCache<C: Connector> {
    connector: C,
    retry: RetryPolicy,
    slot: tokio::sync::Mutex<Option<Arc<C::Session>>>,
}

impl<C: Connector> SessionCache<C> {
    pub fn new(connector: C) -> Self {
        Self::with_retry_policy(connector, RetryPolicy::default())
    }
    pub fn with_retry_policy(connector: C, retry: RetryPolicy) -> Self {
        Self {
            connector,
            retry,
            slot: tokio::sync::Mutex::new(None),
        }
    }
    pub fn connector(&self) -> &C {
        &self.connector
    }
    /// Returns a live session for `target`, reusing the cached one when possible.
    ///
    /// Fails with [`crate::Error::Authentication`] right away, or with
    /// [`crate::Error::Connection`] once every attempt allowed by the [`RetryPolicy`] failed.
    #[instrument(skip(self), fields(target = %target))]
    pub async fn acquire(&self, target: &Target) -> Result<Arc<C::Session>> {
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.target() == target && session.is_alive().await {
                tracing::debug!("reusing cached session");
                return Ok(session.clone());
            }
        }
        if let Some(stale) = slot.take() {
            tracing::info!("discarding cached session to {}", stale.target());
            stale.close().await;
        }
        let session = Arc::new(self.create(target).await?);
        *slot = Some(session.clone());
        Ok(session)
    }
    async fn create(&self, target: &Target) -> Result<C::Session> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connector.connect(target).await {
                Ok(session) => return Ok(session),
                Err(error) if error.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        "connection attempt {attempt}/{attempts} to {target} failed: {:#}; retrying in {}",
                        anyhow::Error::from(error),
                        humantime::format_duration(self.retry.backoff)
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
    /// Hands a session back after a transfer. The connection stays open for the next caller.
    pub fn release(&self, session: Arc<C::Session>) {
        tracing::trace!("released session to {}", session.target());
    }
    /// Closes the cached session, if any. Later calls to `acquire` connect again.
    pub async fn shutdown(&self) {
        let session = self.slot.lock().await.take();
        if let Some(session) = session {
            tracing::debug!("closing session to {}", session.target());
            session.close().await;
        }
    }
    pub async fn is_empty(&self) -> bool {
        self.slot.lock().await.is_none()
    }
}
