//! Bearer token supply for the batch service.
//!
//! The transport asks a [`TokenSupplier`] for a token on every call. Minting tokens is
//! delegated to a [`TokenSource`] adapter wired in by the application; the
//! [`CachedTokenSupplier`] sits in between and makes sure that concurrent upload
//! workers which all miss the cache at once share a single mint instead of each
//! requesting their own token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};

/// A bearer token and when it stops being valid
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessToken {
    /// Raw token value sent as `Authorization: Bearer <value>`
    pub value: String,
    /// Expiry instant
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Create a new token
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Whether the token is still usable for at least `margin`
    pub fn is_fresh(&self, margin: Duration) -> bool {
        match chrono::Duration::from_std(margin) {
            Ok(margin) => Utc::now()
                .checked_add_signed(margin)
                .is_some_and(|deadline| self.expires_at > deadline),
            Err(_) => false,
        }
    }
}

/// Supplies bearer tokens to the transport
#[async_trait]
pub trait TokenSupplier: Send + Sync {
    /// Token for a logical resource
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthFailure`] when no token can be obtained.
    async fn bearer_token(&self, resource: &str) -> Result<String>;
}

/// Mints new tokens, e.g. through an identity provider's client-credentials flow
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Acquire a fresh token for a logical resource
    async fn fetch_token(&self, resource: &str) -> Result<AccessToken>;
}

/// Supplier that always hands out the same token
#[derive(Clone)]
pub struct StaticTokenSupplier {
    token: String,
}

impl StaticTokenSupplier {
    /// Create a supplier for a fixed token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSupplier for StaticTokenSupplier {
    async fn bearer_token(&self, _resource: &str) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Single-flight token cache keyed by resource.
///
/// Fresh tokens are served under a shared read lock. On a miss the caller takes the
/// refresh lock for that resource only, re-checks the cache and mints a token if
/// nobody else did in the meantime, so callers racing on the same miss wait for one
/// in-flight refresh. Lookups for other resources are never blocked by a refresh.
pub struct CachedTokenSupplier {
    source: Arc<dyn TokenSource>,
    refresh_margin: Duration,
    tokens: RwLock<HashMap<String, AccessToken>>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CachedTokenSupplier {
    /// Wrap a token source
    ///
    /// Tokens expiring within `refresh_margin` are treated as expired.
    pub fn new(source: Arc<dyn TokenSource>, refresh_margin: Duration) -> Self {
        Self {
            source,
            refresh_margin,
            tokens: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn cached(&self, resource: &str) -> Option<String> {
        self.tokens
            .read()
            .await
            .get(resource)
            .filter(|t| t.is_fresh(self.refresh_margin))
            .map(|t| t.value.clone())
    }

    async fn refresh_lock(&self, resource: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        Arc::clone(locks.entry(resource.to_string()).or_default())
    }
}

#[async_trait]
impl TokenSupplier for CachedTokenSupplier {
    async fn bearer_token(&self, resource: &str) -> Result<String> {
        if let Some(token) = self.cached(resource).await {
            return Ok(token);
        }

        let lock = self.refresh_lock(resource).await;
        let _flight = lock.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(token) = self.cached(resource).await {
            return Ok(token);
        }

        tracing::debug!(resource, "Refreshing bearer token");
        let token = self
            .source
            .fetch_token(resource)
            .await
            .map_err(|e| match e {
                Error::AuthFailure { .. } => e,
                other => Error::AuthFailure {
                    resource: resource.to_string(),
                    reason: other.to_string(),
                },
            })?;

        let value = token.value.clone();
        self.tokens
            .write()
            .await
            .insert(resource.to_string(), token);
        Ok(value)
    }
}
