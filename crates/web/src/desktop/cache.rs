//! Gateway session cache
//!
//! Holds the gateway auth token and the detected data source. Reads are
//! lock-free apart from a short `RwLock` read; refreshes are serialized by
//! an async mutex so concurrent callers share a single credential exchange.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use relaygate_common::Clock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::gateway::GatewayError;

/// Result of a credential exchange
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub auth_token: String,
    /// Data source named in the exchange response, if any
    pub data_source: Option<String>,
}

/// Where fresh gateway credentials come from
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn authenticate(&self) -> Result<TokenGrant, GatewayError>;

    /// First data source visible to `auth_token`
    async fn discover_data_source(&self, auth_token: &str) -> Result<Option<String>, GatewayError>;
}

/// A usable gateway session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySession {
    pub auth_token: String,
    pub data_source: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    auth_token: String,
    expires_at: DateTime<Utc>,
}

pub struct SessionCache {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    margin: Duration,
    fallback_data_source: String,
    token: RwLock<Option<CachedToken>>,
    data_source: RwLock<Option<String>>,
    refresh: Mutex<()>,
}

impl SessionCache {
    pub fn new(
        clock: Arc<dyn Clock>,
        ttl: std::time::Duration,
        margin: std::time::Duration,
        fallback_data_source: impl Into<String>,
    ) -> Self {
        Self {
            clock,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(1)),
            margin: Duration::from_std(margin).unwrap_or_else(|_| Duration::zero()),
            fallback_data_source: fallback_data_source.into(),
            token: RwLock::new(None),
            data_source: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Current session, refreshing it first if missing or near expiry
    pub async fn session(
        &self,
        source: &dyn CredentialSource,
    ) -> Result<GatewaySession, GatewayError> {
        if let Some(session) = self.fresh() {
            return Ok(session);
        }

        let _guard = self.refresh.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(session) = self.fresh() {
            return Ok(session);
        }

        let grant = source.authenticate().await?;
        let expires_at = self.clock.now() + self.ttl;

        let known = self.data_source.read().clone();
        let data_source = match known {
            Some(ds) => ds,
            None => {
                let discovered = match grant.data_source.clone() {
                    Some(ds) => Some(ds),
                    None => source
                        .discover_data_source(&grant.auth_token)
                        .await
                        .unwrap_or_else(|e| {
                            debug!("Data source discovery failed: {}", e);
                            None
                        }),
                };
                let ds = discovered.unwrap_or_else(|| self.fallback_data_source.clone());
                info!("Using gateway data source {}", ds);
                *self.data_source.write() = Some(ds.clone());
                ds
            }
        };

        *self.token.write() = Some(CachedToken {
            auth_token: grant.auth_token.clone(),
            expires_at,
        });
        debug!("Gateway credential refreshed, valid until {}", expires_at);

        Ok(GatewaySession {
            auth_token: grant.auth_token,
            data_source,
        })
    }

    /// Drop the cached auth token; the data source is kept
    pub fn invalidate(&self) {
        *self.token.write() = None;
    }

    fn fresh(&self) -> Option<GatewaySession> {
        let token = self.token.read().clone()?;
        if self.clock.now() >= token.expires_at - self.margin {
            return None;
        }
        let data_source = self.data_source.read().clone()?;
        Some(GatewaySession {
            auth_token: token.auth_token,
            data_source,
        })
    }
}
