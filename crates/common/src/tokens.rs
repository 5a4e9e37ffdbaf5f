//! Connection token broker
//!
//! Issues short-lived opaque tokens bound to a (user, server) pair and turns
//! them back into decrypted connection parameters for the bridges.

use crate::clock::Clock;
use crate::crypto::{random_hex, Vault};
use crate::db::Database;
use crate::types::{ConnectionToken, ResolvedParams, ResolvedProfile, ServerKind, ServerProfile};
use crate::{Error, Result};
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Token lifetime in hours
pub const TOKEN_TTL_HOURS: i64 = 24;

/// Random bytes per token (64 hex chars on the wire)
pub const TOKEN_BYTES: usize = 32;

const MAX_ISSUE_ATTEMPTS: usize = 3;

/// Issues and redeems connection tokens
#[derive(Clone)]
pub struct TokenBroker {
    db: Database,
    vault: Arc<Vault>,
    clock: Arc<dyn Clock>,
}

impl TokenBroker {
    pub fn new(db: Database, vault: Arc<Vault>, clock: Arc<dyn Clock>) -> Self {
        Self { db, vault, clock }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Issue a token for `server_id` on behalf of `user_id`.
    ///
    /// Fails with `NotFound` when the server does not exist or is owned by
    /// someone else; the two cases are indistinguishable to the caller.
    pub fn issue(&self, user_id: Uuid, server_id: Uuid) -> Result<ConnectionToken> {
        if self.db.get_server_for_owner(server_id, user_id)?.is_none() {
            return Err(Error::not_found("server", server_id));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = self.clock.now();
            let token = ConnectionToken {
                id: Uuid::new_v4(),
                token: random_hex(TOKEN_BYTES),
                server_id,
                user_id,
                created_at: now,
                expires_at: now + Duration::hours(TOKEN_TTL_HOURS),
                used: false,
            };

            match self.db.insert_token(&token) {
                Ok(()) => {
                    info!("Issued connection token {} for server {}", token.id, server_id);
                    return Ok(token);
                }
                Err(Error::AlreadyExists { .. }) if attempt < MAX_ISSUE_ATTEMPTS => {
                    warn!("Token collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Redeem a token into decrypted connection parameters.
    ///
    /// Only the secrets relevant to the profile's kind are decrypted. The
    /// `used` flag is recorded but does not block later redemptions.
    pub fn redeem(&self, token: &str) -> Result<ResolvedProfile> {
        let record = self.db.find_token(token)?.ok_or(Error::TokenNotFound)?;

        if self.clock.now() > record.expires_at {
            debug!("Rejected expired token {}", record.id);
            return Err(Error::TokenExpired);
        }

        // Cascade delete removes tokens with their server, so a miss here is a race.
        let server = self
            .db
            .get_server(record.server_id)?
            .ok_or(Error::TokenNotFound)?;

        let resolved = self.resolve(&server)?;

        if !record.used {
            if let Err(e) = self.db.mark_token_used(record.id) {
                warn!("Could not mark token {} used: {}", record.id, e);
            }
        }

        debug!("Redeemed token {} for {} server {}", record.id, server.kind, server.id);
        Ok(resolved)
    }

    /// Redeem a token and require a specific profile kind
    pub fn redeem_for(&self, token: &str, expected: ServerKind) -> Result<ResolvedProfile> {
        let resolved = self.redeem(token)?;
        if resolved.kind != expected {
            return Err(Error::ProfileKindMismatch {
                expected,
                actual: resolved.kind,
            });
        }
        Ok(resolved)
    }

    fn resolve(&self, server: &ServerProfile) -> Result<ResolvedProfile> {
        let params = match server.kind {
            ServerKind::Shell => ResolvedParams::Shell {
                port: server.port,
                username: server
                    .username
                    .clone()
                    .unwrap_or_else(|| crate::types::DEFAULT_SSH_USERNAME.to_string()),
                password: self.vault.decrypt_opt(server.password_enc.as_deref())?,
                private_key: self.vault.decrypt_opt(server.private_key_enc.as_deref())?,
            },
            ServerKind::Desktop => ResolvedParams::Desktop {
                protocol: server.desktop_protocol,
                port: server.port,
                username: server.username.clone(),
                password: self.vault.decrypt_opt(server.password_enc.as_deref())?,
            },
        };

        Ok(ResolvedProfile {
            id: server.id,
            name: server.name.clone(),
            kind: server.kind,
            ip_address: server.ip_address.clone(),
            params,
        })
    }
}
