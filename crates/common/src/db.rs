//! SQLite persistence for users, server profiles and connection tokens

use crate::crypto::Vault;
use crate::types::{
    ConnectionToken, DesktopProtocol, NewServerProfile, ServerKind, ServerProfile, User,
    DEFAULT_SSH_PORT, DEFAULT_SSH_USERNAME,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Get connection for custom queries
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                ip_address TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT,
                password_enc TEXT,
                private_key_enc TEXT,
                desktop_protocol TEXT NOT NULL DEFAULT 'RDP',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_servers_user ON servers(user_id);

            -- Timestamps are unix milliseconds
            CREATE TABLE IF NOT EXISTS connection_tokens (
                id TEXT PRIMARY KEY,
                token TEXT NOT NULL UNIQUE,
                server_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY(server_id) REFERENCES servers(id) ON DELETE CASCADE,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_tokens_expires ON connection_tokens(expires_at);
            CREATE INDEX IF NOT EXISTS idx_tokens_server ON connection_tokens(server_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Users
    // ========================================================================

    pub fn create_user(&self, email: &str, display_name: Option<&str>) -> Result<User> {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            display_name: display_name.map(String::from),
            created_at: Utc::now().timestamp(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, email, display_name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user.id.to_string(), user.email, user.display_name, user.created_at],
        )
        .map_err(|e| unique_violation(e, "user", email))?;

        debug!("Created user {}", user.id);
        Ok(user)
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                "SELECT id, email, display_name, created_at FROM users WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(User {
                        id: uuid_col(row, 0)?,
                        email: row.get(1)?,
                        display_name: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    // ========================================================================
    // Server profiles
    // ========================================================================

    /// Store a new profile, encrypting its secret fields with `vault`.
    pub fn insert_server(
        &self,
        user_id: Uuid,
        profile: &NewServerProfile,
        vault: &Vault,
    ) -> Result<ServerProfile> {
        let now = Utc::now().timestamp();
        let protocol = profile.desktop_protocol.unwrap_or_default();
        let (port, username) = match profile.kind {
            ServerKind::Shell => (
                profile.port.unwrap_or(DEFAULT_SSH_PORT),
                Some(
                    profile
                        .username
                        .clone()
                        .unwrap_or_else(|| DEFAULT_SSH_USERNAME.to_string()),
                ),
            ),
            ServerKind::Desktop => (
                profile.port.unwrap_or_else(|| protocol.default_port()),
                profile.username.clone(),
            ),
        };

        let record = ServerProfile {
            id: Uuid::new_v4(),
            user_id,
            name: profile.name.clone(),
            kind: profile.kind,
            ip_address: profile.ip_address.clone(),
            port,
            username,
            password_enc: non_empty(&profile.password).map(|p| vault.encrypt(p)),
            private_key_enc: non_empty(&profile.private_key).map(|k| vault.encrypt(k)),
            desktop_protocol: protocol,
            created_at: now,
            updated_at: now,
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO servers (id, user_id, name, kind, ip_address, port, username,
                                  password_enc, private_key_enc, desktop_protocol, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id.to_string(),
                record.user_id.to_string(),
                record.name,
                record.kind.to_string(),
                record.ip_address,
                record.port,
                record.username,
                record.password_enc,
                record.private_key_enc,
                record.desktop_protocol.to_string(),
                record.created_at,
                record.updated_at,
            ],
        )?;

        debug!("Inserted {} server {} for user {}", record.kind, record.id, user_id);
        Ok(record)
    }

    pub fn get_server(&self, id: Uuid) -> Result<Option<ServerProfile>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?1"),
                params![id.to_string()],
                server_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Fetch a profile only if `user_id` owns it
    pub fn get_server_for_owner(&self, id: Uuid, user_id: Uuid) -> Result<Option<ServerProfile>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?1 AND user_id = ?2"),
                params![id.to_string(), user_id.to_string()],
                server_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Delete a profile; its connection tokens go with it.
    pub fn delete_server(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM servers WHERE id = ?1", params![id.to_string()])?;
        if rows > 0 {
            debug!("Deleted server {}", id);
        }
        Ok(rows > 0)
    }

    // ========================================================================
    // Connection tokens
    // ========================================================================

    /// Persist a token. A duplicate token value is rejected.
    pub fn insert_token(&self, token: &ConnectionToken) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO connection_tokens (id, token, server_id, user_id, created_at, expires_at, used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                token.id.to_string(),
                token.token,
                token.server_id.to_string(),
                token.user_id.to_string(),
                token.created_at.timestamp_millis(),
                token.expires_at.timestamp_millis(),
                token.used,
            ],
        )
        .map_err(|e| unique_violation(e, "connection_token", &token.id))?;
        Ok(())
    }

    pub fn find_token(&self, token: &str) -> Result<Option<ConnectionToken>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, token, server_id, user_id, created_at, expires_at, used
                 FROM connection_tokens WHERE token = ?1",
                params![token],
                |row| {
                    Ok(ConnectionToken {
                        id: uuid_col(row, 0)?,
                        token: row.get(1)?,
                        server_id: uuid_col(row, 2)?,
                        user_id: uuid_col(row, 3)?,
                        created_at: millis_col(row, 4)?,
                        expires_at: millis_col(row, 5)?,
                        used: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn mark_token_used(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE connection_tokens SET used = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    pub fn count_tokens_for_server(&self, server_id: Uuid) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM connection_tokens WHERE server_id = ?1",
            params![server_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

const SERVER_COLUMNS: &str = "id, user_id, name, kind, ip_address, port, username, \
     password_enc, private_key_enc, desktop_protocol, created_at, updated_at";

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<ServerProfile> {
    let kind: String = row.get(3)?;
    let protocol: String = row.get(9)?;
    Ok(ServerProfile {
        id: uuid_col(row, 0)?,
        user_id: uuid_col(row, 1)?,
        name: row.get(2)?,
        kind: kind.parse().map_err(|e: String| conversion_error(3, e))?,
        ip_address: row.get(4)?,
        port: row.get(5)?,
        username: row.get(6)?,
        password_enc: row.get(7)?,
        private_key_enc: row.get(8)?,
        desktop_protocol: protocol
            .parse::<DesktopProtocol>()
            .map_err(|e| conversion_error(9, e))?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e.to_string()))
}

fn millis_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {ms}")))
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(Error::Internal(msg)),
    )
}

fn unique_violation(e: rusqlite::Error, kind: &str, id: impl std::fmt::Display) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::ConstraintViolation
                && matches!(
                    f.extended_code,
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                ) =>
        {
            Error::AlreadyExists {
                kind: kind.to_string(),
                id: id.to_string(),
            }
        }
        _ => Error::Database(e),
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}
