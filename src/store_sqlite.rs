//! SQLite-backed [`PersistenceStore`].
//!
//! Every operation runs through `tokio::task::spawn_blocking` so the async
//! runtime is never blocked on rusqlite's synchronous API, following the
//! same single-connection-behind-a-mutex shape used throughout this
//! codebase's other SQLite-backed stores.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::store::{AccountPatch, ClientCredential, Identity, PersistenceStore, RequestLog, StatsDelta};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    email TEXT PRIMARY KEY,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    project_id TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    last_used_at TEXT NOT NULL,
    exhausted_at TEXT,
    total_requests INTEGER NOT NULL DEFAULT 0,
    successful_requests INTEGER NOT NULL DEFAULT 0,
    failed_requests INTEGER NOT NULL DEFAULT 0,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    is_tier_one INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_identities_active ON identities(active);

CREATE TABLE IF NOT EXISTS client_credentials (
    digest TEXT PRIMARY KEY,
    visible_prefix TEXT NOT NULL,
    created_at TEXT NOT NULL,
    request_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS request_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_email TEXT NOT NULL,
    prompt TEXT NOT NULL,
    response_text TEXT NOT NULL,
    token_count INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL,
    system_instruction TEXT,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_request_logs_identity ON request_logs(identity_email);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace an identity row. Not part of the persistence
    /// contract proper — enrollment is out of scope — but needed to seed a
    /// store for local testing or operator scripting.
    pub async fn upsert_identity(&self, identity: Identity) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection mutex poisoned");
            conn.execute(
                "INSERT INTO identities (
                    email, access_token, refresh_token, expires_at, project_id,
                    active, last_used_at, exhausted_at, total_requests,
                    successful_requests, failed_requests, tokens_used, is_tier_one
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(email) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    project_id = excluded.project_id,
                    active = excluded.active,
                    last_used_at = excluded.last_used_at,
                    exhausted_at = excluded.exhausted_at,
                    total_requests = excluded.total_requests,
                    successful_requests = excluded.successful_requests,
                    failed_requests = excluded.failed_requests,
                    tokens_used = excluded.tokens_used,
                    is_tier_one = excluded.is_tier_one",
                params![
                    identity.email,
                    identity.access_token,
                    identity.refresh_token,
                    identity.expires_at.to_rfc3339(),
                    identity.project_id,
                    identity.active as i64,
                    identity.last_used_at.to_rfc3339(),
                    identity.exhausted_at.map(|t| t.to_rfc3339()),
                    identity.total_requests as i64,
                    identity.successful_requests as i64,
                    identity.failed_requests as i64,
                    identity.tokens_used as i64,
                    identity.is_tier_one as i64,
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }
}

fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn row_to_identity(row: &rusqlite::Row) -> rusqlite::Result<Identity> {
    let expires_at: String = row.get("expires_at")?;
    let last_used_at: String = row.get("last_used_at")?;
    let exhausted_at: Option<String> = row.get("exhausted_at")?;
    Ok(Identity {
        email: row.get("email")?,
        access_token: row.get("access_token")?,
        refresh_token: row.get("refresh_token")?,
        expires_at: parse_rfc3339(&expires_at),
        project_id: row.get("project_id")?,
        active: row.get::<_, i64>("active")? != 0,
        last_used_at: parse_rfc3339(&last_used_at),
        exhausted_at: exhausted_at.map(|s| parse_rfc3339(&s)),
        total_requests: row.get::<_, i64>("total_requests")? as u64,
        successful_requests: row.get::<_, i64>("successful_requests")? as u64,
        failed_requests: row.get::<_, i64>("failed_requests")? as u64,
        tokens_used: row.get::<_, i64>("tokens_used")? as u64,
        is_tier_one: row.get::<_, i64>("is_tier_one")? != 0,
    })
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn get_active_accounts(&self) -> anyhow::Result<Vec<Identity>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT * FROM identities WHERE active = 1 ORDER BY last_used_at ASC",
            )?;
            let rows = stmt
                .query_map([], row_to_identity)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<Vec<Identity>, anyhow::Error>(rows)
        })
        .await?
    }

    async fn update_account(&self, email: &str, patch: AccountPatch) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        let email = email.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection mutex poisoned");
            if let Some(token) = &patch.access_token {
                conn.execute(
                    "UPDATE identities SET access_token = ?1 WHERE email = ?2",
                    params![token, email],
                )?;
            }
            if let Some(token) = &patch.refresh_token {
                conn.execute(
                    "UPDATE identities SET refresh_token = ?1 WHERE email = ?2",
                    params![token, email],
                )?;
            }
            if let Some(expires_at) = &patch.expires_at {
                conn.execute(
                    "UPDATE identities SET expires_at = ?1 WHERE email = ?2",
                    params![expires_at.to_rfc3339(), email],
                )?;
            }
            if let Some(last_used_at) = &patch.last_used_at {
                conn.execute(
                    "UPDATE identities SET last_used_at = ?1 WHERE email = ?2",
                    params![last_used_at.to_rfc3339(), email],
                )?;
            }
            if let Some(active) = patch.active {
                conn.execute(
                    "UPDATE identities SET active = ?1 WHERE email = ?2",
                    params![active as i64, email],
                )?;
            }
            if let Some(exhausted_at) = &patch.exhausted_at {
                conn.execute(
                    "UPDATE identities SET exhausted_at = ?1 WHERE email = ?2",
                    params![exhausted_at.map(|t| t.to_rfc3339()), email],
                )?;
            }
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    async fn increment_account_stats(&self, email: &str, delta: StatsDelta) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        let email = email.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection mutex poisoned");
            let request_increment: i64 = if delta.skip_request_count { 0 } else { 1 };
            conn.execute(
                "UPDATE identities SET
                    total_requests = total_requests + ?1,
                    successful_requests = successful_requests + ?2,
                    failed_requests = failed_requests + ?3,
                    tokens_used = tokens_used + ?4
                 WHERE email = ?5",
                params![
                    request_increment,
                    delta.successful as i64,
                    delta.failed as i64,
                    delta.tokens as i64,
                    email
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    async fn reactivate_exhausted_accounts(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection mutex poisoned");
            let affected = conn.execute(
                "UPDATE identities SET active = 1, exhausted_at = NULL
                 WHERE exhausted_at IS NOT NULL AND exhausted_at < ?1",
                params![cutoff.to_rfc3339()],
            )?;
            Ok::<u64, anyhow::Error>(affected as u64)
        })
        .await?
    }

    async fn add_request_log(&self, entry: RequestLog) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection mutex poisoned");
            conn.execute(
                "INSERT INTO request_logs (
                    identity_email, prompt, response_text, token_count,
                    success, system_instruction, timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.identity_email,
                    entry.prompt,
                    entry.response_text,
                    entry.token_count as i64,
                    entry.success as i64,
                    entry.system_instruction,
                    entry.timestamp.to_rfc3339(),
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    async fn validate_api_key(&self, key: &str) -> anyhow::Result<bool> {
        let digest = hex_sha256(key);
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection mutex poisoned");
            let count: i64 = conn
                .query_row(
                    "SELECT request_count FROM client_credentials WHERE digest = ?1",
                    params![digest],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(-1);
            if count >= 0 {
                conn.execute(
                    "UPDATE client_credentials SET request_count = request_count + 1 WHERE digest = ?1",
                    params![digest],
                )?;
            }
            Ok::<bool, anyhow::Error>(count >= 0)
        })
        .await?
    }
}

pub fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Seed a client credential row directly (enrollment UI is out of scope).
pub async fn seed_client_credential(store: &SqliteStore, raw_key: &str) -> anyhow::Result<ClientCredential> {
    let digest = hex_sha256(raw_key);
    let visible_prefix: String = raw_key.chars().take(7).collect();
    let created_at = Utc::now();
    let conn = store.conn.clone();
    let digest_clone = digest.clone();
    let prefix_clone = visible_prefix.clone();
    tokio::task::spawn_blocking(move || {
        let conn = conn.lock().expect("sqlite connection mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO client_credentials (digest, visible_prefix, created_at, request_count)
             VALUES (?1, ?2, ?3, 0)",
            params![digest_clone, prefix_clone, created_at.to_rfc3339()],
        )?;
        Ok::<(), anyhow::Error>(())
    })
    .await??;
    Ok(ClientCredential {
        digest,
        visible_prefix,
        created_at,
        request_count: 0,
    })
}
