//! The persistence contract the fulfillment engine consumes.
//!
//! Business-logic concerns that sit on top of this contract — identity
//! enrollment, an admin UI, at-rest encryption — are out of scope; this
//! module only specifies and implements the narrow contract the engine
//! actually calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An enrolled account allowing calls to the upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub project_id: String,
    pub active: bool,
    pub last_used_at: DateTime<Utc>,
    pub exhausted_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub tokens_used: u64,
    /// Informational only; does not affect rotation.
    pub is_tier_one: bool,
}

/// Patch applied by `update_account`; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct AccountPatch {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub active: Option<bool>,
    pub exhausted_at: Option<Option<DateTime<Utc>>>,
}

/// Counters applied atomically by `increment_account_stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsDelta {
    pub successful: u64,
    pub failed: u64,
    pub tokens: u64,
    /// Set when this call is a follow-up update for a request already
    /// counted (e.g. a stream's post-hoc token count) so `total_requests`
    /// isn't incremented a second time.
    pub skip_request_count: bool,
}

/// An opaque `sk-`-prefixed client credential, stored as a digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCredential {
    pub digest: String,
    pub visible_prefix: String,
    pub created_at: DateTime<Utc>,
    pub request_count: u64,
}

/// Audit record for one fulfilled (or failed) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub identity_email: String,
    pub prompt: String,
    pub response_text: String,
    pub token_count: u64,
    pub success: bool,
    pub system_instruction: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Active identities, sorted ascending by `last_used_at`.
    async fn get_active_accounts(&self) -> anyhow::Result<Vec<Identity>>;

    /// Patch the fields given in `patch` for the identity keyed by `email`.
    async fn update_account(&self, email: &str, patch: AccountPatch) -> anyhow::Result<()>;

    /// Atomic counter add.
    async fn increment_account_stats(&self, email: &str, delta: StatsDelta) -> anyhow::Result<()>;

    /// Flip `active=true` and clear `exhausted_at` for identities whose
    /// `exhausted_at` is older than `cutoff`. Returns the count affected.
    async fn reactivate_exhausted_accounts(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Best-effort; failures must not fail the request.
    async fn add_request_log(&self, entry: RequestLog) -> anyhow::Result<()>;

    /// O(1)-expected lookup by digest.
    async fn validate_api_key(&self, key: &str) -> anyhow::Result<bool>;
}
