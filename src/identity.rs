//! In-memory cache of active identities, single-flight token refresh.
//!
//! Grounded on `provider_health.rs`'s `Arc<RwLock<HashMap<..>>>` cache shape
//! and `ai_providers.rs`'s `OAuthCredentials{refresh_token, access_token,
//! expires_at}` token triple. Single-flight refresh follows the same
//! "in-flight map keyed by id, await the other future" idiom used for
//! `mission_runner`'s account leasing, implemented here with a `watch`
//! channel over a plain `reqwest` POST/decode call: the leader's result is a
//! value followers observe, not an edge-triggered signal they can miss.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{watch, Mutex, RwLock};

use crate::store::{AccountPatch, Identity, PersistenceStore};

#[derive(Debug, Clone)]
struct CachedList {
    identities: Vec<Identity>,
    loaded_at: Instant,
}

/// `None` while the leader's refresh is still running; set once to the
/// final outcome. Followers subscribe and wait for the first `Some`, which
/// `watch` delivers correctly regardless of when they subscribed relative
/// to the leader's send.
type RefreshOutcome = Option<Result<String, String>>;

pub struct IdentityManager {
    store: Arc<dyn PersistenceStore>,
    http: reqwest::Client,
    oauth_refresh_url: String,
    cache_ttl: Duration,
    refresh_margin: Duration,
    cache: RwLock<Option<CachedList>>,
    in_flight: Mutex<HashMap<String, watch::Receiver<RefreshOutcome>>>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Seconds until expiry, as returned by the OAuth token endpoint.
    expires_in: i64,
}

impl IdentityManager {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        http: reqwest::Client,
        oauth_refresh_url: String,
        cache_ttl: Duration,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            store,
            http,
            oauth_refresh_url,
            cache_ttl,
            refresh_margin,
            cache: RwLock::new(None),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Force an eager load at startup.
    pub async fn warm(&self) -> anyhow::Result<()> {
        self.reload().await
    }

    /// Clear the cache so the next read forces a synchronous reload.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// The current active-identity list, LRU-ordered. The first call awaits
    /// a load; subsequent calls return the cached list and fire a background
    /// refresh once it is stale. Refresh failures preserve the prior list.
    pub async fn get_ready_accounts(self: &Arc<Self>) -> anyhow::Result<Vec<Identity>> {
        let snapshot = self.cache.read().await.clone();
        match snapshot {
            None => {
                self.reload().await?;
                Ok(self
                    .cache
                    .read()
                    .await
                    .as_ref()
                    .map(|c| c.identities.clone())
                    .unwrap_or_default())
            }
            Some(cached) => {
                if cached.loaded_at.elapsed() >= self.cache_ttl {
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(err) = this.reload().await {
                            tracing::warn!(error = %err, "background identity cache refresh failed");
                        }
                    });
                }
                Ok(cached.identities)
            }
        }
    }

    async fn reload(&self) -> anyhow::Result<()> {
        let identities = self.store.get_active_accounts().await?;
        *self.cache.write().await = Some(CachedList {
            identities,
            loaded_at: Instant::now(),
        });
        Ok(())
    }

    /// Return a fresh access token for `identity`, refreshing it if the
    /// token expires within `refresh_margin`. Concurrent callers for the
    /// same identity share a single in-flight HTTP refresh.
    pub async fn ensure_fresh_token(&self, identity: &Identity) -> anyhow::Result<String> {
        if Utc::now() < identity.expires_at - chrono::Duration::from_std(self.refresh_margin).unwrap() {
            return Ok(identity.access_token.clone());
        }

        enum Role {
            Leader(watch::Sender<RefreshOutcome>),
            Follower(watch::Receiver<RefreshOutcome>),
        }

        let role = {
            let mut table = self.in_flight.lock().await;
            if let Some(existing) = table.get(&identity.email) {
                Role::Follower(existing.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                table.insert(identity.email.clone(), rx);
                Role::Leader(tx)
            }
        };

        let mut rx = match role {
            Role::Follower(mut rx) => {
                if rx.wait_for(|outcome| outcome.is_some()).await.is_err() {
                    anyhow::bail!("token refresh failed: leader dropped before producing a result");
                }
                rx
            }
            Role::Leader(tx) => {
                let outcome = self.do_refresh(identity).await;
                let _ = tx.send(Some(outcome.as_ref().map(|t| t.clone()).map_err(|e| e.to_string())));
                self.in_flight.lock().await.remove(&identity.email);
                return outcome;
            }
        };

        let outcome = rx.borrow_and_update().clone();
        match outcome {
            Some(Ok(token)) => Ok(token),
            Some(Err(msg)) => Err(anyhow::anyhow!("{msg}")),
            None => Err(anyhow::anyhow!("token refresh failed: no result recorded")),
        }
    }

    async fn do_refresh(&self, identity: &Identity) -> anyhow::Result<String> {
        let resp = self
            .http
            .post(&self.oauth_refresh_url)
            .form(&[
                ("refresh_token", identity.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} {}", status.as_u16(), body);
        }

        let parsed: RefreshResponse = resp.json().await?;
        let new_expires_at = Utc::now() + chrono::Duration::seconds(parsed.expires_in.max(0));
        let new_refresh_token = parsed.refresh_token.unwrap_or_else(|| identity.refresh_token.clone());

        self.store
            .update_account(
                &identity.email,
                AccountPatch {
                    access_token: Some(parsed.access_token.clone()),
                    refresh_token: Some(new_refresh_token),
                    expires_at: Some(new_expires_at),
                    ..Default::default()
                },
            )
            .await?;
        self.invalidate().await;

        tracing::info!(identity = %identity.email, "refreshed access token");
        Ok(parsed.access_token)
    }
}
