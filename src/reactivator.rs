//! Periodic task clearing persisted exhaustion flags past their cooldown.
//!
//! Grounded on the `tokio::spawn` + `tokio::time::interval` background-task
//! pattern used for maintenance loops throughout this codebase's `api/`
//! handlers (e.g. `console::SessionPool::start_cleanup_task`).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::store::PersistenceStore;

/// Spawn the reactivator loop. Every `interval`, identities whose
/// `exhausted_at` is older than `cooldown` are flipped back to active via
/// the persistence layer — the only durable reactivation path; live
/// cooldowns in [`crate::cooldown::CooldownRegistry`] auto-clear on expiry
/// without touching persistence.
pub fn spawn(
    store: Arc<dyn PersistenceStore>,
    interval: Duration,
    cooldown: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so reactivation doesn't
        // race identity enrollment at startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - chrono::Duration::from_std(cooldown).unwrap_or_default();
            match store.reactivate_exhausted_accounts(cutoff).await {
                Ok(count) if count > 0 => {
                    tracing::info!(count, "reactivated exhausted identities");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "failed to reactivate exhausted identities");
                }
            }
        }
    })
}
