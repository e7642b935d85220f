//! Per-identity cooldown state with escalation and probe windows.
//!
//! This is the system of record for identity availability at runtime; see
//! [`crate::identity`] and [`crate::reactivator`] for the durable backstop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::classify::Category;

const QUOTA_COOLDOWN: Duration = Duration::from_secs(60 * 60);
const TIMEOUT_COOLDOWN: Duration = Duration::from_secs(5);
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(15);
const RATE_LIMIT_BASE: Duration = Duration::from_secs(15);
const RATE_LIMIT_CAP: Duration = Duration::from_secs(120);
/// "Manual recovery only" for auth/billing, modeled as a bounded 100-year
/// cooldown rather than a true sentinel — `Instant::now() + duration` must
/// not overflow, which `Duration::from_secs(u64::MAX / 2)` does.
const MANUAL_RECOVERY_COOLDOWN: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Clone)]
struct CooldownState {
    cooldown_until: Instant,
    reason: Category,
    failure_count: u32,
    last_probe_at: Option<Instant>,
}

/// Per-identity cooldown registry, keyed by identity email.
#[derive(Debug, Clone)]
pub struct CooldownRegistry {
    entries: Arc<RwLock<HashMap<String, CooldownState>>>,
    probe_margin: Duration,
    min_probe_interval: Duration,
}

impl Default for CooldownRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(2 * 60), Duration::from_secs(30))
    }
}

fn duration_for(category: Category, failure_count: u32) -> Duration {
    match category {
        Category::RateLimit | Category::Overloaded => {
            let exp = failure_count.saturating_sub(1).min(16);
            let scaled = RATE_LIMIT_BASE.saturating_mul(1u32 << exp);
            scaled.min(RATE_LIMIT_CAP)
        }
        Category::Quota => QUOTA_COOLDOWN,
        Category::Auth | Category::Billing => MANUAL_RECOVERY_COOLDOWN,
        Category::Timeout => TIMEOUT_COOLDOWN,
        Category::ModelNotFound | Category::Format | Category::Unknown => DEFAULT_COOLDOWN,
    }
}

fn is_recoverable(category: Category) -> bool {
    !matches!(category, Category::Auth | Category::Billing)
}

impl CooldownRegistry {
    /// `probe_margin` and `min_probe_interval` correspond to the
    /// `PROBE_MARGIN` / `MIN_PROBE_INTERVAL` configuration tunables.
    pub fn new(probe_margin: Duration, min_probe_interval: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            probe_margin,
            min_probe_interval,
        }
    }

    /// Record a failure for `id`, escalating `failureCount` and computing a
    /// new cooldown window by category.
    pub async fn mark_cooldown(&self, id: &str, category: Category) {
        let mut entries = self.entries.write().await;
        let failure_count = entries.get(id).map(|e| e.failure_count).unwrap_or(0) + 1;
        let duration = duration_for(category, failure_count);
        entries.insert(
            id.to_string(),
            CooldownState {
                cooldown_until: Instant::now() + duration,
                reason: category,
                failure_count,
                last_probe_at: None,
            },
        );
        tracing::info!(identity = id, %category, failure_count, cooldown_secs = duration.as_secs(), "identity cooldown recorded");
    }

    /// True iff an entry exists and has not yet expired. Lazily deletes
    /// expired entries.
    pub async fn in_cooldown(&self, id: &str) -> bool {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(id) {
                None => return false,
                Some(state) if now < state.cooldown_until => return true,
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().await;
        if let Some(state) = entries.get(id) {
            if now >= state.cooldown_until {
                entries.remove(id);
            }
        }
        false
    }

    /// True when a probe attempt against a still-cooling identity is due.
    pub async fn should_probe(&self, id: &str) -> bool {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let Some(state) = entries.get(id) else {
            return false;
        };
        if !is_recoverable(state.reason) {
            return false;
        }
        let interval_elapsed = state
            .last_probe_at
            .map(|t| now.duration_since(t) >= self.min_probe_interval)
            .unwrap_or(true);
        if !interval_elapsed {
            return false;
        }
        match state.reason {
            Category::RateLimit | Category::Overloaded => true,
            _ => now + self.probe_margin >= state.cooldown_until,
        }
    }

    pub async fn record_probe(&self, id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(state) = entries.get_mut(id) {
            state.last_probe_at = Some(Instant::now());
        }
    }

    /// The sole healing transition: deletes the entry.
    pub async fn mark_success(&self, id: &str) {
        self.entries.write().await.remove(id);
    }

    /// Sweep expired entries; returns the number removed.
    pub async fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, state| now < state.cooldown_until);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn escalation_sequence_for_rate_limit() {
        let registry = CooldownRegistry::default();
        let expected = [15u64, 30, 60, 120, 120];
        for exp in expected {
            registry.mark_cooldown("a@example.com", Category::RateLimit).await;
            let entries = registry.entries.read().await;
            let state = entries.get("a@example.com").unwrap();
            let remaining = state.cooldown_until.duration_since(Instant::now()).as_secs();
            // allow slack for the instant the duration was computed at
            assert!(remaining <= exp && remaining + 1 >= exp, "expected ~{exp}s, got {remaining}s");
            drop(entries);
        }
    }

    #[tokio::test]
    async fn quota_cooldown_is_constant() {
        let registry = CooldownRegistry::default();
        registry.mark_cooldown("b@example.com", Category::Quota).await;
        registry.mark_cooldown("b@example.com", Category::Quota).await;
        registry.mark_cooldown("b@example.com", Category::Quota).await;
        let entries = registry.entries.read().await;
        let state = entries.get("b@example.com").unwrap();
        let remaining = state.cooldown_until.duration_since(Instant::now()).as_secs();
        assert!(remaining >= 3599 && remaining <= 3600);
    }

    #[tokio::test]
    async fn success_clears_cooldown_and_forgets_failure_count() {
        let registry = CooldownRegistry::default();
        registry.mark_cooldown("c@example.com", Category::RateLimit).await;
        registry.mark_cooldown("c@example.com", Category::RateLimit).await;
        registry.mark_success("c@example.com").await;
        assert!(!registry.in_cooldown("c@example.com").await);

        registry.mark_cooldown("c@example.com", Category::RateLimit).await;
        let entries = registry.entries.read().await;
        let state = entries.get("c@example.com").unwrap();
        assert_eq!(state.failure_count, 1);
    }

    #[tokio::test]
    async fn in_cooldown_lazily_deletes_expired_entries() {
        let registry = CooldownRegistry::default();
        {
            let mut entries = registry.entries.write().await;
            entries.insert(
                "d@example.com".to_string(),
                CooldownState {
                    cooldown_until: Instant::now() - Duration::from_secs(1),
                    reason: Category::Timeout,
                    failure_count: 1,
                    last_probe_at: None,
                },
            );
        }
        assert!(!registry.in_cooldown("d@example.com").await);
        assert!(registry.entries.read().await.get("d@example.com").is_none());
    }

    #[tokio::test]
    async fn should_probe_respects_minimum_interval() {
        let registry = CooldownRegistry::default();
        registry.mark_cooldown("e@example.com", Category::RateLimit).await;
        assert!(registry.should_probe("e@example.com").await);
        registry.record_probe("e@example.com").await;
        assert!(!registry.should_probe("e@example.com").await);
    }

    #[tokio::test]
    async fn auth_and_billing_never_probe() {
        let registry = CooldownRegistry::default();
        registry.mark_cooldown("f@example.com", Category::Auth).await;
        assert!(!registry.should_probe("f@example.com").await);
    }
}
