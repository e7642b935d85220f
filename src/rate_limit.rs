//! Per-identity fixed-window client-side throttle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy)]
pub struct ConsumeResult {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
    pub remaining: u32,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    window_start_at: Instant,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<String, Window>>>,
    max: u32,
    window_len: Duration,
}

impl RateLimiter {
    pub fn new(max: u32, window_len: Duration) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            max,
            window_len,
        }
    }

    /// Consume one slot of `id`'s budget, resetting the window if expired.
    pub async fn consume(&self, id: &str) -> ConsumeResult {
        let now = Instant::now();
        let mut windows = self.windows.write().await;
        let window = windows.entry(id.to_string()).or_insert(Window {
            count: 0,
            window_start_at: now,
        });

        if now.duration_since(window.window_start_at) >= self.window_len {
            window.count = 0;
            window.window_start_at = now;
        }

        if window.count >= self.max {
            let retry_after = self.window_len - now.duration_since(window.window_start_at);
            return ConsumeResult {
                allowed: false,
                retry_after: Some(retry_after),
                remaining: 0,
            };
        }

        window.count += 1;
        ConsumeResult {
            allowed: true,
            retry_after: None,
            remaining: self.max - window.count,
        }
    }

    /// Reset a single identity's window.
    pub async fn reset(&self, id: &str) {
        self.windows.write().await.remove(id);
    }

    /// Reset all windows.
    pub async fn reset_all(&self) {
        self.windows.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_cap_then_rejects() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.consume("a").await.allowed);
        assert!(limiter.consume("a").await.allowed);
        let third = limiter.consume("a").await;
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert!(third.retry_after.is_some());
    }

    #[tokio::test]
    async fn window_resets_after_expiry() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.consume("a").await.allowed);
        assert!(!limiter.consume("a").await.allowed);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = limiter.consume("a").await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn identities_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.consume("a").await.allowed);
        assert!(limiter.consume("b").await.allowed);
    }

    #[tokio::test]
    async fn reset_clears_a_single_identity() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.consume("a").await.allowed);
        limiter.reset("a").await;
        assert!(limiter.consume("a").await.allowed);
    }
}
