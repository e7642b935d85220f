//! Exponential delay with jitter and server-hint override.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
            jitter_factor: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// `min(2^attempt * base, max) * (1 +/- jitter_factor)`, jitter sampled
    /// uniformly.
    pub fn compute(&self, attempt: u32) -> Duration {
        let exp = attempt.min(10);
        let raw = self.base.as_secs_f64() * 2f64.powi(exp as i32);
        let capped = raw.min(self.max.as_secs_f64());
        Duration::from_secs_f64(self.jittered(capped))
    }

    /// Use an upstream `Retry-After` value as the base instead of the
    /// exponential term; still jittered, still capped, with a 2s floor.
    pub fn compute_with_retry_after(&self, retry_after: Duration) -> Duration {
        let floor = Duration::from_secs(2);
        let base = retry_after.max(floor).min(self.max).as_secs_f64();
        Duration::from_secs_f64(self.jittered(base))
    }

    fn jittered(&self, base_secs: f64) -> f64 {
        let jitter = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        (base_secs * (1.0 + jitter)).max(0.0)
    }
}

/// Parse an HTTP `Retry-After` header value (seconds, or an HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let now = chrono::Utc::now();
    let delta = when.with_timezone(&chrono::Utc) - now;
    delta.to_std().ok()
}
