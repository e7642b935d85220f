//! Maps an upstream error (status + body text) to a cooldown category.
//!
//! Pure, synchronous, and total: every input lands in exactly one of the
//! nine [`Category`] values. Matching order matters — see [`classify`].

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    RateLimit,
    Quota,
    Auth,
    Timeout,
    Overloaded,
    Billing,
    ModelNotFound,
    Format,
    Unknown,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Category::RateLimit => "rate_limit",
            Category::Quota => "quota",
            Category::Auth => "auth",
            Category::Timeout => "timeout",
            Category::Overloaded => "overloaded",
            Category::Billing => "billing",
            Category::ModelNotFound => "model_not_found",
            Category::Format => "format",
            Category::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Retry behavior derived from a category.
#[derive(Debug, Clone, Copy)]
pub struct RetryStrategy {
    pub should_retry: bool,
    pub should_rotate_identity: bool,
    pub should_try_fallback_model: bool,
}

impl Category {
    pub fn retry_strategy(self) -> RetryStrategy {
        match self {
            Category::RateLimit | Category::Overloaded | Category::Timeout | Category::Unknown => {
                RetryStrategy {
                    should_retry: true,
                    should_rotate_identity: true,
                    should_try_fallback_model: matches!(self, Category::RateLimit),
                }
            }
            Category::Quota => RetryStrategy {
                should_retry: true,
                should_rotate_identity: true,
                should_try_fallback_model: true,
            },
            // Auth and billing mark the identity for rotation with a very long cooldown.
            Category::Auth | Category::Billing => RetryStrategy {
                should_retry: true,
                should_rotate_identity: true,
                should_try_fallback_model: false,
            },
            // Format and model_not_found are not the identity's fault.
            Category::ModelNotFound | Category::Format => RetryStrategy {
                should_retry: false,
                should_rotate_identity: false,
                should_try_fallback_model: false,
            },
        }
    }
}

struct Patterns {
    quota: Vec<&'static str>,
    rate_limit: Regex,
    rate_limit_phrases: Vec<&'static str>,
    overloaded: Vec<&'static str>,
    auth_invalid_key: Regex,
    auth_phrases: Vec<&'static str>,
    timeout: Regex,
    timeout_chunks: Regex,
    timeout_abort: Regex,
    timeout_phrases: Vec<&'static str>,
    model_not_found_regex: Regex,
    model_not_found_phrases: Vec<&'static str>,
    format: Vec<&'static str>,
    billing_status: Regex,
    billing_phrases: Vec<&'static str>,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        quota: vec![
            "resource has been exhausted",
            "resource_exhausted",
            "quota exceeded",
            "insufficient_quota",
        ],
        rate_limit: Regex::new(r"(?i)rate[_ ]limit").unwrap(),
        rate_limit_phrases: vec!["too many requests", "exceeded your current quota", "usage limit"],
        overloaded: vec!["overloaded_error", "overloaded", "service unavailable", "high demand"],
        auth_invalid_key: Regex::new(r"(?i)invalid[_ ]api[_ ]key").unwrap(),
        auth_phrases: vec![
            "invalid_grant",
            "token refresh failed",
            "unauthorized",
            "forbidden",
            "re-authenticate",
        ],
        timeout: Regex::new(r"(?i)timeout|timed out|deadline exceeded").unwrap(),
        timeout_chunks: Regex::new(r"(?i)without sending (any )?chunks?").unwrap(),
        timeout_abort: Regex::new(r"(?i)stop reason:\s*abort").unwrap(),
        timeout_phrases: vec![],
        model_not_found_regex: Regex::new(r"(?i)models/\S+ is not found").unwrap(),
        model_not_found_phrases: vec!["unknown model"],
        format: vec!["invalid request format", "string should match pattern"],
        billing_status: Regex::new(r"(?i)status[:=]\s*402").unwrap(),
        billing_phrases: vec!["payment required", "insufficient credits"],
    })
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn is_quota(lower: &str) -> bool {
    contains_any(lower, &patterns().quota)
}

fn is_rate_limit(lower: &str) -> bool {
    patterns().rate_limit.is_match(lower) || contains_any(lower, &patterns().rate_limit_phrases)
}

fn is_overloaded(lower: &str) -> bool {
    contains_any(lower, &patterns().overloaded)
}

fn is_auth(lower: &str) -> bool {
    patterns().auth_invalid_key.is_match(lower) || contains_any(lower, &patterns().auth_phrases)
}

fn is_timeout(lower: &str) -> bool {
    patterns().timeout.is_match(lower)
        || patterns().timeout_chunks.is_match(lower)
        || patterns().timeout_abort.is_match(lower)
        || contains_any(lower, &patterns().timeout_phrases)
}

fn is_model_not_found(lower: &str) -> bool {
    patterns().model_not_found_regex.is_match(lower)
        || contains_any(lower, &patterns().model_not_found_phrases)
}

fn is_format(lower: &str) -> bool {
    contains_any(lower, &patterns().format)
}

fn is_billing(lower: &str) -> bool {
    patterns().billing_status.is_match(lower) || contains_any(lower, &patterns().billing_phrases)
}

/// Extract a leading three-digit HTTP status token, if `text` starts with one
/// (e.g. `"429 too many requests"`).
fn leading_status(text: &str) -> Option<u16> {
    let trimmed = text.trim_start();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() == 3 {
        digits.parse().ok()
    } else {
        None
    }
}

/// Classify the concatenation of an HTTP status (as a leading `"NNN "`
/// token, when available) and response body text into one of nine
/// categories. See module docs for the fixed matching order.
pub fn classify(text: &str) -> Category {
    let lower = text.to_ascii_lowercase();

    if let Some(status) = leading_status(&lower) {
        match status {
            429 => return if is_quota(&lower) { Category::Quota } else { Category::RateLimit },
            401 | 403 => return Category::Auth,
            402 => return Category::Billing,
            404 => return Category::ModelNotFound,
            408 => return Category::Timeout,
            500 | 502 | 503 | 504 | 521 | 522 | 523 | 524 | 529 => return Category::Timeout,
            _ => {}
        }
    }

    if is_model_not_found(&lower) {
        return Category::ModelNotFound;
    }
    if is_quota(&lower) {
        return Category::Quota;
    }
    if is_rate_limit(&lower) {
        return Category::RateLimit;
    }
    if is_overloaded(&lower) {
        return Category::Overloaded;
    }
    if is_auth(&lower) {
        return Category::Auth;
    }
    if is_format(&lower) {
        return Category::Format;
    }
    if is_billing(&lower) {
        return Category::Billing;
    }
    if is_timeout(&lower) {
        return Category::Timeout;
    }

    Category::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_is_total_over_documented_patterns() {
        let cases: &[(&str, Category)] = &[
            ("resource has been exhausted", Category::Quota),
            ("RESOURCE_EXHAUSTED", Category::Quota),
            ("quota exceeded", Category::Quota),
            ("insufficient_quota", Category::Quota),
            ("rate limit hit", Category::RateLimit),
            ("rate_limit exceeded", Category::RateLimit),
            ("too many requests", Category::RateLimit),
            ("exceeded your current quota", Category::RateLimit),
            ("usage limit reached", Category::RateLimit),
            ("overloaded_error", Category::Overloaded),
            ("the model is overloaded", Category::Overloaded),
            ("service unavailable", Category::Overloaded),
            ("high demand right now", Category::Overloaded),
            ("invalid_api_key supplied", Category::Auth),
            ("invalid_grant", Category::Auth),
            ("token refresh failed", Category::Auth),
            ("unauthorized", Category::Auth),
            ("forbidden", Category::Auth),
            ("please re-authenticate", Category::Auth),
            ("connection timeout", Category::Timeout),
            ("request timed out", Category::Timeout),
            ("deadline exceeded", Category::Timeout),
            ("failed without sending any chunks", Category::Timeout),
            ("failed without sending chunks", Category::Timeout),
            ("stop reason: abort", Category::Timeout),
            ("unknown model requested", Category::ModelNotFound),
            ("models/gemini-9000 is not found", Category::ModelNotFound),
            ("invalid request format", Category::Format),
            ("string should match pattern", Category::Format),
            ("status: 402", Category::Billing),
            ("status=402", Category::Billing),
            ("payment required", Category::Billing),
            ("insufficient credits", Category::Billing),
            ("something entirely unrelated", Category::Unknown),
            ("429 too many requests", Category::RateLimit),
            ("429 quota exceeded", Category::Quota),
            ("401 unauthorized", Category::Auth),
            ("403 forbidden", Category::Auth),
            ("402 payment required", Category::Billing),
            ("404 not found", Category::ModelNotFound),
            ("408 request timeout", Category::Timeout),
            ("500 internal server error", Category::Timeout),
            ("502 bad gateway", Category::Timeout),
            ("503 service unavailable", Category::Timeout),
            ("504 gateway timeout", Category::Timeout),
            ("521 web server is down", Category::Timeout),
            ("522 connection timed out", Category::Timeout),
            ("523 origin is unreachable", Category::Timeout),
            ("524 a timeout occurred", Category::Timeout),
            ("529 too many requests to anthropic", Category::Timeout),
        ];
        for (input, expected) in cases {
            assert_eq!(classify(input), *expected, "input: {input}");
        }
    }

    #[test]
    fn priority_quota_over_rate_limit() {
        assert_eq!(
            classify("quota exceeded, also 429 rate limit"),
            Category::Quota
        );
    }

    #[test]
    fn priority_model_not_found_over_quota() {
        assert_eq!(
            classify("unknown model, quota exceeded"),
            Category::ModelNotFound
        );
    }

    #[test]
    fn leading_status_shortcut_beats_pattern_banks() {
        // A 500 body that happens to mention "quota exceeded" should still
        // shortcut to timeout via the leading numeric status.
        assert_eq!(classify("500 quota exceeded downstream"), Category::Timeout);
    }

    #[test]
    fn retry_strategy_auth_and_billing_rotate_without_fallback() {
        assert!(!Category::Auth.retry_strategy().should_try_fallback_model);
        assert!(Category::Auth.retry_strategy().should_rotate_identity);
        assert!(!Category::Billing.retry_strategy().should_try_fallback_model);
    }

    #[test]
    fn retry_strategy_format_and_model_not_found_are_non_retryable() {
        assert!(!Category::Format.retry_strategy().should_retry);
        assert!(!Category::Format.retry_strategy().should_rotate_identity);
        assert!(!Category::ModelNotFound.retry_strategy().should_retry);
    }
}
