//! Client credential extraction for the generation endpoints.
//!
//! Grounded on `proxy.rs`'s `verify_proxy_auth` (extract-then-delegate
//! shape) but widened to the three forms the public contract accepts, and
//! delegating validation to the persistence layer instead of a
//! constant-time string compare.

use axum::http::HeaderMap;

use crate::error::GatewayError;
use crate::store::PersistenceStore;

/// Extract the opaque client credential from whichever of the three
/// accepted forms is present: `Authorization: Bearer <key>`, header
/// `x-goog-api-key: <key>`, or query parameter `key=<key>`. First match
/// wins, in that order.
pub fn extract_credential(headers: &HeaderMap, query: &str) -> Option<String> {
    if let Some(bearer) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer.to_string());
    }
    if let Some(key) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    query_param(query, "key")
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        if key == name {
            Some(parts.next().unwrap_or("").to_string())
        } else {
            None
        }
    })
}

/// Extract and validate the request's client credential. Missing or unknown
/// credentials both map to [`GatewayError::Unauthorized`].
pub async fn authenticate(
    headers: &HeaderMap,
    query: &str,
    store: &dyn PersistenceStore,
) -> Result<(), GatewayError> {
    let Some(credential) = extract_credential(headers, query) else {
        return Err(GatewayError::Unauthorized);
    };
    let valid = store.validate_api_key(&credential).await.map_err(GatewayError::Store)?;
    if valid {
        Ok(())
    } else {
        Err(GatewayError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AccountPatch, Identity, RequestLog, StatsDelta};
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use chrono::{DateTime, Utc};

    struct FakeStore {
        accepted: &'static str,
    }

    #[async_trait]
    impl PersistenceStore for FakeStore {
        async fn get_active_accounts(&self) -> anyhow::Result<Vec<Identity>> {
            Ok(vec![])
        }
        async fn update_account(&self, _email: &str, _patch: AccountPatch) -> anyhow::Result<()> {
            Ok(())
        }
        async fn increment_account_stats(&self, _email: &str, _delta: StatsDelta) -> anyhow::Result<()> {
            Ok(())
        }
        async fn reactivate_exhausted_accounts(&self, _cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
            Ok(0)
        }
        async fn add_request_log(&self, _entry: RequestLog) -> anyhow::Result<()> {
            Ok(())
        }
        async fn validate_api_key(&self, key: &str) -> anyhow::Result<bool> {
            Ok(key == self.accepted)
        }
    }

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-abc"));
        assert_eq!(extract_credential(&headers, ""), Some("sk-abc".to_string()));
    }

    #[test]
    fn extracts_goog_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("sk-abc"));
        assert_eq!(extract_credential(&headers, ""), Some("sk-abc".to_string()));
    }

    #[test]
    fn extracts_key_query_param() {
        let headers = HeaderMap::new();
        assert_eq!(extract_credential(&headers, "key=sk-abc&alt=sse"), Some("sk-abc".to_string()));
    }

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-header"));
        assert_eq!(extract_credential(&headers, "key=sk-query"), Some("sk-header".to_string()));
    }

    #[test]
    fn no_credential_present_returns_none() {
        let headers = HeaderMap::new();
        assert_eq!(extract_credential(&headers, ""), None);
    }

    #[tokio::test]
    async fn authenticate_accepts_known_key_and_rejects_unknown() {
        let store = FakeStore { accepted: "sk-good" };
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-good"));
        assert!(authenticate(&headers, "", &store).await.is_ok());

        let mut bad_headers = HeaderMap::new();
        bad_headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-bad"));
        assert!(matches!(
            authenticate(&bad_headers, "", &store).await,
            Err(GatewayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn authenticate_rejects_missing_credential() {
        let store = FakeStore { accepted: "sk-good" };
        let headers = HeaderMap::new();
        assert!(matches!(
            authenticate(&headers, "", &store).await,
            Err(GatewayError::Unauthorized)
        ));
    }
}
