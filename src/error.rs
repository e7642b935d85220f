//! Fault-level error types.
//!
//! These are distinct from [`crate::classify::Category`], which models
//! per-call outcomes that are routine and expected, not faults. A
//! `GatewayError` is something an operator needs to know about; it is
//! mapped to an HTTP status at the handler boundary and never echoes
//! internal detail into the response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request body: {0}")]
    InvalidRequest(String),

    #[error("missing or unknown credential")]
    Unauthorized,

    #[error("all identities exhausted or failed")]
    RotationExhausted,

    #[error("persistence error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("internal error")]
    Internal,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            GatewayError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            GatewayError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "Invalid API key".to_string())
            }
            GatewayError::RotationExhausted => (
                StatusCode::SERVICE_UNAVAILABLE,
                "All Gemini accounts exhausted or failed.".to_string(),
            ),
            GatewayError::Store(err) => {
                tracing::error!(error = %err, "persistence failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_string(),
                )
            }
            GatewayError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            ),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn status_and_body(err: GatewayError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn invalid_request_echoes_its_message() {
        let (status, body) = status_and_body(GatewayError::InvalidRequest("bad shape".to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad shape");
    }

    #[tokio::test]
    async fn unauthorized_maps_to_401() {
        let (status, _) = status_and_body(GatewayError::Unauthorized).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rotation_exhausted_maps_to_503() {
        let (status, body) = status_and_body(GatewayError::RotationExhausted).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "All Gemini accounts exhausted or failed.");
    }

    #[tokio::test]
    async fn store_error_never_leaks_internal_detail() {
        let (status, body) =
            status_and_body(GatewayError::Store(anyhow::anyhow!("disk full at /var/secret/path"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal error");
        assert!(!body["error"].as_str().unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn internal_maps_to_500() {
        let (status, body) = status_and_body(GatewayError::Internal).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal error");
    }
}
