//! The two public generation endpoints: unary and streaming.
//!
//! Grounded on `proxy.rs`'s `chat_completions` handler for the
//! parse-authenticate-dispatch shape, adapted to the path-embedded action
//! suffix (`{model}:generateContent`) the public contract uses instead of a
//! body field.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::error::GatewayError;
use crate::fulfillment::GatewayRequest;

use super::auth;
use super::routes::AppState;

/// Split `gemini-2.5-flash:generateContent` into its model name and action.
fn split_model_and_action(path_segment: &str) -> Result<(&str, &str), GatewayError> {
    path_segment
        .split_once(':')
        .ok_or_else(|| GatewayError::InvalidRequest("expected \"{model}:action\" in path".to_string()))
}

/// The single route handler for both `{model}:generateContent` and
/// `{model}:streamGenerateContent` — the action suffix lives inside one path
/// segment, so one axum route covers both and dispatches on it here.
pub async fn generate_content(
    State(state): State<Arc<AppState>>,
    Path(model_and_action): Path<String>,
    headers: HeaderMap,
    uri: axum::http::Uri,
    Json(body): Json<Value>,
) -> Response {
    let request_id = uuid::Uuid::new_v4();
    let query = uri.query().unwrap_or("");
    let (model, action) = match split_model_and_action(&model_and_action) {
        Ok(pair) => pair,
        Err(err) => return err.into_response(),
    };
    tracing::info!(%request_id, model, action, "request received");

    if let Err(err) = auth::authenticate(&headers, query, state.store.as_ref()).await {
        return err.into_response();
    }
    let req = match GatewayRequest::from_value(body).map_err(GatewayError::InvalidRequest) {
        Ok(req) => req,
        Err(err) => return err.into_response(),
    };

    match action {
        "streamGenerateContent" => match state.engine.stream_generate(Some(model), req).await {
            Ok(stream) => Response::builder()
                .status(StatusCode::OK)
                .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
                .header(axum::http::header::CACHE_CONTROL, "no-cache")
                .header(axum::http::header::CONNECTION, "keep-alive")
                .header("X-Accel-Buffering", "no")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| GatewayError::Internal.into_response()),
            Err(err) => err.into_response(),
        },
        _ => match state.engine.generate(Some(model), req).await {
            Ok(value) => (StatusCode::OK, Json(value)).into_response(),
            Err(err) => err.into_response(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_model_and_action() {
        assert_eq!(
            split_model_and_action("gemini-2.5-flash:generateContent").unwrap(),
            ("gemini-2.5-flash", "generateContent")
        );
    }

    #[test]
    fn rejects_segment_without_colon() {
        assert!(split_model_and_action("gemini-2.5-flash").is_err());
    }
}
