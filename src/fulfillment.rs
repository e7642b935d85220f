//! The rotation engine: turns one inbound generation request into zero or
//! more upstream calls against rotating identities until one succeeds.
//!
//! Grounded on `api/proxy.rs`'s `chat_completions` waterfall (the
//! round/identity loop, the inter-identity stagger, the classify-then-decide
//! branch) and its header/payload builders (`build_google_proxy_headers`,
//! `build_google_upstream_request`). The streaming half additionally follows
//! `track_stream_health`'s "don't commit until the first byte arrives" shape
//! for the header-commit trap.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;

use crate::classify::{self, Category};
use crate::concurrency::ConcurrencyGate;
use crate::config::{Config, ModelConfig};
use crate::cooldown::CooldownRegistry;
use crate::error::GatewayError;
use crate::identity::IdentityManager;
use crate::rate_limit::RateLimiter;
use crate::sse::{self, Mode};
use crate::store::{AccountPatch, Identity, PersistenceStore, RequestLog, StatsDelta};

const GOOGLE_API_CLIENT: &str = "gl-node/openclaw";
const GOOGLE_USER_AGENT: &str = "GeminiCLI/0.26.0 (darwin; arm64)";

/// A validated inbound body: `contents` is present and is an array, and the
/// legacy `tool_config` alias has been coalesced into `toolConfig`. Every
/// other field is passed through to the upstream envelope untouched.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub contents: Value,
    pub generation_config: Option<Value>,
    pub system_instruction: Option<Value>,
    pub tools: Option<Value>,
    pub tool_config: Option<Value>,
}

impl GatewayRequest {
    /// Validate and extract the fields the engine forwards upstream. This is
    /// the sole place `contents` is required to be an array — it is the only
    /// inbound shape check the gateway performs before rotation begins.
    pub fn from_value(mut value: Value) -> Result<Self, String> {
        let obj = value
            .as_object_mut()
            .ok_or_else(|| "request body must be a JSON object".to_string())?;
        let contents = obj
            .remove("contents")
            .ok_or_else(|| "missing required field \"contents\"".to_string())?;
        if !contents.is_array() {
            return Err("\"contents\" must be an array".to_string());
        }
        let generation_config = obj.remove("generationConfig");
        let system_instruction = obj.remove("systemInstruction");
        let tools = obj.remove("tools");
        let tool_config = obj.remove("toolConfig").or_else(|| obj.remove("tool_config"));
        Ok(Self {
            contents,
            generation_config,
            system_instruction,
            tools,
            tool_config,
        })
    }
}

/// Rewrite the one upstream model name this gateway does not natively
/// support to the configured fallback, before any call is attempted.
pub fn resolve_model(requested: Option<&str>, models: &ModelConfig) -> String {
    let requested = requested.unwrap_or(&models.default_model);
    if requested == models.unsupported_preview_model {
        models.fallback_model.clone()
    } else {
        requested.to_string()
    }
}

fn build_upstream_payload(model: &str, project_id: &str, req: &GatewayRequest) -> Value {
    let mut contents = req.contents.clone();
    if let Value::Array(items) = &mut contents {
        for item in items.iter_mut() {
            if let Value::Object(map) = item {
                map.entry("role".to_string())
                    .or_insert_with(|| Value::String("user".to_string()));
            }
        }
    }

    let mut inner = Map::new();
    inner.insert("contents".to_string(), contents);
    if let Some(v) = &req.generation_config {
        inner.insert("generationConfig".to_string(), v.clone());
    }
    if let Some(v) = &req.system_instruction {
        inner.insert("systemInstruction".to_string(), v.clone());
    }
    if let Some(v) = &req.tools {
        inner.insert("tools".to_string(), v.clone());
    }
    if let Some(v) = &req.tool_config {
        inner.insert("toolConfig".to_string(), v.clone());
    }

    json!({
        "model": model,
        "project": project_id,
        "user_prompt_id": "default-prompt",
        "request": Value::Object(inner),
    })
}

fn build_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}"))
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-goog-api-client", HeaderValue::from_static(GOOGLE_API_CLIENT));
    headers.insert(USER_AGENT, HeaderValue::from_static(GOOGLE_USER_AGENT));
    headers
}

fn has_content(body: &Value) -> bool {
    body.get("response")
        .and_then(|r| r.get("candidates"))
        .or_else(|| body.get("candidates"))
        .and_then(Value::as_array)
        .map(|arr| !arr.is_empty())
        .unwrap_or(false)
}

fn unwrap_envelope(body: &Value) -> Value {
    body.get("response").cloned().unwrap_or_else(|| body.clone())
}

fn extract_token_count(body: &Value) -> u64 {
    sse::extract_total_token_count(body).unwrap_or(0)
}

fn extract_first_text(unwrapped: &Value) -> String {
    unwrapped
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| parts.iter().find_map(|p| p.get("text")).and_then(Value::as_str))
        .unwrap_or("")
        .to_string()
}

fn summarize_prompt(req: &GatewayRequest) -> String {
    let mut s = req.contents.to_string();
    s.truncate(4000);
    s
}

struct UnaryOutcome {
    status: u16,
    body: Bytes,
    retry_after: Option<std::time::Duration>,
}

enum UnaryOutcomeResult {
    Success(Value),
    /// Carries the upstream's `Retry-After` hint, if the failing response
    /// included one, so the inter-round backoff can use it as its base.
    Continue(Option<std::time::Duration>),
}

enum StreamOutcomeResult {
    Committed(BoxedByteStream),
    Continue(Option<std::time::Duration>),
}

fn extract_retry_after(headers: &reqwest::header::HeaderMap) -> Option<std::time::Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(crate::backoff::parse_retry_after)
}

pub type BoxedByteStream = std::pin::Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Owns everything one inbound request needs to rotate across identities:
/// the shared cache, cooldown/rate-limit state, the concurrency gate, the
/// backoff curve, the persistence layer, and an HTTP client for calls to the
/// upstream Code-Assist endpoint.
pub struct Engine {
    pub identities: Arc<IdentityManager>,
    pub cooldown: CooldownRegistry,
    pub rate_limiter: RateLimiter,
    pub concurrency: ConcurrencyGate,
    pub store: Arc<dyn PersistenceStore>,
    pub http: reqwest::Client,
    pub config: Arc<Config>,
}

impl Engine {
    /// Fulfill one non-streaming generation request, rotating across
    /// identities and, on a 429, across the model fallback chain, until one
    /// call returns content or the rotation budget is exhausted.
    pub async fn generate(
        self: &Arc<Self>,
        requested_model: Option<&str>,
        req: GatewayRequest,
    ) -> Result<Value, GatewayError> {
        let model = resolve_model(requested_model, &self.config.models);

        for attempt in 0..self.config.max_attempts {
            let identities = self
                .identities
                .get_ready_accounts()
                .await
                .map_err(GatewayError::Store)?;
            if identities.is_empty() {
                return Err(GatewayError::RotationExhausted);
            }

            let mut retry_after_hint = None;
            for (i, identity) in identities.iter().enumerate() {
                if !self.admit(identity, i).await {
                    continue;
                }

                let token = match self.identities.ensure_fresh_token(identity).await {
                    Ok(t) => t,
                    Err(err) => {
                        self.record_token_failure(identity, &err).await;
                        continue;
                    }
                };

                match self.try_identity_unary(&model, &token, identity, &req).await {
                    UnaryOutcomeResult::Success(value) => return Ok(value),
                    UnaryOutcomeResult::Continue(hint) => {
                        retry_after_hint = retry_after_hint.or(hint);
                        continue;
                    }
                }
            }

            tokio::time::sleep(self.backoff_delay(attempt, retry_after_hint)).await;
        }

        tracing::warn!(%model, attempts = self.config.max_attempts, "rotation exhausted, no identity fulfilled the request");
        Err(GatewayError::RotationExhausted)
    }

    /// Fulfill one streaming generation request. Returns a boxed byte stream
    /// already rewritten into the public SSE shape, with `[DONE]` appended at
    /// the end. Once a first chunk has been read from an upstream 200, the
    /// gateway is committed to that identity — any later failure ends the
    /// stream rather than falling back, per [`crate::sse::pipe_stream`].
    pub async fn stream_generate(
        self: &Arc<Self>,
        requested_model: Option<&str>,
        req: GatewayRequest,
    ) -> Result<BoxedByteStream, GatewayError> {
        let model = resolve_model(requested_model, &self.config.models);

        for attempt in 0..self.config.max_attempts {
            let identities = self
                .identities
                .get_ready_accounts()
                .await
                .map_err(GatewayError::Store)?;
            if identities.is_empty() {
                return Err(GatewayError::RotationExhausted);
            }

            let mut retry_after_hint = None;
            for (i, identity) in identities.iter().enumerate() {
                if !self.admit(identity, i).await {
                    continue;
                }

                let token = match self.identities.ensure_fresh_token(identity).await {
                    Ok(t) => t,
                    Err(err) => {
                        self.record_token_failure(identity, &err).await;
                        continue;
                    }
                };

                match self.try_identity_stream(&model, &token, identity, &req).await {
                    StreamOutcomeResult::Committed(stream) => return Ok(stream),
                    StreamOutcomeResult::Continue(hint) => {
                        retry_after_hint = retry_after_hint.or(hint);
                        continue;
                    }
                }
            }

            tokio::time::sleep(self.backoff_delay(attempt, retry_after_hint)).await;
        }

        tracing::warn!(%model, attempts = self.config.max_attempts, "rotation exhausted, no identity fulfilled the streaming request");
        Err(GatewayError::RotationExhausted)
    }

    /// Cooldown/probe and rate-limit gating shared by both entry points,
    /// plus the inter-identity stagger before every candidate after the
    /// first in a round.
    async fn admit(&self, identity: &Identity, index_in_round: usize) -> bool {
        if self.cooldown.in_cooldown(&identity.email).await {
            if self.cooldown.should_probe(&identity.email).await {
                self.cooldown.record_probe(&identity.email).await;
            } else {
                return false;
            }
        }

        if !self.rate_limiter.consume(&identity.email).await.allowed {
            return false;
        }

        if index_in_round > 0 {
            tokio::time::sleep(self.config.inter_identity_stagger).await;
        }
        true
    }

    /// Compute the inter-round delay: a server-supplied `Retry-After` hint
    /// takes over as the base in place of the exponential term, per
    /// [`crate::backoff::BackoffPolicy::compute_with_retry_after`]; absent a
    /// hint, the plain exponential curve is used.
    fn backoff_delay(&self, attempt: u32, retry_after_hint: Option<std::time::Duration>) -> std::time::Duration {
        let policy = crate::backoff::BackoffPolicy {
            base: self.config.base_retry_delay,
            max: self.config.max_retry_delay,
            jitter_factor: self.config.jitter_factor,
        };
        match retry_after_hint {
            Some(hint) => policy.compute_with_retry_after(hint),
            None => policy.compute(attempt),
        }
    }

    async fn record_token_failure(&self, identity: &Identity, err: &anyhow::Error) {
        self.cooldown
            .mark_cooldown(&identity.email, classify::classify(&err.to_string()))
            .await;
        let _ = self
            .store
            .increment_account_stats(&identity.email, StatsDelta { failed: 1, ..Default::default() })
            .await;
    }

    async fn record_call_failure(&self, identity: &Identity, category: Category) {
        self.cooldown.mark_cooldown(&identity.email, category).await;
        let _ = self
            .store
            .increment_account_stats(&identity.email, StatsDelta { failed: 1, ..Default::default() })
            .await;
    }

    async fn record_plain_failure(&self, identity: &Identity) {
        tracing::debug!(identity = %identity.email, "non-2xx response, no cooldown applied");
        let _ = self
            .store
            .increment_account_stats(&identity.email, StatsDelta { failed: 1, ..Default::default() })
            .await;
    }

    async fn call_unary(
        &self,
        model: &str,
        token: &str,
        identity: &Identity,
        req: &GatewayRequest,
    ) -> Result<UnaryOutcome, String> {
        let payload = build_upstream_payload(model, &identity.project_id, req);
        let url = format!("{}/v1internal:generateContent", self.config.upstream_base_url);
        let resp = self
            .concurrency
            .run(|| async {
                self.http
                    .post(&url)
                    .headers(build_headers(token))
                    .timeout(self.config.unary_timeout)
                    .json(&payload)
                    .send()
                    .await
            })
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status().as_u16();
        let retry_after = extract_retry_after(resp.headers());
        let body = resp.bytes().await.map_err(|e| e.to_string())?;
        Ok(UnaryOutcome { status, body, retry_after })
    }

    async fn try_identity_unary(
        &self,
        model: &str,
        token: &str,
        identity: &Identity,
        req: &GatewayRequest,
    ) -> UnaryOutcomeResult {
        let outcome = match self.call_unary(model, token, identity, req).await {
            Ok(o) => o,
            Err(err) => {
                self.record_call_failure(identity, classify::classify(&err)).await;
                return UnaryOutcomeResult::Continue(None);
            }
        };

        let body_text = String::from_utf8_lossy(&outcome.body).to_string();

        if outcome.status == 200 {
            if let Ok(body) = serde_json::from_slice::<Value>(&outcome.body) {
                if has_content(&body) {
                    return UnaryOutcomeResult::Success(
                        self.finalize_unary_success(identity, req, &body).await,
                    );
                }
            }
            self.record_plain_failure(identity).await;
            return UnaryOutcomeResult::Continue(None);
        }

        if outcome.status == 429 {
            for fallback_model in self.config.models.fallback_chain(model).into_iter().skip(1) {
                if let Ok(fb) = self.call_unary(&fallback_model, token, identity, req).await {
                    if fb.status == 200 {
                        if let Ok(body) = serde_json::from_slice::<Value>(&fb.body) {
                            if has_content(&body) {
                                return UnaryOutcomeResult::Success(
                                    self.finalize_unary_success(identity, req, &body).await,
                                );
                            }
                        }
                    }
                }
            }
            let category = classify::classify(&format!("429 {body_text}"));
            self.record_call_failure(identity, category).await;
            return UnaryOutcomeResult::Continue(outcome.retry_after);
        }

        // Any non-2xx other than 429 increments the failure counter but
        // does not cool the identity down — only a 429 or a thrown
        // exception does that.
        self.record_plain_failure(identity).await;
        UnaryOutcomeResult::Continue(None)
    }

    async fn finalize_unary_success(&self, identity: &Identity, req: &GatewayRequest, body: &Value) -> Value {
        self.cooldown.mark_success(&identity.email).await;
        let tokens = extract_token_count(body);
        tracing::info!(identity = %identity.email, tokens, "request fulfilled");
        let unwrapped = unwrap_envelope(body);
        let _ = self
            .store
            .increment_account_stats(
                &identity.email,
                StatsDelta { successful: 1, tokens, ..Default::default() },
            )
            .await;
        let _ = self
            .store
            .update_account(
                &identity.email,
                AccountPatch { last_used_at: Some(Utc::now()), ..Default::default() },
            )
            .await;
        let _ = self
            .store
            .add_request_log(RequestLog {
                identity_email: identity.email.clone(),
                prompt: summarize_prompt(req),
                response_text: extract_first_text(&unwrapped),
                token_count: tokens,
                success: true,
                system_instruction: req.system_instruction.as_ref().map(|v| v.to_string()),
                timestamp: Utc::now(),
            })
            .await;
        self.identities.invalidate().await;
        unwrapped
    }

    async fn call_stream(
        &self,
        model: &str,
        token: &str,
        identity: &Identity,
        req: &GatewayRequest,
    ) -> Result<reqwest::Response, String> {
        let payload = build_upstream_payload(model, &identity.project_id, req);
        let url = format!(
            "{}/v1internal:streamGenerateContent?alt=sse",
            self.config.upstream_base_url
        );
        self.concurrency
            .run(|| async {
                self.http
                    .post(&url)
                    .headers(build_headers(token))
                    .timeout(self.config.stream_timeout)
                    .json(&payload)
                    .send()
                    .await
            })
            .await
            .map_err(|e| e.to_string())
    }

    /// Pull the first chunk from an upstream body without committing to it.
    /// `None` means the body ended or failed before any byte arrived — the
    /// caller has not yet handed anything to the downstream client and may
    /// still fall back to another identity or model.
    async fn peek_first_chunk(
        resp: reqwest::Response,
    ) -> Option<(Bytes, impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static)> {
        let mut stream = resp.bytes_stream();
        match stream.next().await {
            Some(Ok(first)) => Some((first, stream)),
            _ => None,
        }
    }

    async fn try_identity_stream(
        self: &Arc<Self>,
        model: &str,
        token: &str,
        identity: &Identity,
        req: &GatewayRequest,
    ) -> StreamOutcomeResult {
        let resp = match self.call_stream(model, token, identity, req).await {
            Ok(r) => r,
            Err(err) => {
                self.record_call_failure(identity, classify::classify(&err)).await;
                return StreamOutcomeResult::Continue(None);
            }
        };

        let status = resp.status().as_u16();
        let retry_after = extract_retry_after(resp.headers());

        if status == 200 {
            if let Some((first, rest)) = Self::peek_first_chunk(resp).await {
                let combined = futures::stream::once(async move { Ok(first) }).chain(rest);
                let stream = self.commit_stream(identity, req, combined).await;
                return StreamOutcomeResult::Committed(stream);
            }
            // Headers were 2xx but the body produced nothing before ending
            // or failing — nothing has been sent downstream yet, so this
            // still falls back normally instead of committing.
            self.record_plain_failure(identity).await;
            return StreamOutcomeResult::Continue(None);
        }

        if status == 429 {
            let body_text = resp.text().await.unwrap_or_default();
            for fallback_model in self.config.models.fallback_chain(model).into_iter().skip(1) {
                if let Ok(fb) = self.call_stream(&fallback_model, token, identity, req).await {
                    if fb.status().as_u16() == 200 {
                        if let Some((first, rest)) = Self::peek_first_chunk(fb).await {
                            let combined = futures::stream::once(async move { Ok(first) }).chain(rest);
                            let stream = self.commit_stream(identity, req, combined).await;
                            return StreamOutcomeResult::Committed(stream);
                        }
                    }
                }
            }
            let category = classify::classify(&format!("429 {body_text}"));
            self.record_call_failure(identity, category).await;
            return StreamOutcomeResult::Continue(retry_after);
        }

        let _ = resp.bytes().await;
        self.record_plain_failure(identity).await;
        StreamOutcomeResult::Continue(None)
    }

    /// Mark the identity healthy and hand back the rewritten stream
    /// immediately; the total token count is only known once the stream
    /// ends, so stats and the request log are finalized in a detached task
    /// that awaits [`crate::sse::pipe_stream`]'s completion signal.
    async fn commit_stream(
        self: &Arc<Self>,
        identity: &Identity,
        req: &GatewayRequest,
        body: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    ) -> BoxedByteStream {
        self.cooldown.mark_success(&identity.email).await;
        tracing::info!(identity = %identity.email, "stream committed");
        let _ = self
            .store
            .update_account(
                &identity.email,
                AccountPatch { last_used_at: Some(Utc::now()), ..Default::default() },
            )
            .await;
        let _ = self
            .store
            .increment_account_stats(&identity.email, StatsDelta { successful: 1, ..Default::default() })
            .await;
        self.identities.invalidate().await;

        let (tx, rx) = oneshot::channel();
        let piped = sse::pipe_stream(body, Mode::Unwrap, tx);

        let engine = Arc::clone(self);
        let email = identity.email.clone();
        let prompt = summarize_prompt(req);
        let system_instruction = req.system_instruction.as_ref().map(|v| v.to_string());
        tokio::spawn(async move {
            if let Ok(Some(tokens)) = rx.await {
                let _ = engine
                    .store
                    .increment_account_stats(
                        &email,
                        StatsDelta { tokens, skip_request_count: true, ..Default::default() },
                    )
                    .await;
                let _ = engine
                    .store
                    .add_request_log(RequestLog {
                        identity_email: email,
                        prompt,
                        response_text: String::new(),
                        token_count: tokens,
                        success: true,
                        system_instruction,
                        timestamp: Utc::now(),
                    })
                    .await;
            }
        });

        Box::pin(piped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use serde_json::json;

    fn models() -> ModelConfig {
        ModelConfig {
            default_model: "gemini-2.5-flash".to_string(),
            fallback_model: "gemini-2.5-pro".to_string(),
            fallback_model_v2: "gemini-3.1-pro".to_string(),
            unsupported_preview_model: "gemini-3.1-pro-preview".to_string(),
        }
    }

    #[test]
    fn from_value_rejects_missing_contents() {
        let err = GatewayRequest::from_value(json!({"generationConfig": {}})).unwrap_err();
        assert!(err.contains("contents"));
    }

    #[test]
    fn from_value_rejects_non_array_contents() {
        let err = GatewayRequest::from_value(json!({"contents": "hi"})).unwrap_err();
        assert!(err.contains("array"));
    }

    #[test]
    fn from_value_coalesces_legacy_tool_config_alias() {
        let req = GatewayRequest::from_value(json!({
            "contents": [],
            "tool_config": {"mode": "AUTO"},
        }))
        .unwrap();
        assert_eq!(req.tool_config, Some(json!({"mode": "AUTO"})));
    }

    #[test]
    fn from_value_prefers_camel_case_alias_when_both_present() {
        let req = GatewayRequest::from_value(json!({
            "contents": [],
            "toolConfig": {"mode": "ANY"},
            "tool_config": {"mode": "AUTO"},
        }))
        .unwrap();
        assert_eq!(req.tool_config, Some(json!({"mode": "ANY"})));
    }

    #[test]
    fn resolve_model_rewrites_unsupported_preview() {
        let m = models();
        assert_eq!(resolve_model(Some("gemini-3.1-pro-preview"), &m), "gemini-2.5-pro");
        assert_eq!(resolve_model(Some("gemini-2.5-flash"), &m), "gemini-2.5-flash");
        assert_eq!(resolve_model(None, &m), "gemini-2.5-flash");
    }

    #[test]
    fn build_upstream_payload_defaults_missing_role_to_user() {
        let req = GatewayRequest::from_value(json!({
            "contents": [{"parts": [{"text": "hi"}]}, {"role": "model", "parts": [{"text": "ok"}]}],
        }))
        .unwrap();
        let payload = build_upstream_payload("gemini-2.5-flash", "proj-1", &req);
        let contents = payload["request"]["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"], json!("user"));
        assert_eq!(contents[1]["role"], json!("model"));
        assert_eq!(payload["model"], json!("gemini-2.5-flash"));
        assert_eq!(payload["project"], json!("proj-1"));
        assert_eq!(payload["user_prompt_id"], json!("default-prompt"));
    }

    #[test]
    fn build_upstream_payload_carries_optional_fields_when_present() {
        let req = GatewayRequest::from_value(json!({
            "contents": [],
            "generationConfig": {"temperature": 0.5},
            "systemInstruction": {"parts": [{"text": "be terse"}]},
            "tools": [{"functionDeclarations": []}],
        }))
        .unwrap();
        let payload = build_upstream_payload("gemini-2.5-flash", "proj-1", &req);
        assert_eq!(payload["request"]["generationConfig"]["temperature"], json!(0.5));
        assert_eq!(payload["request"]["systemInstruction"]["parts"][0]["text"], json!("be terse"));
        assert!(payload["request"]["tools"].is_array());
    }

    #[test]
    fn build_headers_sets_exactly_the_four_required_headers() {
        let headers = build_headers("tok-123");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok-123");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert!(headers.get("x-goog-api-client").is_some());
        assert!(headers.get(USER_AGENT).is_some());
        assert_eq!(headers.len(), 4);
    }

    #[test]
    fn extract_retry_after_reads_the_header_when_present() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, reqwest::header::HeaderValue::from_static("30"));
        assert_eq!(extract_retry_after(&headers), Some(std::time::Duration::from_secs(30)));
        assert_eq!(extract_retry_after(&reqwest::header::HeaderMap::new()), None);
    }

    #[test]
    fn has_content_checks_both_envelope_shapes() {
        assert!(has_content(&json!({"response": {"candidates": [{"content": {}}]}})));
        assert!(has_content(&json!({"candidates": [{"content": {}}]})));
        assert!(!has_content(&json!({"candidates": []})));
        assert!(!has_content(&json!({"error": "boom"})));
    }

    #[test]
    fn unwrap_envelope_lifts_response_when_present() {
        let wrapped = json!({"response": {"candidates": []}, "usageMetadata": {"totalTokenCount": 3}});
        assert_eq!(unwrap_envelope(&wrapped), json!({"candidates": []}));
        let bare = json!({"candidates": []});
        assert_eq!(unwrap_envelope(&bare), bare);
    }

    #[test]
    fn extract_first_text_reads_the_first_part_of_the_first_candidate() {
        let body = json!({
            "candidates": [{"content": {"parts": [{"text": "hello"}, {"text": "ignored"}]}}]
        });
        assert_eq!(extract_first_text(&body), "hello");
        assert_eq!(extract_first_text(&json!({"candidates": []})), "");
    }
}
