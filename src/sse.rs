//! Parses upstream SSE, extracts text and token counts, re-emits downstream.
//!
//! Grounded on `api/proxy.rs`'s `normalize_sse_stream`/`normalize_sse_line`
//! (a byte-buffered line rewriter built on `async_stream::stream!`); this
//! module swaps the MiniMax-quirk rewrite for the envelope-unwrap rewrite
//! the public streaming endpoint requires.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::oneshot;

/// Whether a frame's `{response:{...}, usageMetadata?}` envelope is
/// unwrapped before forwarding. The public streaming endpoint unwraps; an
/// admin/verbatim path (not exposed by this gateway, kept for contract
/// completeness) would use `Verbatim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Unwrap,
    Verbatim,
}

/// Rewrite one parsed SSE JSON frame according to `mode`. No-op for
/// `Verbatim`; for `Unwrap`, lifts `response` to the top level and merges
/// any outer `usageMetadata` into the inner object's own.
pub fn transform_frame(value: Value, mode: Mode) -> Value {
    if mode == Mode::Verbatim {
        return value;
    }
    let Some(obj) = value.as_object() else {
        return value;
    };
    let Some(inner) = obj.get("response").cloned() else {
        return value;
    };
    let outer_usage = obj.get("usageMetadata").cloned();
    let mut inner = inner;
    if let (Some(outer), Some(inner_obj)) = (outer_usage, inner.as_object_mut()) {
        match inner_obj.get_mut("usageMetadata") {
            Some(Value::Object(existing)) => {
                if let Value::Object(outer_obj) = outer {
                    for (k, v) in outer_obj {
                        existing.insert(k, v);
                    }
                }
            }
            _ => {
                inner_obj.insert("usageMetadata".to_string(), outer);
            }
        }
    }
    inner
}

/// Extract `usageMetadata.totalTokenCount` from a frame, checking both the
/// envelope (`response.usageMetadata`) and unwrapped (`usageMetadata`)
/// shapes. The latest frame containing a count wins at the call site.
pub fn extract_total_token_count(value: &Value) -> Option<u64> {
    value
        .get("response")
        .and_then(|r| r.get("usageMetadata"))
        .and_then(|u| u.get("totalTokenCount"))
        .and_then(|v| v.as_u64())
        .or_else(|| {
            value
                .get("usageMetadata")
                .and_then(|u| u.get("totalTokenCount"))
                .and_then(|v| v.as_u64())
        })
}

/// Rewrite a single `data: <json>` SSE line. Lines that aren't `data:`
/// frames, or whose payload is `[DONE]` or fails to parse, pass through
/// verbatim, as a fallback for frames that don't parse cleanly. When a
/// frame does parse, `latest_tokens` is updated with its total token count,
/// if present.
fn rewrite_line(line: &[u8], mode: Mode, latest_tokens: &mut Option<u64>) -> Vec<u8> {
    let trimmed = line
        .strip_suffix(b"\r\n")
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line);
    let data_prefix = b"data: ";
    if !trimmed.starts_with(data_prefix) {
        return line.to_vec();
    }
    let json_bytes = &trimmed[data_prefix.len()..];
    let json_trimmed = std::str::from_utf8(json_bytes).unwrap_or("").trim();
    if json_trimmed == "[DONE]" {
        return line.to_vec();
    }

    let Ok(value) = serde_json::from_str::<Value>(json_trimmed) else {
        return line.to_vec();
    };
    if let Some(tokens) = extract_total_token_count(&value) {
        *latest_tokens = Some(tokens);
    }
    let rewritten = transform_frame(value, mode);

    let suffix = if line.ends_with(b"\r\n") {
        &b"\r\n"[..]
    } else if line.ends_with(b"\n") {
        &b"\n"[..]
    } else {
        &b""[..]
    };
    let mut out = Vec::from(&b"data: "[..]);
    let _ = serde_json::to_writer(&mut out, &rewritten);
    out.extend_from_slice(suffix);
    out
}

/// Pipe an upstream SSE byte stream downstream: rewrite each `data:` frame
/// per `mode` and emit a final `data: [DONE]\n\n` once the upstream stream
/// ends cleanly.
///
/// This is the header-commit trap in stream form: once any bytes have been
/// handed to the caller (meaning the downstream HTTP response is already
/// committed), a subsequent upstream error must not surface as an `Err`
/// item — it would look like a protocol fault to the client instead of a
/// plain end of stream. So a mid-stream error simply ends the stream here;
/// whatever was already forwarded stands. `on_complete` fires exactly once,
/// with the latest observed `totalTokenCount`, whether the stream ended
/// cleanly or via a swallowed error — the caller uses it to finalize token
/// accounting and the request log after the response has finished sending.
pub fn pipe_stream(
    inner: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    mode: Mode,
    on_complete: oneshot::Sender<Option<u64>>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        futures::pin_mut!(inner);
        let mut buf = Vec::<u8>::new();
        let mut latest_tokens: Option<u64> = None;
        let mut on_complete = Some(on_complete);
        let mut ended_in_error = false;

        'read: loop {
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line = buf.drain(..=pos).collect::<Vec<u8>>();
                let rewritten = rewrite_line(&line, mode, &mut latest_tokens);
                yield Ok(Bytes::from(rewritten));
            }
            match inner.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(_)) => {
                    ended_in_error = true;
                    break 'read;
                }
                None => break 'read,
            }
        }

        if !ended_in_error && !buf.is_empty() {
            let remaining = std::mem::take(&mut buf);
            let rewritten = rewrite_line(&remaining, mode, &mut latest_tokens);
            yield Ok(Bytes::from(rewritten));
        }
        if let Some(tx) = on_complete.take() {
            let _ = tx.send(latest_tokens);
        }
        if !ended_in_error {
            yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
        }
    }
}
