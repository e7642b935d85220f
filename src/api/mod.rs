//! HTTP surface: the Gemini `v1beta` generation contract.
//!
//! - `POST /v1beta/models/{model}:generateContent` — unary completion.
//! - `POST /v1beta/models/{model}:streamGenerateContent` — SSE completion.
//!
//! Both accept the same three credential forms (§6 of the storage contract);
//! everything else — identity rotation, cooldowns, the upstream wire
//! contract — lives in [`crate::fulfillment`].

mod auth;
mod generate;
mod routes;

pub use routes::serve;
