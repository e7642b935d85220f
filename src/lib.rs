//! # Gemini Rotation Gateway
//!
//! A reverse-proxy API gateway exposing the Gemini `v1beta` HTTP completion
//! contract, fulfilled by rotating requests across a pool of stored
//! OAuth-authenticated identities against the upstream Code-Assist endpoint.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────┐
//! request ─▶ │   api::serve │
//!            └──────┬───────┘
//!                   ▼
//!            ┌──────────────┐     consults     ┌──────────────────┐
//!            │ fulfillment  │ ───────────────▶ │ cooldown, rate_limit│
//!            │   ::Engine   │ ◀─────────────── │ concurrency, identity│
//!            └──────┬───────┘                  └──────────────────┘
//!                   ▼
//!            upstream Code-Assist endpoint (one identity at a time)
//! ```
//!
//! - `classify`: maps an upstream failure to one of nine categories.
//! - `cooldown`: per-identity in-memory cooldown with escalation and probing.
//! - `rate_limit`: per-identity fixed-window client-side throttle.
//! - `concurrency`: process-wide outbound call semaphore.
//! - `identity`: active-identity cache and single-flight OAuth refresh.
//! - `backoff`: inter-round exponential delay with jitter.
//! - `fulfillment`: the rotation engine tying the above together.
//! - `sse`: upstream SSE rewriting for the streaming endpoint.
//! - `reactivator`: background sweep clearing durable exhaustion flags.
//! - `store` / `store_sqlite`: the persistence contract and its SQLite
//!   implementation.
//! - `error`: fault-level errors mapped to HTTP responses.
//! - `config`: environment-driven configuration.

pub mod api;
pub mod backoff;
pub mod classify;
pub mod concurrency;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod fulfillment;
pub mod identity;
pub mod rate_limit;
pub mod reactivator;
pub mod sse;
pub mod store;
pub mod store_sqlite;

pub use config::Config;
