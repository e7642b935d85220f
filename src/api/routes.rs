//! Application wiring: shared state and the HTTP server entry point.
//!
//! Grounded on this codebase's `serve()` startup sequence (construct every
//! long-lived collaborator, spawn background tasks, build the router, bind,
//! serve with graceful shutdown) and its `AppState`-behind-`Arc` pattern.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::fulfillment::Engine;
use crate::identity::IdentityManager;
use crate::store::PersistenceStore;
use crate::store_sqlite::SqliteStore;

use super::generate;

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn PersistenceStore>,
    pub engine: Arc<Engine>,
}

/// Not part of the public generation contract; a bare liveness probe for
/// whatever load balancer sits in front of this process.
async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Assemble the router over an already-constructed [`AppState`]. Split out
/// of [`serve`] so tests can drive the HTTP surface directly against a
/// mocked upstream without going through the bind/listen/shutdown dance.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v1beta/models/:model_and_action",
            post(generate::generate_content),
        )
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build every collaborator, spawn the background reactivator, bind, and
/// serve until a shutdown signal arrives.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open(&config.database_path)?);

    let http = reqwest::Client::new();

    let identities = Arc::new(IdentityManager::new(
        Arc::clone(&store),
        http.clone(),
        config.oauth_refresh_url.clone(),
        config.identity_cache_ttl,
        config.token_refresh_margin,
    ));
    identities.warm().await?;

    let engine = Arc::new(Engine {
        identities: Arc::clone(&identities),
        cooldown: crate::cooldown::CooldownRegistry::new(config.probe_margin, config.min_probe_interval),
        rate_limiter: crate::rate_limit::RateLimiter::new(config.rate_limit_max, config.rate_limit_window),
        concurrency: crate::concurrency::ConcurrencyGate::new(config.concurrency_cap),
        store: Arc::clone(&store),
        http,
        config: Arc::clone(&config),
    });

    let reactivator_handle = crate::reactivator::spawn(
        Arc::clone(&store),
        config.reactivator_interval,
        config.exhaustion_cooldown,
    );

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        engine,
    });

    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reactivator_handle.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthz_reports_ok() {
        let Json(body) = healthz().await;
        assert_eq!(body, json!({"status": "ok"}));
    }
}
