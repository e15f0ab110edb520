//! HTTP server setup and lifecycle.

use axum::{
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::handlers;
use super::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::config::Config;
use crate::dispatch::{DispatchEngine, HttpTransport};
use crate::prompt::Language;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the engine and limiter for `config` around `engine`.
    pub fn new(config: Config, engine: DispatchEngine) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            engine: Arc::new(engine),
            config: Arc::new(config),
        }
    }
}

/// Correlation id attached to every request as an extension.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

async fn inject_request_id(mut request: Request<Body>, next: Next) -> Response {
    request.extensions_mut().insert(RequestId(Uuid::new_v4()));
    next.run(request).await
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    // Only calls that reach the backends count against the client's quota
    let limited = Router::new()
        .route("/generate", post(handlers::generate))
        .route("/warmup", post(handlers::warmup))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .merge(limited)
        .route("/status", get(handlers::status))
        .route("/backends", get(handlers::list_backends))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(middleware::from_fn(inject_request_id))
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until ctrl-c.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    let transport = HttpTransport::new(
        config.upstream.base_url.clone(),
        Duration::from_millis(config.upstream.connect_timeout_ms),
    )?;
    let engine = DispatchEngine::from_config(&config, Arc::new(transport));
    if !engine.has_credential() {
        tracing::warn!("No upstream credential configured; /generate will answer 503");
    }

    let state = AppState::new(config, engine);
    let sweeper = state.limiter.spawn_sweeper();

    if state.config.warmup.on_start && state.engine.has_credential() {
        let engine = state.engine.clone();
        let prompt = state.config.warmup.prompt.clone();
        tokio::spawn(async move {
            match engine.dispatch(&prompt, Language::English).await {
                Ok(result) => tracing::info!(
                    backend = result.backend_used.as_deref().unwrap_or("-"),
                    "Startup warm-up succeeded"
                ),
                Err(e) => tracing::warn!(error = %e, "Startup warm-up failed"),
            }
        });
    }

    let engine = state.engine.clone();
    let backends = engine.catalog().len();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, backends, "Starting genrelay server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    engine.shutdown();
    tracing::info!("genrelay server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
