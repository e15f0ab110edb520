//! Per-client fixed-window admission control.
//!
//! Each client identity gets one [`ClientWindow`]. A request either opens a
//! fresh window (first request, or the old window expired) or increments the
//! current one; once the count exceeds the quota the request is denied. The
//! denied increment is kept, so a client hammering a full window stays denied
//! until the window resets.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::server::AppState;
use crate::config::RateLimitConfig;
use crate::error::Error;

/// Client identity used when neither a forwarded header nor a peer address is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny,
}

/// Request accounting for one client inside the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientWindow {
    pub request_count: u32,
    pub reset_at: Instant,
}

/// Fixed-window rate limiter keyed by client identity.
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<String, ClientWindow>,
    quota: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(quota: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            quota,
            window,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.quota, config.window())
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit or deny one request from `client` now.
    pub fn admit(&self, client: &str) -> Admission {
        self.admit_at(client, Instant::now())
    }

    /// Admit or deny one request from `client` at `now`.
    pub fn admit_at(&self, client: &str, now: Instant) -> Admission {
        // The entry guard holds the shard lock, serializing this client's updates.
        let mut entry = self
            .windows
            .entry(client.to_string())
            .or_insert_with(|| ClientWindow {
                request_count: 0,
                reset_at: now + self.window,
            });
        let window = entry.value_mut();

        if window.request_count == 0 || now > window.reset_at {
            window.request_count = 1;
            window.reset_at = now + self.window;
            return Admission::Allow;
        }

        window.request_count = window.request_count.saturating_add(1);
        if window.request_count > self.quota {
            Admission::Deny
        } else {
            Admission::Allow
        }
    }

    /// Drop windows that expired before `now`. Returns how many were removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| now <= window.reset_at);
        before.saturating_sub(self.windows.len())
    }

    /// Number of clients with a tracked window.
    pub fn active_clients(&self) -> usize {
        self.windows.len()
    }

    /// Sweep expired windows every window length until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.window);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = limiter.sweep_expired(Instant::now());
                if removed > 0 {
                    tracing::debug!(
                        removed,
                        remaining = limiter.active_clients(),
                        "swept expired rate limit windows"
                    );
                }
            }
        })
    }
}

/// Identify the client: first `X-Forwarded-For` entry, else the peer IP.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (forwarded, peer) {
        (Some(first), _) => first.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => UNKNOWN_CLIENT.to_string(),
    }
}

/// Middleware rejecting requests over the client's quota with 429.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identity(request.headers(), peer);

    match state.limiter.admit(&client) {
        Admission::Allow => next.run(request).await,
        Admission::Deny => {
            tracing::warn!(client = %client, path = %request.uri().path(), "Rate limit exceeded");
            Error::RateLimited {
                retry_after_secs: state.limiter.window().as_secs(),
            }
            .into_response()
        }
    }
}
