//! HTTP front end.
//!
//! This module exposes the generation endpoint and the operator endpoints
//! (status, warm-up, catalog, health) on top of the dispatch engine.

mod handlers;
pub mod rate_limit;
mod server;

pub use handlers::{
    validate_inputs, GenerateRequest, GenerateResponse, WarmupResponse, WarmupStatus,
    GENRELAY_BACKEND_HEADER, GENRELAY_LATENCY_MS_HEADER, GENRELAY_REQUEST_ID_HEADER,
    GENRELAY_RETRIES_HEADER,
};
pub use rate_limit::{client_identity, Admission, RateLimiter};
pub use server::{create_router, run_server, AppState, RequestId};
