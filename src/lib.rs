//! genrelay - Multi-backend text generation relay
//!
//! This library provides the core of the genrelay server: the backend
//! catalog, prompt formatting, dispatch with retry and failover, background
//! recovery, response normalization and per-client rate limiting.

pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod normalize;
pub mod prompt;
pub mod proxy;

pub use config::Config;
pub use error::{Error, Result};
