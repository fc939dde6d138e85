//! API gateway for a GPU-compute platform.
//!
//! Fronts a fleet of backend services: authenticates clients, enforces
//! per-client rate limits, and dispatches requests to one of two planes.
//!
//! ## Architecture
//!
//! ```text
//! client ── auth gate ── rate limiter ──┬── reverse proxy ── backend instance
//!                                       │     (registry watcher + balancer)
//!                                       └── job handlers ── JOBS stream
//!                                             │
//!                                        job store ◄── jobs.status consumer
//! ```
//!
//! Synchronous traffic under `/services/{service}/...` resolves a logical
//! service name through the registry-fed load balancer and streams the
//! request through. Asynchronous traffic under `/api/v1/jobs` persists a job
//! record and publishes onto the durable jobs stream; worker status updates
//! flow back over `jobs.status` and reconcile the store.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod proxy;
pub mod rate_limit;
pub mod routes;

pub use auth::{Principal, TokenService};
pub use config::Config;
pub use error::ApiError;
pub use proxy::ProxyHandler;
pub use rate_limit::RateLimiter;
pub use routes::{create_router, AppState};

/// Service name the gateway registers under and stamps into `X-Gateway`.
pub const GATEWAY_SERVICE_NAME: &str = "api-gateway";
