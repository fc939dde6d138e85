//! HTTP surface wiring.
//!
//! Route map:
//! - `GET /health`, `GET /metrics` — unauthenticated, outside rate limiting
//! - `POST /auth/login`, `POST /auth/register`, `GET /auth/profile`
//! - `/api/v1/jobs...` — bearer-authenticated job plane
//! - `GET /api/v1/admin-stats`, `/admin/` — bearer + admin role
//! - `/services/{service}/...` — transparent reverse proxy plane

use crate::auth::{self, TokenService};
use crate::config::Config;
use crate::error::ApiError;
use crate::handlers::auth::UserDirectory;
use crate::handlers::{admin, auth as auth_handlers, jobs};
use crate::proxy::ProxyHandler;
use crate::rate_limit::{self, RateLimiter};
use axum::extract::{ConnectInfo, MatchedPath, Path, Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use job_store::JobStore;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use nats_client::NatsClient;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

/// End-to-end deadline for every request; upstream I/O lives inside it.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Application state shared across handlers.
pub struct AppState {
    pub config: Config,
    pub tokens: TokenService,
    pub users: UserDirectory,
    pub store: JobStore,
    pub nats: NatsClient,
    pub proxy: ProxyHandler,
    pub limiter: Arc<RateLimiter>,
    pub metrics: PrometheusHandle,
}

/// Create the gateway router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth_mw = middleware::from_fn_with_state(Arc::clone(&state), auth::require_auth);
    let admin_mw = middleware::from_fn(|req: Request, next: Next| async move {
        auth::require_role("admin", req, next).await
    });

    let auth_routes = Router::new()
        .route("/login", post(auth_handlers::login))
        .route("/register", post(auth_handlers::register))
        .merge(
            Router::new()
                .route("/profile", get(auth_handlers::profile))
                .route_layer(auth_mw.clone()),
        );

    let api_v1 = Router::new()
        .route("/status", get(api_status))
        .merge(
            Router::new()
                .route("/jobs", post(jobs::submit_job).get(jobs::list_jobs))
                .route(
                    "/jobs/{job_id}",
                    get(jobs::get_job_status).delete(jobs::cancel_job),
                )
                .route("/jobs/status/{status}", get(jobs::list_jobs_by_status))
                .merge(
                    Router::new()
                        .route("/admin-stats", get(admin::admin_stats))
                        .route_layer(admin_mw.clone()),
                )
                .route_layer(auth_mw.clone()),
        );

    let admin_area = Router::new()
        .route("/", get(admin::dashboard))
        .route_layer(admin_mw)
        .route_layer(auth_mw);

    // Everything below admission control; /health and /metrics stay outside
    // so health checkers and scrapers are never throttled.
    let rate_limited = Router::new()
        .nest("/auth", auth_routes)
        .nest("/api/v1", api_v1)
        .nest("/admin", admin_area)
        .route("/services/{service}/{*rest}", any(proxy_route))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::rate_limit_mw,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(rate_limited)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(middleware::from_fn(track_http))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

/// GET /health — kept trivial; the registry's health check hits this.
async fn health() -> &'static str {
    "OK"
}

/// GET /metrics — Prometheus text exposition.
async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}

/// GET /api/v1/status
async fn api_status() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "operational",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Transparent proxy entry point for `/services/{service}/...`.
async fn proxy_route(
    State(state): State<Arc<AppState>>,
    Path((service, _rest)): Path<(String, String)>,
    req: Request,
) -> Result<Response, ApiError> {
    if service.is_empty() {
        return Err(ApiError::BadRequest("Service name is required".to_string()));
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);

    state.proxy.handle(&service, req, peer).await
}

/// Decrements the in-flight gauge on drop, so cancelled and panicking
/// requests are still accounted for.
struct InFlightGauge;

impl InFlightGauge {
    fn enter() -> Self {
        gauge!("gateway_in_flight_requests").increment(1.0);
        Self
    }
}

impl Drop for InFlightGauge {
    fn drop(&mut self) {
        gauge!("gateway_in_flight_requests").decrement(1.0);
    }
}

/// Record request count, duration, and in-flight gauge for every request.
async fn track_http(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    // The matched route template keeps label cardinality bounded.
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let _in_flight = InFlightGauge::enter();
    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    counter!(
        "http_requests_total",
        "status" => status,
        "method" => method.clone(),
        "path" => path.clone()
    )
    .increment(1);
    histogram!(
        "http_request_duration_seconds",
        "method" => method,
        "path" => path
    )
    .record(start.elapsed().as_secs_f64());

    response
}

/// Build the CORS layer from the configured allow-lists.
fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let methods: Vec<Method> = config
        .cors_allowed_methods
        .iter()
        .filter_map(|method| method.parse().ok())
        .collect();
    let headers: Vec<HeaderName> = config
        .cors_allowed_headers
        .iter()
        .filter_map(|header| header.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
}

/// Trap handler panics into a clean 500. Panic detail goes to the log, never
/// to the client.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic payload".to_string()
    };

    error!("panic recovered in request handler: {}", detail);

    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}
