//! Reverse proxy to discovered backend services.
//!
//! Load balancers are created lazily on the first request for a service;
//! each one gets a registry watcher task that pumps instance snapshots into
//! it for as long as the balancer lives. Request and response bodies are
//! streamed through, never buffered.
//!
//! The upstream scheme is fixed to `http`; TLS to backends is a documented
//! limitation.

use crate::error::ApiError;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Response};
use dashmap::DashMap;
use discovery::{InstanceSnapshot, LoadBalancer, LoadBalancerPolicy, ServiceInstance, ServiceRegistry};
use metrics::{counter, histogram};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Max duration of one registry blocking query.
const WATCH_WAIT: Duration = Duration::from_secs(30);

/// Headers that must not cross the proxy hop, plus `host` which reqwest
/// derives from the upstream URL.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_GATEWAY: HeaderName = HeaderName::from_static("x-gateway");

/// A routed service: its balancer and the handle that stops its watcher.
struct ServiceEntry {
    balancer: Arc<LoadBalancer>,
    watch_shutdown: mpsc::Sender<()>,
}

/// Streams requests through to one healthy instance of a logical service.
pub struct ProxyHandler {
    registry: Arc<ServiceRegistry>,
    services: DashMap<String, ServiceEntry>,
    http: reqwest::Client,
    gateway_header: HeaderValue,
}

/// Releases the in-flight slot on every exit path, including panics.
struct InFlightGuard {
    balancer: Arc<LoadBalancer>,
    instance_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.balancer.instance_end(&self.instance_id);
    }
}

impl ProxyHandler {
    pub fn new(registry: Arc<ServiceRegistry>, gateway_id: &str) -> Self {
        Self {
            registry,
            services: DashMap::new(),
            http: reqwest::Client::new(),
            gateway_header: HeaderValue::from_str(gateway_id)
                .unwrap_or_else(|_| HeaderValue::from_static("api-gateway")),
        }
    }

    /// Proxy one request to an instance of `service`.
    pub async fn handle(
        &self,
        service: &str,
        req: Request,
        peer: Option<SocketAddr>,
    ) -> Result<Response<Body>, ApiError> {
        let start = Instant::now();

        let balancer = self.balancer_for(service).await?;
        let instance = balancer
            .get_instance()
            .map_err(|_| ApiError::ServiceUnavailable)?;

        balancer.instance_begin(&instance.id);
        let _guard = InFlightGuard {
            balancer: Arc::clone(&balancer),
            instance_id: instance.id.clone(),
        };

        match self.forward(service, &instance, req, peer).await {
            Ok(response) => {
                histogram!(
                    "gateway_upstream_request_duration_seconds",
                    "service" => service.to_string()
                )
                .record(start.elapsed().as_secs_f64());
                counter!(
                    "gateway_upstream_requests_total",
                    "service" => service.to_string(),
                    "status" => "success"
                )
                .increment(1);
                Ok(response)
            }
            Err(e) => {
                error!(
                    "proxy error: service={} instance={} target={}:{} error={}",
                    service, instance.id, instance.address, instance.port, e
                );
                counter!(
                    "gateway_upstream_requests_total",
                    "service" => service.to_string(),
                    "status" => "error"
                )
                .increment(1);
                // No retries; clients or their SDKs decide.
                Err(ApiError::BadGateway)
            }
        }
    }

    /// Get the service's balancer, constructing it (and spawning its
    /// watcher) on first use.
    async fn balancer_for(&self, service: &str) -> Result<Arc<LoadBalancer>, ApiError> {
        if let Some(entry) = self.services.get(service) {
            return Ok(Arc::clone(&entry.balancer));
        }

        let instances = self
            .registry
            .discover_service(service)
            .await
            .map_err(|e| {
                error!("failed to discover service {}: {}", service, e);
                ApiError::ServiceUnavailable
            })?;
        if instances.is_empty() {
            return Err(ApiError::ServiceUnavailable);
        }

        // Two requests can race here; the entry API keeps a single winner
        // and the loser's discovery result is discarded.
        let entry = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| self.start_service(service, instances));

        Ok(Arc::clone(&entry.balancer))
    }

    fn start_service(&self, service: &str, instances: Vec<ServiceInstance>) -> ServiceEntry {
        let balancer = Arc::new(LoadBalancer::new(
            LoadBalancerPolicy::RoundRobin,
            InstanceSnapshot {
                revision: 0,
                instances,
            },
        ));

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let mut snapshots = self
            .registry
            .watch_service(service, WATCH_WAIT, shutdown_rx);

        let pump = Arc::clone(&balancer);
        let name = service.to_string();
        tokio::spawn(async move {
            while let Some(snapshot) = snapshots.recv().await {
                info!(
                    "updated load balancer for service {} with {} instances (revision {})",
                    name,
                    snapshot.instances.len(),
                    snapshot.revision
                );
                pump.update_instances(snapshot);
            }
            debug!("snapshot pump for service {} stopped", name);
        });

        ServiceEntry {
            balancer,
            watch_shutdown: shutdown_tx,
        }
    }

    async fn forward(
        &self,
        service: &str,
        instance: &ServiceInstance,
        req: Request,
        peer: Option<SocketAddr>,
    ) -> anyhow::Result<Response<Body>> {
        // Path and raw query are forwarded verbatim; only the
        // /services/{service} prefix is stripped.
        let path = upstream_path(req.uri().path());
        let mut url = format!("http://{}:{}{}", instance.address, instance.port, path);
        if let Some(query) = req.uri().query() {
            url.push('?');
            url.push_str(query);
        }

        debug!(
            "proxying request: service={} instance={} target={} method={}",
            service,
            instance.id,
            url,
            req.method()
        );

        let method = req.method().clone();
        let headers = build_upstream_headers(req.headers(), peer, &self.gateway_header);
        let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());

        let upstream = self
            .http
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let mut builder = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name.as_str()) {
                builder = builder.header(name, value);
            }
        }

        Ok(builder.body(Body::from_stream(upstream.bytes_stream()))?)
    }

    /// Services with an active balancer.
    pub fn services(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop all watcher tasks. Called during graceful shutdown.
    pub async fn shutdown(&self) {
        let senders: Vec<mpsc::Sender<()>> = self
            .services
            .iter()
            .map(|e| e.watch_shutdown.clone())
            .collect();
        for sender in senders {
            let _ = sender.send(()).await;
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Strip the `/services/{service}` routing prefix from the raw request
/// path, leaving the path the backend expects. Works on the undecoded path
/// so percent-encoding survives verbatim.
fn upstream_path(path: &str) -> &str {
    let after = path.strip_prefix("/services/").unwrap_or(path);
    match after.find('/') {
        Some(idx) => &after[idx..],
        None => "/",
    }
}

/// Copy end-to-end headers and apply the gateway's forwarding conventions:
/// `X-Forwarded-For` and `X-Forwarded-Proto` are only set when absent,
/// `X-Gateway` is always stamped.
fn build_upstream_headers(
    inbound: &HeaderMap,
    peer: Option<SocketAddr>,
    gateway_header: &HeaderValue,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if !is_hop_by_hop(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    if !headers.contains_key(&X_FORWARDED_FOR) {
        if let Some(peer) = peer {
            if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
    }

    if !headers.contains_key(&X_FORWARDED_PROTO) {
        // The gateway does not terminate TLS, so inbound connections are
        // plain HTTP.
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    headers.insert(X_GATEWAY, gateway_header.clone());

    headers
}
