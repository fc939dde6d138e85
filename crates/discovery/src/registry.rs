//! Consul-backed service registry client.
//!
//! Uses the registry's HTTP API directly: health queries for discovery,
//! agent endpoints for self registration, and blocking queries (`index` +
//! `wait`) for change watches. Only passing instances are ever surfaced.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Timeout for one-shot registry calls (register, deregister, discover).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Back-off between failed watch iterations.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One healthy endpoint of a named backend service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Stable identifier, unique within the service.
    pub id: String,
    /// Logical service name this instance belongs to.
    pub service_name: String,
    /// Network address (host or IP).
    pub address: String,
    /// Port the instance listens on.
    pub port: u16,
    /// Whether the instance passes its health checks. Discovery only
    /// returns passing instances, so this is `true` for surfaced entries.
    pub healthy: bool,
    /// Opaque registry metadata (versioning, feature flags).
    pub metadata: HashMap<String, String>,
}

/// An immutable view of a service's healthy instances at one registry
/// revision. Snapshots replace each other; they are never merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSnapshot {
    /// Monotonically non-decreasing revision supplied by the registry.
    pub revision: u64,
    /// Instances in registry order.
    pub instances: Vec<ServiceInstance>,
}

/// Health check attached to a registration. HTTP checks are more reliable
/// than TTL checks under load.
#[derive(Debug, Clone, Serialize)]
struct AgentCheck {
    #[serde(rename = "HTTP")]
    http: String,
    #[serde(rename = "Interval")]
    interval: String,
    #[serde(rename = "Timeout")]
    timeout: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_service_after: String,
}

/// Payload for registering a service with the agent.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Meta")]
    pub meta: HashMap<String, String>,
    #[serde(rename = "Check")]
    check: AgentCheck,
}

impl ServiceRegistration {
    /// Build a registration with an HTTP health check against `/health`.
    pub fn new(id: &str, name: &str, address: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            port,
            tags: Vec::new(),
            meta: HashMap::new(),
            check: AgentCheck {
                http: format!("http://{}:{}/health", address, port),
                interval: "10s".to_string(),
                timeout: "5s".to_string(),
                // 30s rather than 15s to reduce flapping.
                deregister_critical_service_after: "30s".to_string(),
            },
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_meta(mut self, meta: HashMap<String, String>) -> Self {
        self.meta = meta;
        self
    }
}

/// Entry returned by the registry's health endpoint.
#[derive(Debug, Deserialize)]
struct HealthServiceEntry {
    #[serde(rename = "Service")]
    service: CatalogService,
}

#[derive(Debug, Deserialize)]
struct CatalogService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

impl From<CatalogService> for ServiceInstance {
    fn from(svc: CatalogService) -> Self {
        ServiceInstance {
            id: svc.id,
            service_name: svc.service,
            address: svc.address,
            port: svc.port,
            healthy: true,
            metadata: svc.meta,
        }
    }
}

/// Registry client for service registration and discovery.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    http: reqwest::Client,
    base_url: String,
}

impl ServiceRegistry {
    /// Create a registry client for the given address (`host:port` or a
    /// full `http://` URL).
    pub fn new(address: &str) -> Result<Self> {
        if address.is_empty() {
            return Err(Error::MissingAddress);
        }

        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
        })
    }

    /// Register a service entry with the registry agent.
    pub async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let response = self
            .http
            .put(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(registration)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        info!(
            "service registered: id={} name={} address={}:{}",
            registration.id, registration.name, registration.address, registration.port
        );
        Ok(())
    }

    /// Remove a service entry. Important for clean shutdowns, otherwise the
    /// registry keeps zombie services around.
    pub async fn deregister(&self, id: &str) -> Result<()> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, id);
        let response = self.http.put(&url).timeout(REQUEST_TIMEOUT).send().await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        info!("service deregistered: id={}", id);
        Ok(())
    }

    /// Find all currently-passing instances of a service.
    pub async fn discover_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let snapshot = self.query_health(service_name, 0, None).await?;
        if snapshot.instances.is_empty() {
            warn!("no healthy instances found for service: {}", service_name);
        } else {
            debug!(
                "discovered {} instances of service {}",
                snapshot.instances.len(),
                service_name
            );
        }
        Ok(snapshot.instances)
    }

    /// Watch a service for changes, emitting a snapshot on every return of
    /// the registry's blocking query (including timeouts, which re-send the
    /// current state; downstream does not need deduplication).
    ///
    /// The watch stops when `shutdown_rx` yields or the receiver is dropped;
    /// the snapshot channel closes once the in-flight query returns.
    pub fn watch_service(
        self: &Arc<Self>,
        service_name: &str,
        wait: Duration,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> mpsc::Receiver<InstanceSnapshot> {
        let (tx, rx) = mpsc::channel(16);
        let registry = Arc::clone(self);
        let name = service_name.to_string();

        tokio::spawn(async move {
            let mut last_index: u64 = 0;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        debug!("watch for service '{}' shutting down", name);
                        break;
                    }

                    result = registry.query_health(&name, last_index, Some(wait)) => {
                        match result {
                            Ok(snapshot) => {
                                last_index = snapshot.revision;
                                if tx.send(snapshot).await.is_err() {
                                    // Downstream dropped the channel.
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("error watching service {}: {}", name, e);
                                // Retry without advancing the index.
                                tokio::time::sleep(WATCH_RETRY_DELAY).await;
                            }
                        }
                    }
                }
            }

            debug!("watch for service '{}' stopped", name);
        });

        rx
    }

    /// Query the registry's health endpoint for passing instances.
    ///
    /// With `wait` set this becomes a blocking query: the registry responds
    /// when its index advances past `index` or the wait elapses. The revision
    /// comes from the `X-Consul-Index` response header.
    async fn query_health(
        &self,
        service_name: &str,
        index: u64,
        wait: Option<Duration>,
    ) -> Result<InstanceSnapshot> {
        let url = format!("{}/v1/health/service/{}", self.base_url, service_name);

        let mut request = self.http.get(&url).query(&[("passing", "true")]);
        request = match wait {
            Some(wait) => request
                .query(&[
                    ("index", index.to_string()),
                    ("wait", format!("{}s", wait.as_secs())),
                ])
                // Leave headroom over the server-side wait so the long poll
                // is not cut off client-side.
                .timeout(wait + Duration::from_secs(10)),
            None => request.timeout(REQUEST_TIMEOUT),
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let revision = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(index);

        let entries: Vec<HealthServiceEntry> = response.json().await?;
        let instances = entries
            .into_iter()
            .map(|entry| entry.service.into())
            .collect();

        Ok(InstanceSnapshot {
            revision,
            instances,
        })
    }
}

async fn status_error(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Error::Status { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let registry = ServiceRegistry::new("localhost:8500").unwrap();
        assert_eq!(registry.base_url, "http://localhost:8500");

        let registry = ServiceRegistry::new("http://consul:8500/").unwrap();
        assert_eq!(registry.base_url, "http://consul:8500");
    }

    #[test]
    fn test_empty_address_rejected() {
        assert!(matches!(
            ServiceRegistry::new(""),
            Err(Error::MissingAddress)
        ));
    }

    #[test]
    fn test_health_entry_deserialization() {
        let payload = r#"[
            {
                "Node": {"Node": "node-1"},
                "Service": {
                    "ID": "svc-a-1",
                    "Service": "svc-a",
                    "Address": "10.0.0.1",
                    "Port": 8080,
                    "Meta": {"version": "1.0.0"}
                },
                "Checks": []
            }
        ]"#;

        let entries: Vec<HealthServiceEntry> = serde_json::from_str(payload).unwrap();
        let instance: ServiceInstance = entries.into_iter().next().unwrap().service.into();
        assert_eq!(instance.id, "svc-a-1");
        assert_eq!(instance.service_name, "svc-a");
        assert_eq!(instance.address, "10.0.0.1");
        assert_eq!(instance.port, 8080);
        assert!(instance.healthy);
        assert_eq!(instance.metadata.get("version"), Some(&"1.0.0".to_string()));
    }

    #[test]
    fn test_missing_meta_defaults_empty() {
        let payload = r#"[
            {"Service": {"ID": "a", "Service": "svc", "Address": "127.0.0.1", "Port": 80}}
        ]"#;

        let entries: Vec<HealthServiceEntry> = serde_json::from_str(payload).unwrap();
        assert!(entries[0].service.meta.is_empty());
    }

    #[test]
    fn test_registration_wire_format() {
        let registration = ServiceRegistration::new("gw-1", "api-gateway", "10.0.0.9", 8080)
            .with_tags(vec!["gateway".to_string()]);

        let json = serde_json::to_value(&registration).unwrap();
        assert_eq!(json["ID"], "gw-1");
        assert_eq!(json["Name"], "api-gateway");
        assert_eq!(json["Port"], 8080);
        assert_eq!(json["Tags"][0], "gateway");
        assert_eq!(json["Check"]["HTTP"], "http://10.0.0.9:8080/health");
        assert_eq!(json["Check"]["Interval"], "10s");
        assert_eq!(json["Check"]["DeregisterCriticalServiceAfter"], "30s");
    }
}
