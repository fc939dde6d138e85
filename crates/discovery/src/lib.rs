//! Service discovery and load balancing for the gateway's routing fabric.
//!
//! This crate talks to a Consul-compatible registry over its HTTP API:
//! - one-shot discovery and self registration/deregistration,
//! - blocking-query watches that stream instance snapshots,
//! - a connection-tracking load balancer consuming those snapshots.
//!
//! ## Architecture
//!
//! ```text
//! Consul blocking query (index, wait)
//!         ↓
//! ServiceRegistry::watch_service (snapshot channel)
//!         ↓
//! LoadBalancer::update_instances
//!         ↓
//! get_instance / instance_begin / instance_end
//! ```

pub mod error;
pub mod load_balancer;
pub mod registry;

pub use error::{Error, Result};
pub use load_balancer::{LoadBalancer, LoadBalancerPolicy};
pub use registry::{InstanceSnapshot, ServiceInstance, ServiceRegistration, ServiceRegistry};
