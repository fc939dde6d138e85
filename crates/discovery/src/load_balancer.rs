//! Connection-tracking load balancer over instance snapshots.
//!
//! Snapshot replacement is serialized through a lock; in-flight counters are
//! plain atomics so request dispatch never blocks on bookkeeping.

use crate::error::{Error, Result};
use crate::registry::{InstanceSnapshot, ServiceInstance};
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Load balancing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancerPolicy {
    /// Circular order over the snapshot.
    #[default]
    RoundRobin,
    /// Uniform pick over the snapshot.
    Random,
    /// Fewest in-flight requests; ties go to the earliest snapshot index.
    LeastConnections,
}

/// Per-service load balancer.
///
/// The snapshot slot is exclusive on replace and shared on read; the cursor
/// and the in-flight counters are atomics. The cursor survives snapshot
/// replacement so round-robin fairness is not reset by instance churn.
pub struct LoadBalancer {
    snapshot: RwLock<InstanceSnapshot>,
    policy: LoadBalancerPolicy,
    cursor: AtomicU64,
    in_flight: DashMap<String, AtomicU64>,
}

impl LoadBalancer {
    /// Create a balancer seeded with an initial snapshot. Counters start at
    /// zero for every instance.
    pub fn new(policy: LoadBalancerPolicy, snapshot: InstanceSnapshot) -> Self {
        let in_flight = DashMap::new();
        for instance in &snapshot.instances {
            in_flight.insert(instance.id.clone(), AtomicU64::new(0));
        }

        Self {
            snapshot: RwLock::new(snapshot),
            policy,
            cursor: AtomicU64::new(0),
            in_flight,
        }
    }

    /// Atomically replace the snapshot and reconcile the counter map:
    /// surviving ids keep their counters, removed ids are dropped, new ids
    /// start at zero.
    pub fn update_instances(&self, snapshot: InstanceSnapshot) {
        let mut slot = self.write_snapshot();

        self.in_flight
            .retain(|id, _| snapshot.instances.iter().any(|i| i.id == *id));
        for instance in &snapshot.instances {
            self.in_flight
                .entry(instance.id.clone())
                .or_insert_with(|| AtomicU64::new(0));
        }

        *slot = snapshot;
    }

    /// Select one instance under the configured policy.
    pub fn get_instance(&self) -> Result<ServiceInstance> {
        let snapshot = self.read_snapshot();
        let n = snapshot.instances.len();
        if n == 0 {
            return Err(Error::NoInstancesAvailable);
        }

        let selected = match self.policy {
            LoadBalancerPolicy::RoundRobin => {
                let count = self.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                (count % n as u64) as usize
            }
            LoadBalancerPolicy::Random => rand::rng().random_range(0..n),
            LoadBalancerPolicy::LeastConnections => {
                let mut min_connections = u64::MAX;
                let mut selected = 0;
                for (idx, instance) in snapshot.instances.iter().enumerate() {
                    let connections = self
                        .in_flight
                        .get(&instance.id)
                        .map(|c| c.load(Ordering::Acquire))
                        .unwrap_or(0);
                    if connections < min_connections {
                        min_connections = connections;
                        selected = idx;
                    }
                }
                selected
            }
        };

        Ok(snapshot.instances[selected].clone())
    }

    /// Mark the start of a request against an instance.
    pub fn instance_begin(&self, instance_id: &str) {
        if let Some(counter) = self.in_flight.get(instance_id) {
            counter.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Mark the end of a request. Saturates at zero and tolerates ids that
    /// a snapshot replacement already removed; never creates a counter.
    pub fn instance_end(&self, instance_id: &str) {
        if let Some(counter) = self.in_flight.get(instance_id) {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        }
    }

    /// Number of instances in the current snapshot.
    pub fn instance_count(&self) -> usize {
        self.read_snapshot().instances.len()
    }

    /// Revision of the current snapshot.
    pub fn revision(&self) -> u64 {
        self.read_snapshot().revision
    }

    /// In-flight count for an instance, if tracked.
    pub fn in_flight(&self, instance_id: &str) -> Option<u64> {
        self.in_flight
            .get(instance_id)
            .map(|c| c.load(Ordering::Acquire))
    }

    fn read_snapshot(&self) -> RwLockReadGuard<'_, InstanceSnapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_snapshot(&self) -> RwLockWriteGuard<'_, InstanceSnapshot> {
        self.snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::collections::HashSet;

    fn instance(id: &str, address: &str) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            service_name: "svc".to_string(),
            address: address.to_string(),
            port: 8080,
            healthy: true,
            metadata: HashMap::new(),
        }
    }

    fn snapshot(revision: u64, ids: &[&str]) -> InstanceSnapshot {
        InstanceSnapshot {
            revision,
            instances: ids
                .iter()
                .enumerate()
                .map(|(i, id)| instance(id, &format!("10.0.0.{}", i + 1)))
                .collect(),
        }
    }

    #[test]
    fn test_round_robin_alternation() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::RoundRobin, snapshot(1, &["a", "b"]));

        let picks: Vec<String> = (0..4).map(|_| lb.get_instance().unwrap().id).collect();
        // Exact alternation; starting parity depends on the cursor.
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
        assert_ne!(picks[0], picks[1]);
    }

    #[test]
    fn test_round_robin_fairness() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::RoundRobin, snapshot(1, &["a", "b", "c"]));

        let mut counts: HashMap<String, usize> = HashMap::new();
        let n = 10;
        for _ in 0..n {
            *counts.entry(lb.get_instance().unwrap().id).or_default() += 1;
        }

        // Every instance is picked between floor(N/n) and ceil(N/n) times.
        for id in ["a", "b", "c"] {
            let count = counts.get(id).copied().unwrap_or(0);
            assert!((3..=4).contains(&count), "instance {} picked {} times", id, count);
        }
    }

    #[test]
    fn test_empty_snapshot_is_unavailable() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::RoundRobin, snapshot(1, &[]));
        assert!(matches!(
            lb.get_instance(),
            Err(Error::NoInstancesAvailable)
        ));
    }

    #[test]
    fn test_random_picks_from_snapshot() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::Random, snapshot(1, &["a", "b", "c"]));
        let valid: HashSet<&str> = ["a", "b", "c"].into();
        for _ in 0..50 {
            let picked = lb.get_instance().unwrap().id;
            assert!(valid.contains(picked.as_str()));
        }
    }

    #[test]
    fn test_update_reconciles_counters() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::LeastConnections, snapshot(1, &["a", "b"]));
        for _ in 0..3 {
            lb.instance_begin("b");
        }

        lb.update_instances(snapshot(2, &["b", "c"]));

        // Key set equals the new snapshot's id set.
        assert_eq!(lb.in_flight("a"), None);
        assert_eq!(lb.in_flight("b"), Some(3));
        assert_eq!(lb.in_flight("c"), Some(0));

        // Least-connections now prefers the fresh instance.
        assert_eq!(lb.get_instance().unwrap().id, "c");
    }

    #[test]
    fn test_least_connections_tie_breaks_on_first_index() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::LeastConnections, snapshot(1, &["a", "b"]));
        assert_eq!(lb.get_instance().unwrap().id, "a");
    }

    #[test]
    fn test_end_saturates_at_zero() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::RoundRobin, snapshot(1, &["a"]));

        lb.instance_end("a");
        assert_eq!(lb.in_flight("a"), Some(0));

        lb.instance_begin("a");
        lb.instance_end("a");
        lb.instance_end("a");
        assert_eq!(lb.in_flight("a"), Some(0));
    }

    #[test]
    fn test_end_on_missing_id_is_noop() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::RoundRobin, snapshot(1, &["a"]));
        lb.instance_end("gone");
        // The end path must never create a counter.
        assert_eq!(lb.in_flight("gone"), None);
    }

    #[test]
    fn test_cursor_survives_snapshot_replacement() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::RoundRobin, snapshot(1, &["a", "b"]));
        let first = lb.get_instance().unwrap().id;

        lb.update_instances(snapshot(2, &["a", "b"]));

        // The very next pick continues the rotation instead of restarting.
        assert_ne!(lb.get_instance().unwrap().id, first);
    }

    #[test]
    fn test_concurrent_begin_end_stays_consistent() {
        use std::sync::Arc;
        use std::thread;

        let lb = Arc::new(LoadBalancer::new(
            LoadBalancerPolicy::LeastConnections,
            snapshot(1, &["a", "b"]),
        ));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lb = Arc::clone(&lb);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    lb.instance_begin("a");
                    lb.instance_end("a");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(lb.in_flight("a"), Some(0));
        assert_eq!(lb.in_flight("b"), Some(0));
    }
}
