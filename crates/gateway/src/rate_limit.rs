//! Per-client token-bucket rate limiting.
//!
//! Buckets are created lazily on first use and reclaimed by a TTL sweeper,
//! so memory stays bounded by the number of distinct clients seen in a TTL
//! window. The lookup path takes the shared lock; the exclusive lock is only
//! needed to insert a new bucket or delete expired ones.

use crate::error::ApiError;
use crate::routes::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Token bucket for one client key.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Keyed token-bucket rate limiter.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    /// Refill rate in tokens per second.
    rate: f64,
    /// Burst capacity; buckets start full.
    burst: f64,
    /// Keys idle longer than this are swept.
    ttl: Duration,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: u32, ttl: Duration) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            rate,
            burst: f64::from(burst),
            ttl,
        }
    }

    /// Admit or reject one request for the key. Costs exactly one token.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let bucket = self.bucket_for(key, now);
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);

        // Continuous refill up to the burst capacity.
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Look up a bucket, creating it full on first use. Optimistic read
    /// first, then the double-checked write path.
    fn bucket_for(&self, key: &str, now: Instant) -> Arc<Mutex<Bucket>> {
        {
            let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(bucket) = buckets.get(key) {
                return Arc::clone(bucket);
            }
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        // Re-check: another task may have created it between the locks.
        Arc::clone(buckets.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Bucket {
                tokens: self.burst,
                last_refill: now,
                last_seen: now,
            }))
        }))
    }

    /// Remove keys idle longer than the TTL. Expired keys are collected
    /// under shared access; the exclusive lock is held only for the deletes.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) {
        let expired: Vec<String> = {
            let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            buckets
                .iter()
                .filter(|(_, bucket)| {
                    let bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
                    now.saturating_duration_since(bucket.last_seen) > self.ttl
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        if expired.is_empty() {
            return;
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for key in expired {
            // Re-check under the exclusive lock; the key may have been hit
            // since enumeration.
            let still_expired = buckets.get(&key).is_some_and(|bucket| {
                let bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
                now.saturating_duration_since(bucket.last_seen) > self.ttl
            });
            if still_expired {
                buckets.remove(&key);
                removed += 1;
            }
        }
        drop(buckets);

        if removed > 0 {
            debug!("cleaned up {} idle rate limit buckets", removed);
        }
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic sweeper. Runs every TTL until `shutdown_rx` yields.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.ttl);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        debug!("rate limiter sweeper shutting down");
                        break;
                    }

                    _ = ticker.tick() => {
                        limiter.sweep();
                    }
                }
            }
        })
    }
}

/// Derive the rate-limit key for a request: the first address in
/// `X-Forwarded-For` when present and parseable, otherwise the peer host.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        // The header may carry a comma-separated chain; the first entry is
        // the originating client.
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return ip.to_string();
            }
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Admission middleware in front of the routed planes.
pub async fn rate_limit_mw(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let key = client_key(req.headers(), peer);

    if !state.limiter.allow(&key) {
        warn!("rate limit exceeded for client: {}", key);
        return Err(ApiError::RateLimited);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_burst_then_deny_then_refill() {
        let limiter = RateLimiter::new(2.0, 3, Duration::from_secs(3600));
        let t0 = Instant::now();

        // Full bucket admits the burst, then denies.
        for _ in 0..3 {
            assert!(limiter.allow_at("client", t0));
        }
        assert!(!limiter.allow_at("client", t0));
        assert!(!limiter.allow_at("client", t0));

        // One idle second refills two tokens at r=2/s.
        let t1 = t0 + Duration::from_secs(1);
        assert!(limiter.allow_at("client", t1));
        assert!(limiter.allow_at("client", t1));
        assert!(!limiter.allow_at("client", t1));
    }

    #[test]
    fn test_admissions_bounded_by_bucket_capacity() {
        let rate = 2.0;
        let burst = 3;
        let limiter = RateLimiter::new(rate, burst, Duration::from_secs(3600));
        let t0 = Instant::now();

        // Over a window T, admissions can never exceed floor(b + r*T).
        let window_secs = 5u64;
        let mut admitted = 0;
        for step in 0..(window_secs * 10) {
            let now = t0 + Duration::from_millis(step * 100);
            if limiter.allow_at("client", now) {
                admitted += 1;
            }
        }
        assert!(admitted as f64 <= f64::from(burst) + rate * window_secs as f64);
    }

    #[test]
    fn test_refill_never_exceeds_burst() {
        let limiter = RateLimiter::new(10.0, 3, Duration::from_secs(3600));
        let t0 = Instant::now();
        assert!(limiter.allow_at("client", t0));

        // A long idle period still caps the bucket at the burst size.
        let later = t0 + Duration::from_secs(3600);
        for _ in 0..3 {
            assert!(limiter.allow_at("client", later));
        }
        assert!(!limiter.allow_at("client", later));
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = RateLimiter::new(1.0, 1, Duration::from_secs(3600));
        let t0 = Instant::now();
        assert!(limiter.allow_at("a", t0));
        assert!(!limiter.allow_at("a", t0));
        assert!(limiter.allow_at("b", t0));
    }

    #[test]
    fn test_sweep_removes_only_idle_keys() {
        let limiter = RateLimiter::new(1.0, 1, Duration::from_secs(60));
        let t0 = Instant::now();
        limiter.allow_at("idle", t0);
        limiter.allow_at("busy", t0 + Duration::from_secs(90));

        limiter.sweep_at(t0 + Duration::from_secs(120));

        assert_eq!(limiter.len(), 1);
        // The surviving key was seen within the TTL window.
        limiter.allow_at("busy", t0 + Duration::from_secs(121));
    }

    #[test]
    fn test_client_key_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let peer: SocketAddr = "192.168.1.5:9999".parse().unwrap();

        assert_eq!(client_key(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn test_client_key_falls_back_to_peer_on_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        let peer: SocketAddr = "192.168.1.5:9999".parse().unwrap();

        assert_eq!(client_key(&headers, Some(peer)), "192.168.1.5");
        assert_eq!(client_key(&HeaderMap::new(), Some(peer)), "192.168.1.5");
        assert_eq!(client_key(&HeaderMap::new(), None), "unknown");
    }
}
