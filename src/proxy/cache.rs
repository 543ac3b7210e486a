//! In-process response cache for idempotent reads

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Response, StatusCode};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone)]
struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    expires_at: Instant,
}

/// TTL cache of successful GET responses, keyed by method, path and query
#[derive(Debug)]
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CachedResponse>>,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CachedResponse>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cache key for a request; `None` when the method is not cacheable
    pub fn key(method: &Method, path: &str, query: Option<&str>) -> Option<String> {
        if method != Method::GET {
            return None;
        }
        Some(match query {
            Some(q) if !q.is_empty() => format!("GET:{}?{}", path, q),
            _ => format!("GET:{}", path),
        })
    }

    /// A fresh copy of the cached response, marked with `X-Cache: HIT`
    pub fn get(&self, key: &str) -> Option<Response<Body>> {
        let mut entries = self.entries();
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            entries.remove(key);
            return None;
        }

        let mut response = Response::new(Body::from(entry.body.clone()));
        *response.status_mut() = entry.status;
        *response.headers_mut() = entry.headers.clone();
        response
            .headers_mut()
            .insert("x-cache", HeaderValue::from_static("HIT"));
        debug!("Cache hit for {}", key);
        Some(response)
    }

    /// Store a response. Only 2xx responses are kept.
    pub fn put(&self, key: String, status: StatusCode, headers: &HeaderMap, body: Bytes, ttl: Duration) {
        if !status.is_success() || ttl.is_zero() {
            return;
        }

        let mut entries = self.entries();
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let now = Instant::now();
            entries.retain(|_, entry| entry.expires_at > now);
            if entries.len() >= self.max_entries {
                return;
            }
        }

        entries.insert(
            key,
            CachedResponse {
                status,
                headers: headers.clone(),
                body,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Sweep expired entries on a fixed interval
    pub fn spawn_purge(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!("Response cache purged {} expired entries", removed);
                }
            }
        })
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers
    }

    #[test]
    fn test_only_get_is_cacheable() {
        assert_eq!(
            ResponseCache::key(&Method::GET, "/api/v1/pricing/quote", Some("sku=1")),
            Some("GET:/api/v1/pricing/quote?sku=1".to_string())
        );
        assert_eq!(ResponseCache::key(&Method::GET, "/a", Some("")), Some("GET:/a".to_string()));
        assert_eq!(ResponseCache::key(&Method::POST, "/a", None), None);
    }

    #[tokio::test]
    async fn test_hit_is_marked() {
        let cache = ResponseCache::default();
        cache.put(
            "GET:/a".to_string(),
            StatusCode::OK,
            &headers(),
            Bytes::from_static(b"{\"price\":10}"),
            Duration::from_secs(60),
        );

        let response = cache.get("GET:/a").unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "HIT");
        assert_eq!(response.headers()["content-type"], "application/json");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"{\"price\":10}");
    }

    #[test]
    fn test_errors_not_cached() {
        let cache = ResponseCache::default();
        cache.put(
            "GET:/a".to_string(),
            StatusCode::NOT_FOUND,
            &headers(),
            Bytes::new(),
            Duration::from_secs(60),
        );
        assert!(cache.get("GET:/a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entries_dropped() {
        let cache = ResponseCache::default();
        cache.put(
            "GET:/a".to_string(),
            StatusCode::OK,
            &headers(),
            Bytes::new(),
            Duration::from_millis(1),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("GET:/a").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let cache = ResponseCache::default();
        cache.put("GET:/old".to_string(), StatusCode::OK, &headers(), Bytes::new(), Duration::from_millis(1));
        cache.put("GET:/new".to_string(), StatusCode::OK, &headers(), Bytes::new(), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let cache = ResponseCache::new(1);
        for key in ["GET:/a", "GET:/b"] {
            cache.put(
                key.to_string(),
                StatusCode::OK,
                &headers(),
                Bytes::new(),
                Duration::from_secs(60),
            );
        }
        assert_eq!(cache.len(), 1);
        assert!(cache.get("GET:/a").is_some());
    }
}
