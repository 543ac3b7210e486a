//! Multi-dimensional sliding window rate limiting
//!
//! A request is checked against every applicable dimension at once:
//! - global, client IP (or its priority variant), authenticated user, API key,
//!   normalized path and HTTP method
//! - an optional per-IP burst window
//! - an optional per-route override keyed by method and path
//!
//! It is admitted only if all of them have room. Window state lives in a
//! [`CounterStore`], so the algorithm is the same in-process and across
//! instances.

mod redis_store;
mod store;

pub use redis_store::RedisCounterStore;
pub use store::{AcquireResult, CounterStore, MemoryCounterStore, StoreError, WindowCheck, WindowState};

use crate::config::{RateLimitConfig, WindowRule};
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use axum::http::{request::Parts, HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Window used by per-route overrides, which are expressed per minute
const ROUTE_WINDOW: Duration = Duration::from_secs(60);

/// A rate limit dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Global,
    Ip,
    User,
    ApiKey,
    Path,
    Method,
    Burst,
    Priority,
    Route,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Global => "global",
            Dimension::Ip => "ip",
            Dimension::User => "user",
            Dimension::ApiKey => "api_key",
            Dimension::Path => "path",
            Dimension::Method => "method",
            Dimension::Burst => "burst",
            Dimension::Priority => "priority",
            Dimension::Route => "route",
        }
    }
}

/// A (dimension, identity) pair owning one window counter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub dimension: Dimension,
    pub identity: String,
}

impl RateLimitKey {
    pub fn new(dimension: Dimension, identity: impl Into<String>) -> Self {
        Self {
            dimension,
            identity: identity.into(),
        }
    }

    pub fn global() -> Self {
        Self::new(Dimension::Global, "")
    }

    /// Parse the `dimension:identity` form, as shown by `Display`
    pub fn parse(s: &str) -> Option<Self> {
        if s == "global" {
            return Some(Self::global());
        }
        let (dimension, identity) = s.split_once(':')?;
        let dimension = match dimension {
            "ip" => Dimension::Ip,
            "user" => Dimension::User,
            "api_key" => Dimension::ApiKey,
            "path" => Dimension::Path,
            "method" => Dimension::Method,
            "burst" => Dimension::Burst,
            "priority" => Dimension::Priority,
            "route" => Dimension::Route,
            _ => return None,
        };
        Some(Self::new(dimension, identity))
    }

    fn storage_key(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.identity.is_empty() {
            f.write_str(self.dimension.as_str())
        } else {
            write!(f, "{}:{}", self.dimension.as_str(), self.identity)
        }
    }
}

/// Caller priority, read from a request header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "1" => Some(Priority::High),
            "medium" | "2" => Some(Priority::Medium),
            "low" | "3" => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn multiplier(&self) -> f64 {
        match self {
            Priority::High => 2.0,
            Priority::Medium => 1.5,
            Priority::Low => 0.5,
        }
    }

    fn scale(&self, limit: u32) -> u32 {
        ((limit as f64 * self.multiplier()) as u32).max(1)
    }
}

/// Everything about a request that can key a rate limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub ip: String,
    pub user: Option<String>,
    pub api_key: Option<String>,
    /// Normalized request path
    pub path: String,
    pub method: String,
    pub priority: Option<Priority>,
}

impl RequestIdentity {
    /// Extract the identity from request parts.
    ///
    /// The client IP is the first `X-Forwarded-For` hop, then `X-Real-IP`,
    /// then the socket peer. The API key comes from `X-API-Key` or the
    /// `api_key` query parameter.
    pub fn from_parts(
        parts: &Parts,
        peer: Option<SocketAddr>,
        user: Option<String>,
        priority_header: &str,
    ) -> Self {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let ip = header("x-forwarded-for")
            .and_then(|xff| xff.split(',').next())
            .map(|hop| hop.trim().to_string())
            .filter(|hop| !hop.is_empty())
            .or_else(|| header("x-real-ip").map(str::to_string))
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        let api_key = header("x-api-key")
            .map(str::to_string)
            .or_else(|| api_key_from_query(parts.uri.query()));

        Self {
            ip,
            user,
            api_key,
            path: normalize_path(parts.uri.path()),
            method: parts.method.as_str().to_string(),
            priority: header(priority_header).and_then(Priority::parse),
        }
    }
}

fn api_key_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "api_key")
        .map(|(_, value)| percent_decode_str(value).decode_utf8_lossy().into_owned())
        .filter(|value| !value.is_empty())
}

/// Strip a trailing slash so `/a/` and `/a` share a counter
pub fn normalize_path(path: &str) -> String {
    if path.len() > 1 && path.ends_with('/') {
        path[..path.len() - 1].to_string()
    } else {
        path.to_string()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// The dimension surfaced to the caller: the first failing one when
    /// rejected, otherwise the most constraining one
    pub key: Option<RateLimitKey>,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds at which the reported window frees a slot
    pub reset_at: i64,
    /// Seconds until the reported window frees a slot
    pub retry_after: u64,
}

impl RateLimitDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            key: None,
            limit: 0,
            remaining: 0,
            reset_at: 0,
            retry_after: 0,
        }
    }

    /// Add the `X-RateLimit-*` headers (and `Retry-After` when rejected)
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        if self.key.is_none() {
            return;
        }
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_at));
        if !self.allowed {
            headers.insert("retry-after", HeaderValue::from(self.retry_after));
        }
    }

    pub fn to_error(&self) -> GatewayError {
        GatewayError::RateLimited {
            dimension: self
                .key
                .as_ref()
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            limit: self.limit,
            retry_after: self.retry_after,
            reset_time: self.reset_at,
        }
    }
}

/// Configured limits, as reported by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct LimitsSummary {
    pub global: WindowRule,
    pub per_ip: WindowRule,
    pub per_user: WindowRule,
    pub per_api_key: WindowRule,
    pub per_path: WindowRule,
    pub per_method: WindowRule,
    pub burst: Option<WindowRule>,
}

/// Rate limiter status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub ready: bool,
    pub backend: &'static str,
    pub active_keys: Option<usize>,
    pub limits: LimitsSummary,
    pub timestamp: DateTime<Utc>,
}

/// Sliding window rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn CounterStore>,
    key_prefix: String,
    timeout: Duration,
    fail_open: bool,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            config,
            store,
            key_prefix: "rate_limit".to_string(),
            timeout: Duration::from_millis(250),
            fail_open: true,
            metrics: None,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Deadline for each store round trip and behavior when it is missed
    pub fn with_store_policy(mut self, timeout: Duration, fail_open: bool) -> Self {
        self.timeout = timeout;
        self.fail_open = fail_open;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    /// Window rule applying to a key's dimension
    fn rule_for(&self, key: &RateLimitKey) -> Option<WindowRule> {
        let rule = match key.dimension {
            Dimension::Global => self.config.global,
            Dimension::Ip => self.config.per_ip,
            Dimension::User => self.config.per_user,
            Dimension::ApiKey => self.config.per_api_key,
            Dimension::Path => self.config.per_path,
            Dimension::Method => self.config.per_method,
            Dimension::Burst => self.config.burst?,
            Dimension::Priority => {
                let level = key.identity.split(':').next().and_then(Priority::parse)?;
                WindowRule::new(level.scale(self.config.per_ip.limit), self.config.per_ip.window_secs)
            }
            Dimension::Route => WindowRule::new(0, ROUTE_WINDOW.as_secs()),
        };
        Some(rule)
    }

    /// Keys and limits applying to a request, in check order
    pub fn applicable(&self, identity: &RequestIdentity, route_limit: Option<u32>) -> Vec<(RateLimitKey, WindowRule)> {
        let mut rules = Vec::new();
        let mut push = |key: RateLimitKey, rule: WindowRule| {
            if rule.is_enabled() {
                rules.push((key, rule));
            }
        };

        push(RateLimitKey::global(), self.config.global);

        match identity.priority {
            Some(priority) => push(
                RateLimitKey::new(
                    Dimension::Priority,
                    format!("{}:{}", priority.as_str(), identity.ip),
                ),
                WindowRule::new(
                    priority.scale(self.config.per_ip.limit),
                    self.config.per_ip.window_secs,
                ),
            ),
            None => push(
                RateLimitKey::new(Dimension::Ip, identity.ip.clone()),
                self.config.per_ip,
            ),
        }

        if let Some(burst) = self.config.burst {
            push(RateLimitKey::new(Dimension::Burst, identity.ip.clone()), burst);
        }
        if let Some(ref user) = identity.user {
            push(RateLimitKey::new(Dimension::User, user.clone()), self.config.per_user);
        }
        if let Some(ref api_key) = identity.api_key {
            push(RateLimitKey::new(Dimension::ApiKey, api_key.clone()), self.config.per_api_key);
        }
        push(
            RateLimitKey::new(Dimension::Path, identity.path.clone()),
            self.config.per_path,
        );
        push(
            RateLimitKey::new(Dimension::Method, identity.method.clone()),
            self.config.per_method,
        );
        if let Some(limit) = route_limit {
            push(
                RateLimitKey::new(
                    Dimension::Route,
                    format!("{}:{}", identity.method, identity.path),
                ),
                WindowRule::new(limit, ROUTE_WINDOW.as_secs()),
            );
        }

        rules
    }

    /// Check and, when admitted, record the request in every applicable window
    pub async fn check(&self, identity: &RequestIdentity, route_limit: Option<u32>) -> RateLimitDecision {
        let rules = self.applicable(identity, route_limit);
        if rules.is_empty() {
            return RateLimitDecision::unlimited();
        }

        let checks: Vec<WindowCheck> = rules
            .iter()
            .map(|(key, rule)| WindowCheck {
                key: key.storage_key(&self.key_prefix),
                limit: rule.limit,
                window: rule.window(),
            })
            .collect();

        let now = now_ms();
        let result = match self.bounded(self.store.acquire(&checks, now)).await {
            Ok(result) => result,
            Err(e) => return self.store_failure(e, &rules, now),
        };

        let reported = match result.failed {
            Some(index) => index,
            None => most_constraining(&rules, &result.windows),
        };
        let (key, rule) = &rules[reported];
        let state = result
            .windows
            .get(reported)
            .copied()
            .unwrap_or(WindowState {
                count: 0,
                oldest_ms: None,
            });
        let (reset_at, retry_after) = window_reset(state.oldest_ms, rule.window(), now);

        let decision = RateLimitDecision {
            allowed: result.admitted,
            key: Some(key.clone()),
            limit: rule.limit,
            remaining: rule.limit.saturating_sub(state.count),
            reset_at,
            retry_after,
        };

        if !decision.allowed {
            info!(
                key = %key,
                retry_after = decision.retry_after,
                "Rate limit exceeded"
            );
            if let Some(ref metrics) = self.metrics {
                metrics.record_rate_limited(key.dimension.as_str());
            }
        }

        decision
    }

    fn store_failure(&self, error: StoreError, rules: &[(RateLimitKey, WindowRule)], now: u64) -> RateLimitDecision {
        if self.fail_open {
            warn!("Counter store unavailable, admitting request: {}", error);
            return RateLimitDecision::unlimited();
        }

        warn!("Counter store unavailable, rejecting request: {}", error);
        let (key, rule) = &rules[0];
        let (reset_at, retry_after) = window_reset(None, Duration::from_secs(1), now);
        RateLimitDecision {
            allowed: false,
            key: Some(key.clone()),
            limit: rule.limit,
            remaining: 0,
            reset_at,
            retry_after,
        }
    }

    /// Entries currently in the window of `key`
    pub async fn current_usage(&self, key: &RateLimitKey) -> Result<u32, StoreError> {
        let window = self
            .rule_for(key)
            .map(|rule| rule.window())
            .unwrap_or(ROUTE_WINDOW);
        self.bounded(
            self.store
                .usage(&key.storage_key(&self.key_prefix), window, now_ms()),
        )
        .await
    }

    /// Clear every counter
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.bounded(self.store.clear()).await?;
        info!("Rate limiters reset");
        Ok(())
    }

    /// Prune stale windows; returns the number of keys removed
    pub async fn cleanup(&self) -> Result<usize, StoreError> {
        let removed = self.bounded(self.store.prune(now_ms())).await?;
        if removed > 0 {
            debug!("Rate limiter cleanup removed {} keys", removed);
        }
        Ok(removed)
    }

    pub async fn is_ready(&self) -> bool {
        self.bounded(self.store.ping()).await.is_ok()
    }

    pub async fn status(&self) -> RateLimitStatus {
        let active_keys = match self.bounded(self.store.key_count()).await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Failed to count rate limit keys: {}", e);
                None
            }
        };

        RateLimitStatus {
            ready: self.is_ready().await,
            backend: self.store.backend(),
            active_keys,
            limits: LimitsSummary {
                global: self.config.global,
                per_ip: self.config.per_ip,
                per_user: self.config.per_user,
                per_api_key: self.config.per_api_key,
                per_path: self.config.per_path,
                per_method: self.config.per_method,
                burst: self.config.burst,
            },
            timestamp: Utc::now(),
        }
    }

    /// Run [`RateLimiter::cleanup`] on a fixed interval
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = limiter.cleanup().await {
                    warn!("Rate limiter cleanup failed: {}", e);
                }
            }
        })
    }
}

/// Index of the window with the fewest remaining slots (first on ties)
fn most_constraining(rules: &[(RateLimitKey, WindowRule)], windows: &[WindowState]) -> usize {
    rules
        .iter()
        .zip(windows)
        .enumerate()
        .min_by_key(|(i, ((_, rule), state))| (rule.limit.saturating_sub(state.count), *i))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// When the oldest entry leaves the window: (unix seconds, seconds from now)
fn window_reset(oldest_ms: Option<u64>, window: Duration, now_ms: u64) -> (i64, u64) {
    let window_ms = window.as_millis() as u64;
    let reset_ms = oldest_ms.unwrap_or(now_ms) + window_ms;
    let wait_ms = reset_ms.saturating_sub(now_ms);
    let retry_after = wait_ms.div_ceil(1000).max(1);
    let reset_at = reset_ms.div_ceil(1000) as i64;
    (reset_at, retry_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn disabled() -> WindowRule {
        WindowRule::new(0, 60)
    }

    fn per_ip_only(limit: u32) -> RateLimitConfig {
        RateLimitConfig {
            global: disabled(),
            per_ip: WindowRule::new(limit, 60),
            per_user: disabled(),
            per_api_key: disabled(),
            per_path: disabled(),
            per_method: disabled(),
            ..RateLimitConfig::default()
        }
    }

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(config, Arc::new(MemoryCounterStore::new()))
    }

    fn identity(ip: &str) -> RequestIdentity {
        RequestIdentity {
            ip: ip.to_string(),
            user: None,
            api_key: None,
            path: "/api/v1/offers".to_string(),
            method: "GET".to_string(),
            priority: None,
        }
    }

    fn parts(req: Request<()>) -> Parts {
        req.into_parts().0
    }

    #[tokio::test]
    async fn test_eleventh_request_rejected() {
        let limiter = limiter(per_ip_only(10));
        let client = identity("10.0.0.1");

        for _ in 0..10 {
            let decision = limiter.check(&client, None).await;
            assert!(decision.allowed);
        }

        let decision = limiter.check(&client, None).await;
        assert!(!decision.allowed);
        assert_eq!(decision.key, Some(RateLimitKey::new(Dimension::Ip, "10.0.0.1")));
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after >= 1 && decision.retry_after <= 60);

        // other clients are unaffected
        assert!(limiter.check(&identity("10.0.0.2"), None).await.allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(limiter(per_ip_only(10)));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.check(&identity("10.0.0.1"), None).await.allowed })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let limiter = limiter(per_ip_only(3));
        let client = identity("10.0.0.1");

        assert_eq!(limiter.check(&client, None).await.remaining, 2);
        assert_eq!(limiter.check(&client, None).await.remaining, 1);
        assert_eq!(limiter.check(&client, None).await.remaining, 0);
        assert_eq!(
            limiter
                .current_usage(&RateLimitKey::new(Dimension::Ip, "10.0.0.1"))
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_first_failing_dimension_reported() {
        let config = RateLimitConfig {
            per_method: WindowRule::new(1, 60),
            ..per_ip_only(1)
        };
        let limiter = limiter(config);
        let client = identity("10.0.0.1");

        assert!(limiter.check(&client, None).await.allowed);
        let decision = limiter.check(&client, None).await;
        assert!(!decision.allowed);
        // ip is checked before method
        assert_eq!(decision.key.unwrap().dimension, Dimension::Ip);
    }

    #[tokio::test]
    async fn test_route_override() {
        let limiter = limiter(per_ip_only(100));
        let client = identity("10.0.0.1");

        assert!(limiter.check(&client, Some(2)).await.allowed);
        assert!(limiter.check(&client, Some(2)).await.allowed);
        let decision = limiter.check(&client, Some(2)).await;
        assert!(!decision.allowed);
        assert_eq!(decision.key.unwrap().to_string(), "route:GET:/api/v1/offers");
    }

    #[tokio::test]
    async fn test_priority_scales_limit() {
        let limiter = limiter(per_ip_only(2));
        let client = RequestIdentity {
            priority: Some(Priority::High),
            ..identity("10.0.0.1")
        };

        for _ in 0..4 {
            assert!(limiter.check(&client, None).await.allowed);
        }
        let decision = limiter.check(&client, None).await;
        assert!(!decision.allowed);
        assert_eq!(decision.key.unwrap().to_string(), "priority:high:10.0.0.1");
    }

    #[tokio::test]
    async fn test_burst_window() {
        let config = RateLimitConfig {
            burst: Some(WindowRule::new(2, 1)),
            ..per_ip_only(100)
        };
        let limiter = limiter(config);
        let client = identity("10.0.0.1");

        assert!(limiter.check(&client, None).await.allowed);
        assert!(limiter.check(&client, None).await.allowed);
        let decision = limiter.check(&client, None).await;
        assert!(!decision.allowed);
        assert_eq!(decision.key.unwrap().dimension, Dimension::Burst);
        assert_eq!(decision.retry_after, 1);
    }

    #[tokio::test]
    async fn test_user_and_api_key_dimensions() {
        let config = RateLimitConfig {
            per_user: WindowRule::new(1, 60),
            per_api_key: WindowRule::new(5, 60),
            ..per_ip_only(100)
        };
        let limiter = limiter(config);
        let client = RequestIdentity {
            user: Some("alice".to_string()),
            api_key: Some("k-1".to_string()),
            ..identity("10.0.0.1")
        };

        assert!(limiter.check(&client, None).await.allowed);
        let decision = limiter.check(&client, None).await;
        assert_eq!(decision.key.unwrap().to_string(), "user:alice");

        // anonymous callers skip the user dimension
        assert!(limiter.check(&identity("10.0.0.1"), None).await.allowed);
    }

    #[tokio::test]
    async fn test_all_dimensions_disabled() {
        let limiter = limiter(per_ip_only(0));
        let decision = limiter.check(&identity("10.0.0.1"), None).await;
        assert!(decision.allowed);
        assert!(decision.key.is_none());

        let mut headers = HeaderMap::new();
        decision.apply_headers(&mut headers);
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn test_reset_and_status() {
        let limiter = limiter(per_ip_only(1));
        let client = identity("10.0.0.1");
        assert!(limiter.check(&client, None).await.allowed);
        assert!(!limiter.check(&client, None).await.allowed);

        let status = limiter.status().await;
        assert!(status.ready);
        assert_eq!(status.backend, "memory");
        assert_eq!(status.active_keys, Some(1));

        limiter.reset().await.unwrap();
        assert!(limiter.check(&client, None).await.allowed);
    }

    #[tokio::test]
    async fn test_headers() {
        let limiter = limiter(per_ip_only(1));
        let client = identity("10.0.0.1");

        let mut headers = HeaderMap::new();
        limiter.check(&client, None).await.apply_headers(&mut headers);
        assert_eq!(headers["x-ratelimit-limit"], "1");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert!(headers.get("retry-after").is_none());

        let mut headers = HeaderMap::new();
        limiter.check(&client, None).await.apply_headers(&mut headers);
        assert!(headers.get("retry-after").is_some());
    }

    #[test]
    fn test_identity_from_forwarded_for() {
        let req = Request::builder()
            .uri("/api/v1/offers/?api_key=abc%20def")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("x-real-ip", "198.51.100.1")
            .header("x-priority", "HIGH")
            .body(())
            .unwrap();
        let peer: SocketAddr = "127.0.0.1:5555".parse().unwrap();

        let identity = RequestIdentity::from_parts(&parts(req), Some(peer), None, "x-priority");
        assert_eq!(identity.ip, "203.0.113.7");
        assert_eq!(identity.api_key.as_deref(), Some("abc def"));
        assert_eq!(identity.path, "/api/v1/offers");
        assert_eq!(identity.priority, Some(Priority::High));
    }

    #[test]
    fn test_identity_falls_back_to_peer() {
        let req = Request::builder()
            .uri("/health")
            .header("x-api-key", "header-key")
            .body(())
            .unwrap();
        let peer: SocketAddr = "192.0.2.10:4000".parse().unwrap();

        let identity = RequestIdentity::from_parts(&parts(req), Some(peer), None, "x-priority");
        assert_eq!(identity.ip, "192.0.2.10");
        assert_eq!(identity.api_key.as_deref(), Some("header-key"));
        assert_eq!(identity.priority, None);

        let req = Request::builder()
            .uri("/health")
            .header("x-real-ip", "198.51.100.1")
            .body(())
            .unwrap();
        let identity = RequestIdentity::from_parts(&parts(req), Some(peer), None, "x-priority");
        assert_eq!(identity.ip, "198.51.100.1");
    }

    #[test]
    fn test_key_parse_round_trip() {
        let key = RateLimitKey::parse("route:GET:/api/v1/offers").unwrap();
        assert_eq!(key.dimension, Dimension::Route);
        assert_eq!(key.identity, "GET:/api/v1/offers");
        assert_eq!(RateLimitKey::parse("global"), Some(RateLimitKey::global()));
        assert_eq!(RateLimitKey::parse("bogus:x"), None);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api/v1/"), "/api/v1");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_window_reset() {
        // oldest entry 15s into a 60s window: 45s left
        let (reset_at, retry_after) = window_reset(Some(100_000), Duration::from_secs(60), 115_000);
        assert_eq!(retry_after, 45);
        assert_eq!(reset_at, 160);
    }
}
