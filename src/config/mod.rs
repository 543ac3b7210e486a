//! Configuration module for the gateway service
//!
//! This module handles loading and parsing configuration from TOML files:
//! - Backend services and their weighted targets
//! - The static route table
//! - Rate limit dimensions and the shared counter store
//! - Circuit breaker defaults and per-service overrides
//! - Health checking, load balancing and monitoring intervals

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

fn default_enabled() -> bool {
    true
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds (upper bound for any single request)
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path to expose metrics
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// Liveness/readiness endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether the operational endpoints are enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path for the liveness endpoint
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Path for the readiness endpoint
    #[serde(default = "default_ready_path")]
    pub ready_path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_ready_path() -> String {
    "/ready".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_health_path(),
            ready_path: default_ready_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Guard for the management surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Whether the admin token guard is enabled
    #[serde(default)]
    pub enabled: bool,
    /// Header name to check for the admin token
    #[serde(default = "default_admin_header_name")]
    pub header_name: String,
    /// List of valid tokens (any one of these tokens will be accepted)
    #[serde(default)]
    pub tokens: Vec<String>,
}

fn default_admin_header_name() -> String {
    "X-Admin-Token".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            header_name: default_admin_header_name(),
            tokens: vec![],
        }
    }
}

impl AdminConfig {
    /// Validate an incoming token against the configured tokens.
    /// Returns true if access should be allowed, false otherwise
    pub fn validate_token(&self, token: &str) -> bool {
        if !self.enabled {
            return true;
        }
        if self.tokens.is_empty() {
            return false;
        }
        self.tokens.iter().any(|t| t == token)
    }
}

/// Settings for the built-in static token authorization hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Header carrying the credential
    #[serde(default = "default_auth_header_name")]
    pub header_name: String,
    /// Accepted tokens mapped to the identity they authenticate
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

fn default_auth_header_name() -> String {
    "Authorization".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header_name: default_auth_header_name(),
            tokens: HashMap::new(),
        }
    }
}

/// A sliding window ceiling. A limit of zero disables the dimension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowRule {
    pub limit: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

impl WindowRule {
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0 && self.window_secs > 0
    }
}

/// Rate limit dimensions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_global_rule")]
    pub global: WindowRule,
    #[serde(default = "default_per_ip_rule")]
    pub per_ip: WindowRule,
    #[serde(default = "default_per_user_rule")]
    pub per_user: WindowRule,
    #[serde(default = "default_per_api_key_rule")]
    pub per_api_key: WindowRule,
    #[serde(default = "default_per_path_rule")]
    pub per_path: WindowRule,
    #[serde(default = "default_per_method_rule")]
    pub per_method: WindowRule,
    /// Short-window burst ceiling per client IP, checked on top of `per_ip`
    #[serde(default)]
    pub burst: Option<WindowRule>,
    /// Request header carrying the caller's priority (`high`, `medium`, `low`)
    #[serde(default = "default_priority_header")]
    pub priority_header: String,
    /// How often stale windows are pruned from the counter store
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_global_rule() -> WindowRule {
    WindowRule::new(10_000, 60)
}

fn default_per_ip_rule() -> WindowRule {
    WindowRule::new(1_000, 60)
}

fn default_per_user_rule() -> WindowRule {
    WindowRule::new(5_000, 60)
}

fn default_per_api_key_rule() -> WindowRule {
    WindowRule::new(10_000, 60)
}

fn default_per_path_rule() -> WindowRule {
    WindowRule::new(2_000, 60)
}

fn default_per_method_rule() -> WindowRule {
    WindowRule::new(3_000, 60)
}

fn default_priority_header() -> String {
    "X-Priority".to_string()
}

fn default_cleanup_interval() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: default_global_rule(),
            per_ip: default_per_ip_rule(),
            per_user: default_per_user_rule(),
            per_api_key: default_per_api_key_rule(),
            per_path: default_per_path_rule(),
            per_method: default_per_method_rule(),
            burst: None,
            priority_header: default_priority_header(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

/// Where sliding window counters live
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CounterBackend {
    /// In-process store, authoritative for a single gateway instance
    #[default]
    Memory,
    /// Redis sorted sets shared by every gateway instance
    Redis,
}

/// Counter store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterStoreConfig {
    #[serde(default)]
    pub backend: CounterBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Prefix for every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Deadline for a single store round trip
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    /// Admit requests when the store cannot be reached
    #[serde(default = "default_enabled")]
    pub fail_open: bool,
}

fn default_key_prefix() -> String {
    "rate_limit".to_string()
}

fn default_store_timeout_ms() -> u64 {
    250
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        Self {
            backend: CounterBackend::Memory,
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout_ms(),
            fail_open: true,
        }
    }
}

impl CounterStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Circuit breaker defaults, applied to every service without an override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// How long a breaker stays open before admitting a probe
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    /// Consecutive failed health probes needed to trip the breaker.
    /// When unset, probe failures count toward `failure_threshold`.
    #[serde(default)]
    pub health_failure_threshold: Option<u32>,
    /// Enables the breaker's own health polling on this interval
    #[serde(default)]
    pub health_poll_interval_secs: Option<u64>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_open_timeout_secs() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_secs: default_open_timeout_secs(),
            health_failure_threshold: None,
            health_poll_interval_secs: None,
        }
    }
}

/// Per-service breaker override; unset fields inherit the defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerOverride {
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub success_threshold: Option<u32>,
    #[serde(default)]
    pub open_timeout_secs: Option<u64>,
}

/// Service registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    5_000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval(),
            health_check_timeout_ms: default_health_check_timeout(),
        }
    }
}

impl RegistryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Rotate through healthy targets
    #[default]
    RoundRobin,
    /// Pick proportionally to the configured weights
    Weighted,
    /// Pick the target with the fewest in-flight requests
    LeastConnections,
}

/// Load balancer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub strategy: LoadBalancingStrategy,
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Whether the periodic report is logged
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

fn default_report_interval() -> u64 {
    60
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval_secs: default_report_interval(),
        }
    }
}

/// Backend target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target name (defaults to `<service>-<index>`)
    #[serde(default)]
    pub name: Option<String>,
    /// Base URL requests are forwarded to
    pub url: String,
    /// Weight for weighted selection (default: 1)
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Health endpoint path, relative to `url`
    #[serde(default = "default_target_health_path")]
    pub health_path: String,
    /// Per-call timeout in milliseconds
    #[serde(default = "default_target_timeout")]
    pub timeout_ms: u64,
    /// Retry budget for idempotent requests (0 disables retries)
    #[serde(default)]
    pub retries: u32,
}

fn default_weight() -> u32 {
    1
}

fn default_target_health_path() -> String {
    "/health".to_string()
}

fn default_target_timeout() -> u64 {
    5_000
}

/// Fallback served while a service's breaker is open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_status")]
    pub status: u16,
    #[serde(default)]
    pub message: Option<String>,
    /// Extra headers on the fallback response
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Extra fields merged into the fallback body
    #[serde(default)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

fn default_fallback_status() -> u16 {
    503
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            status: default_fallback_status(),
            message: None,
            headers: HashMap::new(),
            body: serde_json::Map::new(),
        }
    }
}

/// Logical backend service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub circuit_breaker: Option<BreakerOverride>,
}

/// Response caching for a route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

fn default_cache_ttl() -> u64 {
    60
}

/// Header rewriting for a route
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route name (optional)
    #[serde(default)]
    pub name: Option<String>,
    /// Path pattern to match (e.g., "/api/v1/pricing/*")
    pub path: String,
    /// Logical service requests are forwarded to
    pub service: String,
    /// Optional methods to match (if empty, all methods are matched)
    #[serde(default)]
    pub methods: Vec<String>,
    /// Whether the authorization hook must allow the request
    #[serde(default)]
    pub auth_required: bool,
    /// Requests per minute allowed on this route, on top of the global dimensions
    #[serde(default)]
    pub rate_limit: Option<u32>,
    /// Deadline for the whole forward, in milliseconds
    #[serde(default = "default_route_timeout")]
    pub timeout_ms: u64,
    /// Whether to strip the matched prefix from the path
    #[serde(default)]
    pub strip_prefix: bool,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub transform: Option<TransformConfig>,
    /// Route description
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the route is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_route_timeout() -> u64 {
    30_000
}

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub counter_store: CounterStoreConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load configuration from a TOML string
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                anyhow::bail!("Service '{}' is defined more than once", service.name);
            }
            if service.targets.is_empty() {
                anyhow::bail!("Service '{}' has no targets", service.name);
            }
            for target in &service.targets {
                if !target.url.starts_with("http://") && !target.url.starts_with("https://") {
                    anyhow::bail!(
                        "Service '{}' has a target with an invalid URL '{}'",
                        service.name,
                        target.url
                    );
                }
            }
            if let Some(ref breaker) = service.circuit_breaker {
                if breaker.failure_threshold == Some(0) || breaker.success_threshold == Some(0) {
                    anyhow::bail!(
                        "Service '{}' overrides a circuit breaker threshold with zero",
                        service.name
                    );
                }
            }
        }

        for route in &self.routes {
            if !names.contains(route.service.as_str()) {
                anyhow::bail!(
                    "Route '{}' references unknown service '{}'",
                    route.path,
                    route.service
                );
            }
            if route.timeout_ms == 0 {
                anyhow::bail!("Route '{}' has a zero timeout", route.path);
            }
        }

        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0
        {
            anyhow::bail!("Circuit breaker thresholds must be greater than zero");
        }
        if self.circuit_breaker.health_failure_threshold == Some(0) {
            anyhow::bail!("Circuit breaker health failure threshold must be greater than zero");
        }

        if self.counter_store.backend == CounterBackend::Redis
            && self.counter_store.redis_url.is_none()
        {
            anyhow::bail!("Counter store backend is 'redis' but no redis_url is configured");
        }

        if self.admin.enabled && self.admin.tokens.is_empty() {
            anyhow::bail!("Admin token guard is enabled but no tokens are configured");
        }

        Ok(())
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Get a service by name
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Get enabled routes
    pub fn enabled_routes(&self) -> Vec<&RouteConfig> {
        self.routes.iter().filter(|r| r.enabled).collect()
    }

    /// Number of enabled routes
    pub fn route_count(&self) -> usize {
        self.routes.iter().filter(|r| r.enabled).count()
    }

    /// Copy with admin tokens, auth tokens and the Redis URL redacted
    pub fn sanitized(&self) -> Self {
        let mut config = self.clone();
        config.admin.tokens = vec![REDACTED.to_string(); self.admin.tokens.len()];
        config.auth.tokens = self
            .auth
            .tokens
            .values()
            .enumerate()
            .map(|(i, identity)| (format!("{}-{}", REDACTED, i + 1), identity.clone()))
            .collect();
        if config.counter_store.redis_url.is_some() {
            config.counter_store.redis_url = Some(REDACTED.to_string());
        }
        config
    }
}

/// Placeholder for secrets in exposed configuration
pub const REDACTED: &str = "[redacted]";

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
host = "127.0.0.1"
port = 3000

[rate_limit]
per_ip = { limit = 10, window_secs = 60 }
burst = { limit = 5, window_secs = 1 }

[circuit_breaker]
failure_threshold = 4
health_failure_threshold = 2

[load_balancer]
strategy = "weighted"

[[services]]
name = "pricing-service"
targets = [
    { url = "http://pricing-a:8080", weight = 70 },
    { url = "http://pricing-b:8080", weight = 30, retries = 1 },
]

[services.fallback]
message = "Pricing service temporarily unavailable"
body = { price = 0.0, currency = "USD" }

[[routes]]
path = "/api/v1/pricing/*"
service = "pricing-service"
methods = ["GET", "POST"]
auth_required = true
rate_limit = 100
timeout_ms = 5000
cache = { ttl_secs = 900 }
"#;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert!(config.metrics.enabled);
        assert_eq!(config.rate_limit.per_ip, WindowRule::new(1_000, 60));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.registry.interval(), Duration::from_secs(30));
        assert_eq!(config.registry.timeout(), Duration::from_secs(5));
        assert_eq!(config.counter_store.backend, CounterBackend::Memory);
    }

    #[test]
    fn test_parse_config() {
        let config = GatewayConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.server_addr(), "127.0.0.1:3000");
        assert_eq!(config.rate_limit.per_ip.limit, 10);
        assert_eq!(config.rate_limit.burst, Some(WindowRule::new(5, 1)));
        // untouched dimensions keep their defaults
        assert_eq!(config.rate_limit.global, WindowRule::new(10_000, 60));
        assert_eq!(config.circuit_breaker.failure_threshold, 4);
        assert_eq!(config.circuit_breaker.success_threshold, 3);
        assert_eq!(config.circuit_breaker.health_failure_threshold, Some(2));
        assert_eq!(config.load_balancer.strategy, LoadBalancingStrategy::Weighted);

        let pricing = config.service("pricing-service").unwrap();
        assert_eq!(pricing.targets.len(), 2);
        assert_eq!(pricing.targets[0].weight, 70);
        assert_eq!(pricing.targets[0].health_path, "/health");
        assert_eq!(pricing.targets[1].retries, 1);
        assert_eq!(pricing.fallback.status, 503);
        assert_eq!(pricing.fallback.body["currency"], "USD");

        assert_eq!(config.route_count(), 1);
        let route = &config.routes[0];
        assert!(route.auth_required);
        assert_eq!(route.rate_limit, Some(100));
        assert_eq!(route.cache.as_ref().unwrap().ttl_secs, 900);
        assert!(route.cache.as_ref().unwrap().enabled);
    }

    #[test]
    fn test_unknown_service_reference() {
        let toml = r#"
[[routes]]
path = "/api/*"
service = "nonexistent"
"#;

        let err = GatewayConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("unknown service 'nonexistent'"));
    }

    #[test]
    fn test_service_without_targets() {
        let toml = r#"
[[services]]
name = "offer-service"
"#;

        assert!(GatewayConfig::parse(toml).is_err());
    }

    #[test]
    fn test_duplicate_services() {
        let toml = r#"
[[services]]
name = "offer-service"
targets = [{ url = "http://a:8080" }]

[[services]]
name = "offer-service"
targets = [{ url = "http://b:8080" }]
"#;

        let err = GatewayConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_invalid_target_url() {
        let toml = r#"
[[services]]
name = "offer-service"
targets = [{ url = "offer-service:8080" }]
"#;

        assert!(GatewayConfig::parse(toml).is_err());
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let toml = r#"
[counter_store]
backend = "redis"
"#;

        let err = GatewayConfig::parse(toml).unwrap_err();
        assert!(err.to_string().contains("redis_url"));

        let toml = r#"
[counter_store]
backend = "redis"
redis_url = "redis://127.0.0.1:6379"
"#;
        let config = GatewayConfig::parse(toml).unwrap();
        assert_eq!(config.counter_store.backend, CounterBackend::Redis);
        assert_eq!(config.counter_store.key_prefix, "rate_limit");
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let toml = r#"
[circuit_breaker]
failure_threshold = 0
"#;

        assert!(GatewayConfig::parse(toml).is_err());
    }

    #[test]
    fn test_admin_guard_enabled_without_tokens() {
        let toml = r#"
[admin]
enabled = true
tokens = []
"#;

        let err = GatewayConfig::parse(toml).unwrap_err();
        assert!(err
            .to_string()
            .contains("Admin token guard is enabled but no tokens are configured"));
    }

    #[test]
    fn test_admin_token_validation() {
        let config = AdminConfig {
            enabled: true,
            header_name: "X-Admin-Token".to_string(),
            tokens: vec!["valid-token".to_string()],
        };

        assert!(config.validate_token("valid-token"));
        assert!(!config.validate_token("invalid-token"));

        let disabled = AdminConfig::default();
        assert!(disabled.validate_token("anything"));
    }

    #[test]
    fn test_sanitized_hides_secrets() {
        let config = GatewayConfig::parse(
            r#"
[admin]
enabled = true
tokens = ["admin-secret"]

[auth]
tokens = { "demo-token" = "demo-user" }

[counter_store]
backend = "redis"
redis_url = "redis://:hunter2@127.0.0.1:6379"
"#,
        )
        .unwrap();

        let sanitized = config.sanitized();
        let rendered = serde_json::to_string(&sanitized).unwrap();
        assert!(!rendered.contains("admin-secret"));
        assert!(!rendered.contains("demo-token"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("demo-user"));
        assert_eq!(sanitized.admin.tokens, vec![REDACTED.to_string()]);

        // the live config keeps its secrets
        assert!(config.admin.validate_token("admin-secret"));
    }

    #[test]
    fn test_window_rule_disabled_by_zero_limit() {
        assert!(!WindowRule::new(0, 60).is_enabled());
        assert!(WindowRule::new(10, 60).is_enabled());
        assert_eq!(WindowRule::new(10, 60).window(), Duration::from_secs(60));
    }
}
