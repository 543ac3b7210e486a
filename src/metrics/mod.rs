//! Metrics module for Prometheus and the per-service monitor
//!
//! This module provides metrics collection for the gateway service:
//! - Request count by method, path, and status
//! - Request latency histogram
//! - Upstream errors by service and kind
//! - Rate limit rejections by dimension
//! - Circuit breaker state and target health gauges
//! - Per-service request/error counters with average latency

use crate::circuit::CircuitState;
use chrono::{DateTime, Utc};
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Default, Clone)]
struct ServiceStats {
    request_count: u64,
    error_count: u64,
    total_latency: Duration,
    last_request: Option<DateTime<Utc>>,
}

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    request_counter: CounterVec,
    request_latency: HistogramVec,
    upstream_errors: CounterVec,
    rate_limit_rejections: CounterVec,
    breaker_state: IntGaugeVec,
    target_health: IntGaugeVec,
    active_requests: IntGaugeVec,
    total_requests: Arc<AtomicU64>,
    total_errors: Arc<AtomicU64>,
    services: Arc<Mutex<HashMap<String, ServiceStats>>>,
    started_at: Instant,
}

impl GatewayMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_counter = CounterVec::new(
            Opts::new("gateway_requests_total", "Total number of requests"),
            &["method", "path", "status"],
        )
        .expect("Failed to create request counter");

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_latency_seconds",
                "Request latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method", "path"],
        )
        .expect("Failed to create latency histogram");

        let upstream_errors = CounterVec::new(
            Opts::new(
                "gateway_upstream_errors_total",
                "Failed forwards by service and failure kind",
            ),
            &["service", "kind"],
        )
        .expect("Failed to create upstream error counter");

        let rate_limit_rejections = CounterVec::new(
            Opts::new(
                "gateway_rate_limit_rejections_total",
                "Requests rejected by the rate limiter",
            ),
            &["dimension"],
        )
        .expect("Failed to create rate limit counter");

        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "gateway_circuit_breaker_state",
                "Circuit breaker state (0 closed, 1 open, 2 half-open)",
            ),
            &["service"],
        )
        .expect("Failed to create breaker state gauge");

        let target_health = IntGaugeVec::new(
            Opts::new("gateway_target_health", "Target health (1 healthy, 0 unhealthy)"),
            &["service", "target"],
        )
        .expect("Failed to create target health gauge");

        let active_requests = IntGaugeVec::new(
            Opts::new("gateway_active_requests", "In-flight forwards per service"),
            &["service"],
        )
        .expect("Failed to create active requests gauge");

        registry
            .register(Box::new(request_counter.clone()))
            .expect("Failed to register request counter");
        registry
            .register(Box::new(request_latency.clone()))
            .expect("Failed to register latency histogram");
        registry
            .register(Box::new(upstream_errors.clone()))
            .expect("Failed to register upstream error counter");
        registry
            .register(Box::new(rate_limit_rejections.clone()))
            .expect("Failed to register rate limit counter");
        registry
            .register(Box::new(breaker_state.clone()))
            .expect("Failed to register breaker state gauge");
        registry
            .register(Box::new(target_health.clone()))
            .expect("Failed to register target health gauge");
        registry
            .register(Box::new(active_requests.clone()))
            .expect("Failed to register active requests gauge");

        Self {
            registry,
            request_counter,
            request_latency,
            upstream_errors,
            rate_limit_rejections,
            breaker_state,
            target_health,
            active_requests,
            total_requests: Arc::new(AtomicU64::new(0)),
            total_errors: Arc::new(AtomicU64::new(0)),
            services: Arc::new(Mutex::new(HashMap::new())),
            started_at: Instant::now(),
        }
    }

    fn services(&self) -> MutexGuard<'_, HashMap<String, ServiceStats>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a request with its status and latency
    pub fn record_request(&self, method: &str, path: &str, status: u16, latency: Duration) {
        let status_str = status.to_string();

        // Normalize path for metrics (to avoid high cardinality)
        let normalized_path = Self::normalize_path(path);

        self.request_counter
            .with_label_values(&[method, &normalized_path, &status_str])
            .inc();

        self.request_latency
            .with_label_values(&[method, &normalized_path])
            .observe(latency.as_secs_f64());

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if status >= 400 {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the outcome of a forward to a service
    pub fn record_upstream(&self, service: &str, latency: Duration, failed: bool) {
        let mut services = self.services();
        let stats = services.entry(service.to_string()).or_default();
        stats.request_count += 1;
        stats.total_latency += latency;
        stats.last_request = Some(Utc::now());
        if failed {
            stats.error_count += 1;
        }
    }

    /// Count a failed forward by kind (`timeout`, `upstream`, `transport`)
    pub fn record_error(&self, service: &str, kind: &str) {
        self.upstream_errors
            .with_label_values(&[service, kind])
            .inc();
    }

    /// Count a rate limiter rejection
    pub fn record_rate_limited(&self, dimension: &str) {
        self.rate_limit_rejections
            .with_label_values(&[dimension])
            .inc();
    }

    pub fn set_breaker_state(&self, service: &str, state: CircuitState) {
        self.breaker_state
            .with_label_values(&[service])
            .set(state.as_gauge());
    }

    pub fn set_target_health(&self, service: &str, target: &str, healthy: bool) {
        self.target_health
            .with_label_values(&[service, target])
            .set(i64::from(healthy));
    }

    pub fn inc_active_requests(&self, service: &str) {
        self.active_requests.with_label_values(&[service]).inc();
    }

    pub fn dec_active_requests(&self, service: &str) {
        self.active_requests.with_label_values(&[service]).dec();
    }

    /// Get the Prometheus metrics output
    pub fn prometheus_output(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Get total request count
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Get total error count
    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    /// Get error rate (percentage)
    pub fn error_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            (self.total_errors() as f64 / total as f64) * 100.0
        }
    }

    /// Normalize path to reduce cardinality
    /// Replace IDs and numbers with placeholders
    fn normalize_path(path: &str) -> String {
        let parts: Vec<&str> = path.split('/').collect();
        let normalized: Vec<String> = parts
            .iter()
            .map(|part| {
                if part.chars().all(|c| c.is_ascii_digit()) && !part.is_empty() {
                    ":id".to_string()
                } else if part.chars().all(|c| c.is_ascii_hexdigit()) && part.len() >= 8 {
                    ":uuid".to_string()
                } else {
                    (*part).to_string()
                }
            })
            .collect();
        normalized.join("/")
    }

    /// Gateway-wide counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests(),
            total_errors: self.total_errors(),
            error_rate: self.error_rate(),
        }
    }

    /// Counters for one service, if it has seen traffic
    pub fn service_snapshot(&self, service: &str) -> Option<ServiceSnapshot> {
        self.services().get(service).map(ServiceSnapshot::from)
    }

    pub fn all_service_snapshots(&self) -> BTreeMap<String, ServiceSnapshot> {
        self.services()
            .iter()
            .map(|(name, stats)| (name.clone(), ServiceSnapshot::from(stats)))
            .collect()
    }

    /// Everything the monitor knows, for the management surface
    pub fn detailed(&self) -> DetailedMetrics {
        DetailedMetrics {
            total_requests: self.total_requests(),
            total_errors: self.total_errors(),
            error_rate: self.error_rate(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            services: self.all_service_snapshots(),
            timestamp: Utc::now(),
        }
    }

    /// Clear the gateway and per-service counters; Prometheus series are kept
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.total_errors.store(0, Ordering::Relaxed);
        self.services().clear();
    }

    /// Log a summary of traffic on a fixed interval
    pub fn spawn_reporting(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = metrics.snapshot();
                info!(
                    total_requests = snapshot.total_requests,
                    total_errors = snapshot.total_errors,
                    error_rate = %format!("{:.2}%", snapshot.error_rate),
                    "Monitoring report"
                );
                for (service, stats) in metrics.all_service_snapshots() {
                    info!(
                        service = %service,
                        requests = stats.request_count,
                        errors = stats.error_count,
                        avg_latency_ms = %format!("{:.1}", stats.average_latency_ms),
                        "Service report"
                    );
                }
            }
        })
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of gateway-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
}

/// Read-only counters for one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub request_count: u64,
    pub error_count: u64,
    pub average_latency_ms: f64,
    /// Percentage of forwards that failed
    pub error_rate: f64,
    pub last_request: Option<DateTime<Utc>>,
}

impl From<&ServiceStats> for ServiceSnapshot {
    fn from(stats: &ServiceStats) -> Self {
        let (average_latency_ms, error_rate) = if stats.request_count == 0 {
            (0.0, 0.0)
        } else {
            let n = stats.request_count as f64;
            (
                stats.total_latency.as_secs_f64() * 1000.0 / n,
                stats.error_count as f64 / n * 100.0,
            )
        };
        Self {
            request_count: stats.request_count,
            error_count: stats.error_count,
            average_latency_ms,
            error_rate,
            last_request: stats.last_request,
        }
    }
}

/// Monitor view served on the management surface
#[derive(Debug, Clone, Serialize)]
pub struct DetailedMetrics {
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub uptime_seconds: u64,
    pub services: BTreeMap<String, ServiceSnapshot>,
    pub timestamp: DateTime<Utc>,
}
