//! Circuit breaker management
//!
//! One breaker per logical service, created at startup and kept for the
//! lifetime of the process. Each breaker is an independent state machine:
//! - `Closed` -> `Open` once consecutive failures reach the failure threshold
//! - `Open` -> `HalfOpen` once the open timeout has elapsed (checked on read)
//! - `HalfOpen` -> `Closed` once consecutive successes reach the success threshold
//! - `HalfOpen` -> `Open` on any failure
//!
//! While half-open a single probe request is admitted at a time.

use crate::config::{BreakerOverride, CircuitBreakerConfig, FallbackConfig, GatewayConfig};
use crate::metrics::GatewayMetrics;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Breaker errors
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit breaker not found for service: {0}")]
    UnknownService(String),
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Numeric encoding used by the state gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds and timing for one breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    /// Separate trip threshold for health probe failures
    pub health_failure_threshold: Option<u32>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from_config(&CircuitBreakerConfig::default(), None)
    }
}

impl BreakerSettings {
    /// Resolve the settings for a service from the defaults and its override
    pub fn from_config(defaults: &CircuitBreakerConfig, overrides: Option<&BreakerOverride>) -> Self {
        let overrides = overrides.cloned().unwrap_or_default();
        Self {
            failure_threshold: overrides
                .failure_threshold
                .unwrap_or(defaults.failure_threshold)
                .max(1),
            success_threshold: overrides
                .success_threshold
                .unwrap_or(defaults.success_threshold)
                .max(1),
            open_timeout: Duration::from_secs(
                overrides
                    .open_timeout_secs
                    .unwrap_or(defaults.open_timeout_secs),
            ),
            health_failure_threshold: defaults.health_failure_threshold,
        }
    }
}

/// Precomputed substitute response served while a breaker is open
#[derive(Debug, Clone)]
pub struct FallbackResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Body template; `timestamp` is filled in at render time
    pub body: Map<String, Value>,
}

impl FallbackResponse {
    /// Fallback for a configured service
    pub fn for_service(service: &str, config: &FallbackConfig) -> Self {
        let status =
            StatusCode::from_u16(config.status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);

        let message = config.message.clone().unwrap_or_else(|| {
            format!(
                "{} is currently unavailable. Please try again later.",
                service
            )
        });

        let mut body = Map::new();
        body.insert("error".into(), json!("Service temporarily unavailable"));
        body.insert("message".into(), json!(message));
        body.insert("fallback".into(), json!(true));
        for (key, value) in &config.body {
            body.insert(key.clone(), value.clone());
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            match (
                name.parse::<HeaderName>(),
                value.parse::<HeaderValue>(),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(
                    "Ignoring invalid fallback header '{}' for service '{}'",
                    name, service
                ),
            }
        }

        Self {
            status,
            headers,
            body,
        }
    }

    /// Fallback for services without a breaker
    pub fn generic() -> Self {
        let mut body = Map::new();
        body.insert("error".into(), json!("Service temporarily unavailable"));
        body.insert(
            "message".into(),
            json!("The requested service is currently unavailable. Please try again later."),
        );
        body.insert("fallback".into(), json!(true));
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers: HeaderMap::new(),
            body,
        }
    }

    /// Body with a fresh timestamp
    pub fn render_body(&self) -> Value {
        let mut body = self.body.clone();
        body.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        Value::Object(body)
    }

    /// Full response with the diagnostic headers
    pub fn render(&self, service: &str) -> Response {
        let mut response = (self.status, axum::Json(self.render_body())).into_response();
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        headers.insert(
            HeaderName::from_static("x-circuit-breaker"),
            HeaderValue::from_static("open"),
        );
        headers.insert(
            HeaderName::from_static("x-fallback-active"),
            HeaderValue::from_static("true"),
        );
        if let Ok(value) = HeaderValue::from_str(service) {
            headers.insert(HeaderName::from_static("x-service"), value);
        }
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

/// Lifetime counters for one breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub success_requests: u64,
    pub circuit_open_count: u64,
    pub circuit_close_count: u64,
    pub last_state_change: DateTime<Utc>,
    /// Mean latency of successful requests, in seconds
    pub average_response_time: f64,
}

impl BreakerMetrics {
    fn new() -> Self {
        Self {
            total_requests: 0,
            failed_requests: 0,
            success_requests: 0,
            circuit_open_count: 0,
            circuit_close_count: 0,
            last_state_change: Utc::now(),
            average_response_time: 0.0,
        }
    }

    fn record_latency(&mut self, duration: Duration) {
        let n = self.success_requests as f64;
        self.average_response_time += (duration.as_secs_f64() - self.average_response_time) / n;
    }
}

/// Read-only view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: f64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    /// Seconds until an open breaker admits a probe
    pub next_attempt_in_secs: Option<f64>,
    pub metrics: BreakerMetrics,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    health_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
    probe_started: Option<Instant>,
    metrics: BreakerMetrics,
}

/// A single failure-isolating state machine
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    fallback: FallbackResponse,
    /// Mirror of `inner.state` for the lock-free closed fast path
    state_hint: AtomicU8,
    inner: Mutex<BreakerInner>,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings, fallback: FallbackResponse) -> Self {
        Self {
            name: name.into(),
            settings,
            fallback,
            state_hint: AtomicU8::new(CircuitState::Closed as u8),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                health_failures: 0,
                last_failure: None,
                last_success: None,
                next_attempt: None,
                probe_started: None,
                metrics: BreakerMetrics::new(),
            }),
            metrics: None,
        }
    }

    fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        metrics.set_breaker_state(&self.name, CircuitState::Closed);
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    pub fn fallback(&self) -> &FallbackResponse {
        &self.fallback
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.metrics.last_state_change = Utc::now();
        self.state_hint.store(to as u8, Ordering::Release);

        match to {
            CircuitState::Open => {
                inner.metrics.circuit_open_count += 1;
                warn!(
                    "Circuit breaker for '{}' opened ({} -> {})",
                    self.name, from, to
                );
            }
            CircuitState::Closed => {
                inner.metrics.circuit_close_count += 1;
                info!(
                    "Circuit breaker for '{}' closed ({} -> {})",
                    self.name, from, to
                );
            }
            CircuitState::HalfOpen => {
                info!("Circuit breaker for '{}' half-open, admitting probe", self.name);
            }
        }

        if let Some(ref metrics) = self.metrics {
            metrics.set_breaker_state(&self.name, to);
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.next_attempt = Some(Instant::now() + self.settings.open_timeout);
        inner.probe_started = None;
        inner.success_count = 0;
        self.transition(inner, CircuitState::Open);
    }

    /// Whether requests must be refused right now.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open here and
    /// admits the caller as its probe; concurrent callers are refused until the
    /// probe reports back.
    pub fn is_open(&self) -> bool {
        if CircuitState::from_u8(self.state_hint.load(Ordering::Acquire)) == CircuitState::Closed {
            return false;
        }

        let mut inner = self.lock();
        let now = Instant::now();
        let (state, probe) = (inner.state, inner.probe_started);
        match state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let due = inner.next_attempt.map_or(true, |at| now >= at);
                if due {
                    inner.success_count = 0;
                    inner.probe_started = Some(now);
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    false
                } else {
                    true
                }
            }
            CircuitState::HalfOpen => match probe {
                // a probe that never reported back is abandoned after the open timeout
                Some(started) if now.duration_since(started) < self.settings.open_timeout => true,
                _ => {
                    inner.probe_started = Some(now);
                    false
                }
            },
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Record a successful forward
    pub fn record_success(&self, duration: Duration) {
        let mut inner = self.lock();
        inner.metrics.total_requests += 1;
        inner.metrics.success_requests += 1;
        inner.metrics.record_latency(duration);
        self.apply_success(&mut inner);
    }

    /// Record a failed forward
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.metrics.total_requests += 1;
        inner.metrics.failed_requests += 1;
        self.apply_failure(&mut inner);
    }

    fn apply_success(&self, inner: &mut BreakerInner) {
        inner.last_success = Some(Utc::now());
        inner.failure_count = 0;
        inner.health_failures = 0;
        inner.success_count += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_started = None;
                if inner.success_count >= self.settings.success_threshold {
                    inner.success_count = 0;
                    inner.next_attempt = None;
                    self.transition(inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                // late response from a request admitted before the trip
                debug!("Ignoring success for open breaker '{}'", self.name);
            }
        }
    }

    fn apply_failure(&self, inner: &mut BreakerInner) {
        inner.last_failure = Some(Utc::now());
        inner.failure_count += 1;
        inner.success_count = 0;

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.settings.failure_threshold {
                    self.trip(inner);
                }
            }
            CircuitState::HalfOpen => self.trip(inner),
            CircuitState::Open => {
                inner.next_attempt = Some(Instant::now() + self.settings.open_timeout);
            }
        }
    }

    /// Record a passing health probe
    pub fn record_health_success(&self) {
        let mut inner = self.lock();
        match self.settings.health_failure_threshold {
            Some(_) => inner.health_failures = 0,
            None => {
                // probes never hold the half-open slot
                let probe = inner.probe_started;
                self.apply_success(&mut inner);
                if inner.state == CircuitState::HalfOpen {
                    inner.probe_started = probe;
                }
            }
        }
    }

    /// Record a failing health probe
    pub fn record_health_failure(&self) {
        let mut inner = self.lock();
        match self.settings.health_failure_threshold {
            None => self.apply_failure(&mut inner),
            Some(threshold) => {
                inner.last_failure = Some(Utc::now());
                inner.health_failures += 1;
                let state = inner.state;
                match state {
                    CircuitState::Closed if inner.health_failures >= threshold => {
                        self.trip(&mut inner)
                    }
                    CircuitState::Closed => {}
                    CircuitState::HalfOpen => self.trip(&mut inner),
                    CircuitState::Open => {
                        inner.next_attempt = Some(Instant::now() + self.settings.open_timeout);
                    }
                }
            }
        }
    }

    /// Free the half-open probe slot when an admitted request never reached a backend
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_started = None;
        }
    }

    /// Force the breaker closed with all counters zeroed
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.health_failures = 0;
        inner.next_attempt = None;
        inner.probe_started = None;
        self.transition(&mut inner, CircuitState::Closed);
        inner.metrics.last_state_change = Utc::now();
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.settings.failure_threshold,
            success_threshold: self.settings.success_threshold,
            timeout_secs: self.settings.open_timeout.as_secs_f64(),
            last_failure_time: inner.last_failure,
            last_success_time: inner.last_success,
            next_attempt_in_secs: match inner.state {
                CircuitState::Open => inner
                    .next_attempt
                    .map(|at| at.saturating_duration_since(now).as_secs_f64()),
                _ => None,
            },
            metrics: inner.metrics.clone(),
        }
    }
}

/// Owns one breaker per logical service
pub struct CircuitBreakerManager {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    generic_fallback: FallbackResponse,
}

impl CircuitBreakerManager {
    /// Create a manager from explicit breakers
    pub fn new(breakers: impl IntoIterator<Item = CircuitBreaker>) -> Self {
        Self {
            breakers: breakers
                .into_iter()
                .map(|b| (b.name.clone(), Arc::new(b)))
                .collect(),
            generic_fallback: FallbackResponse::generic(),
        }
    }

    /// Create one breaker per configured service
    pub fn from_config(config: &GatewayConfig, metrics: Option<Arc<GatewayMetrics>>) -> Self {
        Self::new(config.services.iter().map(|service| {
            let settings = BreakerSettings::from_config(
                &config.circuit_breaker,
                service.circuit_breaker.as_ref(),
            );
            let fallback = FallbackResponse::for_service(&service.name, &service.fallback);
            let breaker = CircuitBreaker::new(service.name.clone(), settings, fallback);
            match metrics {
                Some(ref metrics) => breaker.with_metrics(metrics.clone()),
                None => breaker,
            }
        }))
    }

    pub fn breaker(&self, service: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(service)
    }

    /// Fast read path; unknown services are never open
    pub fn is_open(&self, service: &str) -> bool {
        self.breakers.get(service).is_some_and(|b| b.is_open())
    }

    pub fn record_success(&self, service: &str, duration: Duration) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.record_success(duration);
        }
    }

    pub fn record_failure(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.record_failure();
        }
    }

    pub fn record_health_success(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.record_health_success();
        }
    }

    pub fn record_health_failure(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.record_health_failure();
        }
    }

    pub fn release_probe(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.release_probe();
        }
    }

    /// The precomputed substitute for a service, or the generic one
    pub fn fallback_response(&self, service: &str) -> FallbackResponse {
        self.breakers
            .get(service)
            .map(|b| b.fallback.clone())
            .unwrap_or_else(|| self.generic_fallback.clone())
    }

    pub fn reset(&self, service: &str) -> Result<(), BreakerError> {
        let breaker = self
            .breakers
            .get(service)
            .ok_or_else(|| BreakerError::UnknownService(service.to_string()))?;
        breaker.reset();
        info!("Circuit breaker reset for service '{}'", service);
        Ok(())
    }

    pub fn state(&self, service: &str) -> Option<CircuitState> {
        self.breakers.get(service).map(|b| b.state())
    }

    /// Snapshots of every breaker, ordered by service name
    pub fn status(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<_> = self.breakers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Breakers are built eagerly, so the manager is ready once constructed
    pub fn is_ready(&self) -> bool {
        true
    }

    /// Probe each service's primary health URL on a fixed interval and feed
    /// the outcome into its breaker
    pub fn spawn_health_polling(
        self: &Arc<Self>,
        endpoints: HashMap<String, String>,
        interval: Duration,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let client = match reqwest::Client::builder().timeout(timeout).build() {
                Ok(client) => client,
                Err(e) => {
                    warn!("Breaker health polling disabled: {}", e);
                    return;
                }
            };

            info!(
                "Starting breaker health polling for {} services every {:?}",
                endpoints.len(),
                interval
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                for (service, url) in &endpoints {
                    let healthy = match client.get(url).send().await {
                        Ok(response) => response.status().is_success(),
                        Err(e) => {
                            debug!("Breaker health probe for '{}' failed: {}", service, e);
                            false
                        }
                    };
                    if healthy {
                        manager.record_health_success(service);
                    } else {
                        warn!("Breaker health probe failed for service '{}'", service);
                        manager.record_health_failure(service);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(failure: u32, success: u32, timeout: Duration) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: failure,
            success_threshold: success,
            open_timeout: timeout,
            health_failure_threshold: None,
        }
    }

    fn manager_with(settings: BreakerSettings) -> CircuitBreakerManager {
        CircuitBreakerManager::new(vec![CircuitBreaker::new(
            "offer-service",
            settings,
            FallbackResponse::generic(),
        )])
    }

    #[test]
    fn test_fresh_breaker_is_closed() {
        let manager = manager_with(settings(5, 3, Duration::from_secs(30)));
        assert_eq!(manager.state("offer-service"), Some(CircuitState::Closed));
        assert!(!manager.is_open("offer-service"));
    }

    #[test]
    fn test_opens_at_failure_threshold() {
        let manager = manager_with(settings(5, 3, Duration::from_secs(30)));
        for _ in 0..4 {
            manager.record_failure("offer-service");
            assert!(!manager.is_open("offer-service"));
        }
        manager.record_failure("offer-service");
        assert!(manager.is_open("offer-service"));
        assert_eq!(manager.state("offer-service"), Some(CircuitState::Open));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let manager = manager_with(settings(3, 1, Duration::from_secs(30)));
        manager.record_failure("offer-service");
        manager.record_failure("offer-service");
        manager.record_success("offer-service", Duration::from_millis(10));
        manager.record_failure("offer-service");
        manager.record_failure("offer-service");
        assert!(!manager.is_open("offer-service"));
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let manager = manager_with(settings(1, 2, Duration::from_millis(20)));
        manager.record_failure("offer-service");
        assert!(manager.is_open("offer-service"));

        std::thread::sleep(Duration::from_millis(30));
        // first caller becomes the probe
        assert!(!manager.is_open("offer-service"));
        assert_eq!(manager.state("offer-service"), Some(CircuitState::HalfOpen));
        // others are refused while it is in flight
        assert!(manager.is_open("offer-service"));
    }

    #[test]
    fn test_concurrent_callers_get_one_probe() {
        let manager = Arc::new(manager_with(settings(1, 1, Duration::from_millis(20))));
        manager.record_failure("offer-service");
        std::thread::sleep(Duration::from_millis(30));

        let callers = 16;
        let barrier = Arc::new(std::sync::Barrier::new(callers));
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    !manager.is_open("offer-service")
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();

        assert_eq!(admitted, 1);
        assert_eq!(manager.state("offer-service"), Some(CircuitState::HalfOpen));
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let manager = manager_with(settings(1, 2, Duration::from_millis(20)));
        manager.record_failure("offer-service");
        std::thread::sleep(Duration::from_millis(30));

        assert!(!manager.is_open("offer-service"));
        manager.record_success("offer-service", Duration::from_millis(5));
        assert_eq!(manager.state("offer-service"), Some(CircuitState::HalfOpen));

        // slot freed, next probe admitted
        assert!(!manager.is_open("offer-service"));
        manager.record_success("offer-service", Duration::from_millis(5));
        assert_eq!(manager.state("offer-service"), Some(CircuitState::Closed));

        let snapshot = &manager.status()[0];
        assert_eq!(snapshot.metrics.circuit_open_count, 1);
        assert_eq!(snapshot.metrics.circuit_close_count, 1);
        assert_eq!(snapshot.success_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let manager = manager_with(settings(1, 2, Duration::from_millis(20)));
        manager.record_failure("offer-service");
        std::thread::sleep(Duration::from_millis(30));

        assert!(!manager.is_open("offer-service"));
        manager.record_failure("offer-service");
        assert_eq!(manager.state("offer-service"), Some(CircuitState::Open));
        // next_attempt was pushed out again
        assert!(manager.is_open("offer-service"));
    }

    #[test]
    fn test_failures_while_open_extend_next_attempt() {
        let manager = manager_with(settings(1, 1, Duration::from_millis(50)));
        manager.record_failure("offer-service");
        std::thread::sleep(Duration::from_millis(30));
        manager.record_failure("offer-service");
        std::thread::sleep(Duration::from_millis(30));
        // 60ms since the first trip but only 30ms since the extension
        assert!(manager.is_open("offer-service"));
        assert_eq!(manager.status()[0].metrics.circuit_open_count, 1);
    }

    #[test]
    fn test_release_probe_frees_slot() {
        let manager = manager_with(settings(1, 1, Duration::from_millis(20)));
        manager.record_failure("offer-service");
        std::thread::sleep(Duration::from_millis(30));

        assert!(!manager.is_open("offer-service"));
        assert!(manager.is_open("offer-service"));
        manager.release_probe("offer-service");
        assert!(!manager.is_open("offer-service"));
    }

    #[test]
    fn test_reset_closes_with_zero_counters() {
        let manager = manager_with(settings(2, 1, Duration::from_secs(30)));
        manager.record_failure("offer-service");
        manager.record_failure("offer-service");
        assert!(manager.is_open("offer-service"));

        manager.reset("offer-service").unwrap();
        let snapshot = &manager.status()[0];
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
        assert!(!manager.is_open("offer-service"));
    }

    #[test]
    fn test_unknown_service() {
        let manager = manager_with(BreakerSettings::default());
        assert!(!manager.is_open("ghost"));
        manager.record_failure("ghost");
        assert!(matches!(
            manager.reset("ghost"),
            Err(BreakerError::UnknownService(_))
        ));
        assert_eq!(
            manager.fallback_response("ghost").status,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_separate_health_threshold() {
        let manager = manager_with(BreakerSettings {
            health_failure_threshold: Some(2),
            ..settings(5, 1, Duration::from_secs(30))
        });

        manager.record_health_failure("offer-service");
        assert!(!manager.is_open("offer-service"));
        manager.record_health_failure("offer-service");
        assert!(manager.is_open("offer-service"));
        // request failure counter untouched by probes
        assert_eq!(manager.status()[0].failure_count, 0);
    }

    #[test]
    fn test_health_failures_share_counter_by_default() {
        let manager = manager_with(settings(3, 1, Duration::from_secs(30)));
        manager.record_failure("offer-service");
        manager.record_health_failure("offer-service");
        manager.record_health_failure("offer-service");
        assert!(manager.is_open("offer-service"));
    }

    #[test]
    fn test_service_fallback_body() {
        let mut config = FallbackConfig {
            message: Some("Pricing service temporarily unavailable".to_string()),
            ..FallbackConfig::default()
        };
        config.body.insert("price".to_string(), json!(0.0));
        config.body.insert("currency".to_string(), json!("USD"));

        let fallback = FallbackResponse::for_service("pricing-service", &config);
        let body = fallback.render_body();
        assert_eq!(body["fallback"], true);
        assert_eq!(body["currency"], "USD");
        assert_eq!(body["message"], "Pricing service temporarily unavailable");
        assert!(body["timestamp"].is_string());

        let response = fallback.render("pricing-service");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["x-circuit-breaker"], "open");
        assert_eq!(response.headers()["x-service"], "pricing-service");
    }

    #[test]
    fn test_average_response_time() {
        let manager = manager_with(BreakerSettings::default());
        manager.record_success("offer-service", Duration::from_millis(100));
        manager.record_success("offer-service", Duration::from_millis(300));
        let avg = manager.status()[0].metrics.average_response_time;
        assert!((avg - 0.2).abs() < 1e-9);
    }
}
