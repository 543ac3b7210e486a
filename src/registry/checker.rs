//! Periodic health probing of registered targets

use super::{HealthCheckResult, ServiceRegistry, ServiceTarget};
use crate::circuit::CircuitBreakerManager;
use crate::metrics::GatewayMetrics;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Probes every target's health endpoint and applies the outcome to the
/// registry, the circuit breakers and the target health gauge
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    metrics: Option<Arc<GatewayMetrics>>,
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerManager>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            breakers,
            metrics: None,
            client: reqwest::Client::new(),
            interval,
            timeout,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn probe(
        client: reqwest::Client,
        service: String,
        target: ServiceTarget,
        timeout: Duration,
    ) -> HealthCheckResult {
        let url = target.health_url();
        let start = Instant::now();
        let outcome = client.get(&url).timeout(timeout).send().await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let (healthy, status, error) = match outcome {
            Ok(response) => {
                let status = response.status();
                let error = (!status.is_success())
                    .then(|| format!("health check failed with status: {}", status.as_u16()));
                (status.is_success(), Some(status.as_u16()), error)
            }
            Err(e) if e.is_timeout() => (false, None, Some(format!("timed out after {:?}", timeout))),
            Err(e) => (false, None, Some(e.to_string())),
        };

        HealthCheckResult {
            service,
            target: target.name,
            url,
            healthy,
            status,
            error,
            latency_ms,
            timestamp: Utc::now(),
        }
    }

    /// Probe every target concurrently without applying the results
    pub async fn health_check_all(&self) -> Vec<HealthCheckResult> {
        let mut probes = JoinSet::new();
        for (service, target) in self.registry.all_targets() {
            probes.spawn(Self::probe(
                self.client.clone(),
                service,
                target,
                self.timeout,
            ));
        }

        let mut results = Vec::with_capacity(probes.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!("Health probe task failed: {}", e),
            }
        }
        results.sort_by(|a, b| (&a.service, &a.target).cmp(&(&b.service, &b.target)));
        results
    }

    fn apply(&self, result: &HealthCheckResult) {
        self.registry.set_target_health(
            &result.service,
            &result.target,
            result.healthy,
            Some(Duration::from_millis(result.latency_ms)),
        );

        if result.healthy {
            self.breakers.record_health_success(&result.service);
        } else {
            warn!(
                "Health check failed for '{}/{}': {}",
                result.service,
                result.target,
                result.error.as_deref().unwrap_or("unknown error")
            );
            self.breakers.record_health_failure(&result.service);
        }

        if let Some(ref metrics) = self.metrics {
            metrics.set_target_health(&result.service, &result.target, result.healthy);
        }
    }

    /// Re-check every target now and apply the results
    pub async fn refresh(&self) -> Vec<HealthCheckResult> {
        let results = self.health_check_all().await;
        for result in &results {
            self.apply(result);
        }
        let healthy = results.iter().filter(|r| r.healthy).count();
        debug!(
            "Health check round complete: {}/{} targets healthy",
            healthy,
            results.len()
        );
        results
    }

    /// Run [`HealthChecker::refresh`] immediately and then on every interval
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Starting health checker with interval: {}s",
                self.interval.as_secs()
            );
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.refresh().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{BreakerSettings, CircuitBreaker, CircuitState, FallbackResponse};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;

    async fn spawn_backend(status: StatusCode) -> String {
        let app = Router::new().route("/health", get(move || async move { status }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn checker(targets: Vec<ServiceTarget>, failure_threshold: u32) -> HealthChecker {
        let mut services = HashMap::new();
        services.insert("pricing-service".to_string(), targets);
        let registry = Arc::new(ServiceRegistry::new(services));
        let breakers = Arc::new(CircuitBreakerManager::new(vec![CircuitBreaker::new(
            "pricing-service",
            BreakerSettings {
                failure_threshold,
                ..BreakerSettings::default()
            },
            FallbackResponse::generic(),
        )]));
        HealthChecker::new(
            registry,
            breakers,
            Duration::from_secs(30),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_failed_probe_marks_unhealthy_and_feeds_breaker() {
        let good = spawn_backend(StatusCode::OK).await;
        let bad = spawn_backend(StatusCode::SERVICE_UNAVAILABLE).await;

        let checker = checker(
            vec![
                ServiceTarget::new("pricing-a", bad, 70),
                ServiceTarget::new("pricing-b", good, 30),
            ],
            1,
        );

        let results = checker.refresh().await;
        assert_eq!(results.len(), 2);
        assert!(!results[0].healthy);
        assert_eq!(results[0].status, Some(503));
        assert!(results[1].healthy);

        let healthy = checker.registry.healthy_targets("pricing-service");
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, "pricing-b");
        assert!(checker.registry.targets("pricing-service")[0].last_check.is_some());

        // one failure with threshold 1 trips the breaker, the later success does not close it
        assert_eq!(
            checker.breakers.state("pricing-service"),
            Some(CircuitState::Open)
        );
    }

    #[tokio::test]
    async fn test_unreachable_target() {
        // port 9 (discard) is closed on test hosts
        let checker = checker(
            vec![ServiceTarget::new("pricing-a", "http://127.0.0.1:9", 1)],
            5,
        );

        let results = checker.health_check_all().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].healthy);
        assert!(results[0].error.is_some());
        // health_check_all does not apply results
        assert!(checker.registry.targets("pricing-service")[0].healthy);
    }
}
