//! Gateway health module
//!
//! This module reports the gateway's own health:
//! - Liveness with a per-service availability summary
//! - Readiness, true only when every dependency reports ready

use crate::auth::AuthHook;
use crate::circuit::CircuitBreakerManager;
use crate::ratelimit::RateLimiter;
use crate::registry::ServiceRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Health status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// Liveness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    /// Service name to "has a healthy target"
    pub services: BTreeMap<String, bool>,
    pub timestamp: DateTime<Utc>,
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: BTreeMap<String, bool>,
    pub timestamp: DateTime<Utc>,
}

/// Liveness and readiness over the gateway's dependencies
#[derive(Clone)]
pub struct GatewayHealth {
    start_time: Instant,
    version: String,
    auth: Arc<dyn AuthHook>,
    limiter: Arc<RateLimiter>,
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerManager>,
}

impl GatewayHealth {
    pub fn new(
        auth: Arc<dyn AuthHook>,
        limiter: Arc<RateLimiter>,
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerManager>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            auth,
            limiter,
            registry,
            breakers,
        }
    }

    /// The process is alive; services without a healthy target degrade the status
    pub fn liveness(&self) -> HealthResponse {
        let services = self.registry.health_status();
        let status = if services.values().all(|healthy| *healthy) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthResponse {
            status,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            services,
            timestamp: Utc::now(),
        }
    }

    /// Ready only when the auth hook, rate limiter, registry and breaker
    /// manager all report ready
    pub async fn readiness(&self) -> ReadinessResponse {
        let mut checks = BTreeMap::new();
        checks.insert("auth".to_string(), self.auth.is_ready());
        checks.insert("rate_limiter".to_string(), self.limiter.is_ready().await);
        checks.insert("service_registry".to_string(), self.registry.is_ready());
        checks.insert("circuit_breaker".to_string(), self.breakers.is_ready());

        ReadinessResponse {
            ready: checks.values().all(|ready| *ready),
            checks,
            timestamp: Utc::now(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get formatted uptime string
    pub fn uptime_formatted(&self) -> String {
        let total_seconds = self.uptime_seconds();
        let days = total_seconds / 86400;
        let hours = (total_seconds % 86400) / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;

        if days > 0 {
            format!("{}d {}h {}m {}s", days, hours, minutes, seconds)
        } else if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, AuthDecision};
    use crate::config::RateLimitConfig;
    use crate::ratelimit::MemoryCounterStore;
    use crate::registry::ServiceTarget;
    use async_trait::async_trait;
    use axum::http::request::Parts;
    use std::collections::HashMap;

    struct NotReady;

    #[async_trait]
    impl AuthHook for NotReady {
        async fn authorize(&self, _parts: &Parts) -> AuthDecision {
            AuthDecision::Allow { identity: None }
        }

        fn is_ready(&self) -> bool {
            false
        }
    }

    fn health(auth: Arc<dyn AuthHook>) -> GatewayHealth {
        let mut services = HashMap::new();
        services.insert(
            "pricing-service".to_string(),
            vec![ServiceTarget::new("pricing-a", "http://pricing-a:8080", 1)],
        );
        GatewayHealth::new(
            auth,
            Arc::new(RateLimiter::new(
                RateLimitConfig::default(),
                Arc::new(MemoryCounterStore::new()),
            )),
            Arc::new(ServiceRegistry::new(services)),
            Arc::new(CircuitBreakerManager::new(vec![])),
        )
    }

    #[test]
    fn test_liveness() {
        let health = health(Arc::new(AllowAll));
        let response = health.liveness();

        assert_eq!(response.status, HealthStatus::Healthy);
        assert!(!response.version.is_empty());
        assert_eq!(response.services["pricing-service"], true);
    }

    #[test]
    fn test_liveness_degraded_without_healthy_targets() {
        let health = health(Arc::new(AllowAll));
        health
            .registry
            .set_target_health("pricing-service", "pricing-a", false, None);

        let response = health.liveness();
        assert_eq!(response.status, HealthStatus::Degraded);
        assert_eq!(response.services["pricing-service"], false);
    }

    #[tokio::test]
    async fn test_readiness() {
        let response = health(Arc::new(AllowAll)).readiness().await;
        assert!(response.ready);
        assert_eq!(response.checks.len(), 4);
        assert!(response.checks.values().all(|ready| *ready));
    }

    #[tokio::test]
    async fn test_readiness_requires_auth_hook() {
        let response = health(Arc::new(NotReady)).readiness().await;
        assert!(!response.ready);
        assert_eq!(response.checks["auth"], false);
        assert_eq!(response.checks["rate_limiter"], true);
    }

    #[test]
    fn test_uptime_formatted() {
        let uptime = health(Arc::new(AllowAll)).uptime_formatted();

        // Should start with a number
        assert!(uptime.chars().next().unwrap().is_ascii_digit());
    }
}
