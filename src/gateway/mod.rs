//! Gateway assembly
//!
//! Builds every manager from configuration, wires them into the request
//! pipeline and owns the background tasks that keep their state fresh.

use crate::auth::{AuthHook, StaticTokenAuth};
use crate::balancer::LoadBalancer;
use crate::circuit::CircuitBreakerManager;
use crate::config::{CounterBackend, CounterStoreConfig, GatewayConfig};
use crate::health::GatewayHealth;
use crate::management::{self, AppState};
use crate::metrics::GatewayMetrics;
use crate::proxy::{ProxyService, RouteTable};
use crate::ratelimit::{CounterStore, MemoryCounterStore, RateLimiter, RedisCounterStore};
use crate::registry::{HealthChecker, ServiceRegistry};
use anyhow::Context;
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A fully wired gateway
pub struct Gateway {
    state: AppState,
}

impl Gateway {
    /// Build the gateway with the static token authorization hook from `[auth]`
    pub async fn build(config: GatewayConfig) -> crate::Result<Self> {
        if config.auth.tokens.is_empty() && config.routes.iter().any(|r| r.auth_required) {
            warn!("Routes require authorization but no [auth] tokens are configured; they will reject every request");
        }
        let auth: Arc<dyn AuthHook> = Arc::new(StaticTokenAuth::from_config(&config.auth));
        Self::build_with_auth(config, auth).await
    }

    /// Build the gateway around an injected authorization hook
    pub async fn build_with_auth(config: GatewayConfig, auth: Arc<dyn AuthHook>) -> crate::Result<Self> {
        config.validate()?;

        let metrics = Arc::new(GatewayMetrics::new());
        let registry = Arc::new(ServiceRegistry::from_config(&config));
        let breakers = Arc::new(CircuitBreakerManager::from_config(
            &config,
            Some(metrics.clone()),
        ));

        let store = counter_store(&config.counter_store).await?;
        let limiter = Arc::new(
            RateLimiter::new(config.rate_limit.clone(), store)
                .with_key_prefix(config.counter_store.key_prefix.clone())
                .with_store_policy(config.counter_store.timeout(), config.counter_store.fail_open)
                .with_metrics(metrics.clone()),
        );

        let balancer = Arc::new(LoadBalancer::new(
            registry.clone(),
            config.load_balancer.strategy,
        ));
        let checker = Arc::new(
            HealthChecker::new(
                registry.clone(),
                breakers.clone(),
                config.registry.interval(),
                config.registry.timeout(),
            )
            .with_metrics(metrics.clone()),
        );
        let health = Arc::new(GatewayHealth::new(
            auth.clone(),
            limiter.clone(),
            registry.clone(),
            breakers.clone(),
        ));

        let proxy = ProxyService::new(
            RouteTable::from_config(&config),
            auth,
            limiter.clone(),
            breakers.clone(),
            balancer.clone(),
            metrics.clone(),
        );

        info!(
            "Gateway built: {} services, {} routes, {} load balancing",
            config.services.len(),
            config.route_count(),
            balancer.strategy_name()
        );

        Ok(Self {
            state: AppState {
                config: Arc::new(config),
                proxy,
                metrics,
                registry,
                checker,
                breakers,
                limiter,
                health,
            },
        })
    }

    /// The HTTP router: operational, management and proxied routes
    pub fn router(&self) -> Router {
        management::router(self.state.clone())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.state.config
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.state.metrics
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.state.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.state.breakers
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.state.limiter
    }

    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.state.checker
    }

    /// Start the timer-driven tasks. An interval of zero disables a task.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let config = &self.state.config;
        let mut handles = Vec::new();

        if config.registry.health_check_interval_secs > 0 {
            handles.push(self.state.checker.clone().spawn());
        }

        if config.rate_limit.cleanup_interval_secs > 0 {
            handles.push(
                self.state
                    .limiter
                    .spawn_cleanup(Duration::from_secs(config.rate_limit.cleanup_interval_secs)),
            );
        }

        let caching = self.state.proxy.routes().routes().iter().any(|r| r.cache_ttl.is_some());
        if caching && config.rate_limit.cleanup_interval_secs > 0 {
            handles.push(
                self.state
                    .proxy
                    .cache()
                    .spawn_purge(Duration::from_secs(config.rate_limit.cleanup_interval_secs)),
            );
        }

        if let Some(secs) = config.circuit_breaker.health_poll_interval_secs.filter(|s| *s > 0) {
            let endpoints: HashMap<String, String> = config
                .services
                .iter()
                .filter_map(|service| {
                    let primary = self.state.registry.targets(&service.name).into_iter().next()?;
                    Some((service.name.clone(), primary.health_url()))
                })
                .collect();
            handles.push(self.state.breakers.spawn_health_polling(
                endpoints,
                Duration::from_secs(secs),
                config.registry.timeout(),
            ));
        }

        if config.monitoring.enabled && config.monitoring.report_interval_secs > 0 {
            handles.push(
                self.state
                    .metrics
                    .spawn_reporting(Duration::from_secs(config.monitoring.report_interval_secs)),
            );
        }

        info!("Started {} background tasks", handles.len());
        BackgroundTasks { handles }
    }
}

/// Handles of the running background tasks
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort every task and wait for them to stop
    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("Background tasks stopped");
    }
}

async fn counter_store(config: &CounterStoreConfig) -> crate::Result<Arc<dyn CounterStore>> {
    match config.backend {
        CounterBackend::Memory => {
            info!("Using in-memory counter store");
            Ok(Arc::new(MemoryCounterStore::new()))
        }
        CounterBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("redis counter store requires redis_url")?;
            let store = tokio::time::timeout(
                REDIS_CONNECT_TIMEOUT,
                RedisCounterStore::connect(url, &config.key_prefix),
            )
            .await
            .context("timed out connecting to the redis counter store")?
            .context("failed to connect to the redis counter store")?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[registry]
health_check_interval_secs = 0

[monitoring]
enabled = false

[[services]]
name = "pricing-service"
targets = [{ url = "http://127.0.0.1:9", weight = 1 }]

[[routes]]
path = "/pricing/*"
service = "pricing-service"
"#;

    #[tokio::test]
    async fn test_build_from_config() {
        let gateway = Gateway::build(GatewayConfig::parse(CONFIG).unwrap())
            .await
            .unwrap();

        assert_eq!(gateway.breakers().services(), vec!["pricing-service"]);
        assert_eq!(gateway.registry().service_names(), vec!["pricing-service"]);
        assert!(gateway.limiter().is_ready().await);
        assert_eq!(gateway.config().route_count(), 1);
    }

    #[tokio::test]
    async fn test_background_tasks_respect_zero_intervals() {
        let gateway = Gateway::build(GatewayConfig::parse(CONFIG).unwrap())
            .await
            .unwrap();

        // only the rate limiter cleanup remains enabled
        let tasks = gateway.spawn_background();
        assert_eq!(tasks.len(), 1);
        tasks.shutdown().await;
    }
}
