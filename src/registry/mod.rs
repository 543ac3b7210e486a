//! Service registry
//!
//! Holds, per logical service, the weighted targets requests can be sent to
//! together with their current health. The map is read on every request and
//! written only by the health checker, so it sits behind a reader/writer lock.

mod checker;

pub use checker::HealthChecker;

use crate::config::GatewayConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{info, warn};

/// A backend instance of a logical service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceTarget {
    pub name: String,
    pub url: String,
    pub weight: u32,
    pub health_path: String,
    pub timeout_ms: u64,
    pub retries: u32,
    pub healthy: bool,
    /// Smoothed probe outcome in `[0, 1]`
    pub health_score: f64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    /// Forwards currently in flight, shared by every clone of this target
    #[serde(skip)]
    pub in_flight: Arc<AtomicUsize>,
}

impl ServiceTarget {
    pub fn new(name: impl Into<String>, url: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            weight,
            health_path: "/health".to_string(),
            timeout_ms: 5_000,
            retries: 0,
            healthy: true,
            health_score: 1.0,
            last_check: None,
            last_latency_ms: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Full URL of the target's health endpoint
    pub fn health_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if self.health_path.starts_with('/') {
            format!("{}{}", base, self.health_path)
        } else {
            format!("{}/{}", base, self.health_path)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Outcome of one health probe
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub service: String,
    pub target: String,
    pub url: String,
    pub healthy: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Read-only view of a service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    pub name: String,
    pub healthy: bool,
    pub total_targets: usize,
    pub healthy_targets: usize,
    /// Mean health score across targets
    pub health_score: f64,
    pub in_flight: usize,
    pub targets: Vec<ServiceTarget>,
}

impl ServiceView {
    fn new(name: &str, targets: &[ServiceTarget]) -> Self {
        let healthy_targets = targets.iter().filter(|t| t.healthy).count();
        let health_score = if targets.is_empty() {
            0.0
        } else {
            targets.iter().map(|t| t.health_score).sum::<f64>() / targets.len() as f64
        };
        Self {
            name: name.to_string(),
            healthy: healthy_targets > 0,
            total_targets: targets.len(),
            healthy_targets,
            health_score,
            in_flight: targets.iter().map(|t| t.in_flight()).sum(),
            targets: targets.to_vec(),
        }
    }
}

/// Registry of services and their targets
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Vec<ServiceTarget>>>,
}

impl ServiceRegistry {
    pub fn new(services: HashMap<String, Vec<ServiceTarget>>) -> Self {
        Self {
            services: RwLock::new(services),
        }
    }

    /// Build the registry from the configured services
    pub fn from_config(config: &GatewayConfig) -> Self {
        let services = config
            .services
            .iter()
            .map(|service| {
                let targets = service
                    .targets
                    .iter()
                    .enumerate()
                    .map(|(i, target)| ServiceTarget {
                        health_path: target.health_path.clone(),
                        timeout_ms: target.timeout_ms,
                        retries: target.retries,
                        ..ServiceTarget::new(
                            target
                                .name
                                .clone()
                                .unwrap_or_else(|| format!("{}-{}", service.name, i)),
                            target.url.clone(),
                            target.weight,
                        )
                    })
                    .collect();
                (service.name.clone(), targets)
            })
            .collect();

        Self::new(services)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<ServiceTarget>>> {
        self.services.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<ServiceTarget>>> {
        self.services.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_service(&self, name: &str) -> Option<ServiceView> {
        self.read()
            .get(name)
            .map(|targets| ServiceView::new(name, targets))
    }

    pub fn all_services(&self) -> BTreeMap<String, ServiceView> {
        self.read()
            .iter()
            .map(|(name, targets)| (name.clone(), ServiceView::new(name, targets)))
            .collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// All targets of a service, healthy or not
    pub fn targets(&self, service: &str) -> Vec<ServiceTarget> {
        self.read().get(service).cloned().unwrap_or_default()
    }

    pub fn healthy_targets(&self, service: &str) -> Vec<ServiceTarget> {
        self.read()
            .get(service)
            .map(|targets| targets.iter().filter(|t| t.healthy).cloned().collect())
            .unwrap_or_default()
    }

    /// Every (service, target) pair, for probing
    pub fn all_targets(&self) -> Vec<(String, ServiceTarget)> {
        self.read()
            .iter()
            .flat_map(|(service, targets)| {
                targets
                    .iter()
                    .map(move |target| (service.clone(), target.clone()))
            })
            .collect()
    }

    /// Record a probe outcome for a target. Returns false if the target is unknown.
    pub fn set_target_health(
        &self,
        service: &str,
        target: &str,
        healthy: bool,
        latency: Option<Duration>,
    ) -> bool {
        let mut services = self.write();
        let Some(entry) = services
            .get_mut(service)
            .and_then(|targets| targets.iter_mut().find(|t| t.name == target))
        else {
            warn!("Health result for unknown target '{}/{}'", service, target);
            return false;
        };

        if entry.healthy != healthy {
            if healthy {
                info!("Target '{}/{}' is healthy again", service, target);
            } else {
                warn!("Target '{}/{}' marked unhealthy", service, target);
            }
        }

        entry.healthy = healthy;
        entry.health_score = if healthy {
            ((entry.health_score + 1.0) / 2.0).min(1.0)
        } else {
            (entry.health_score * 0.8).max(0.0)
        };
        entry.last_check = Some(Utc::now());
        entry.last_latency_ms = latency.map(|d| d.as_millis() as u64);
        true
    }

    /// Service name to "has at least one healthy target"
    pub fn health_status(&self) -> BTreeMap<String, bool> {
        self.read()
            .iter()
            .map(|(name, targets)| (name.clone(), targets.iter().any(|t| t.healthy)))
            .collect()
    }

    /// Ready when every service has at least one target registered
    pub fn is_ready(&self) -> bool {
        self.read().values().all(|targets| !targets.is_empty())
    }
}
