//! Load balancer module
//!
//! Picks exactly one healthy target per request with one of three strategies:
//! - Round Robin: rotates a per-service index across healthy targets
//! - Weighted: picks with probability proportional to weight
//! - Least Connections: picks the target with the fewest in-flight forwards

use crate::config::LoadBalancingStrategy;
use crate::registry::{ServiceRegistry, ServiceTarget};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub use crate::config::LoadBalancingStrategy as Strategy;

/// Target selection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalancerError {
    #[error("no healthy targets for service '{0}'")]
    NoHealthyTargets(String),
    #[error("every healthy target for service '{0}' has zero weight")]
    NoEligibleTargets(String),
}

/// Keeps a target's in-flight count raised until dropped
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A chosen target, counted as in flight while held
#[derive(Debug)]
pub struct SelectedTarget {
    pub target: ServiceTarget,
    _guard: InFlightGuard,
}

impl SelectedTarget {
    fn new(target: ServiceTarget) -> Self {
        let guard = InFlightGuard::new(Arc::clone(&target.in_flight));
        Self {
            target,
            _guard: guard,
        }
    }
}

/// Health-aware target selector
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    strategy: Strategy,
    /// Round-robin cursor per service, created for every registered service
    cursors: HashMap<String, AtomicUsize>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<ServiceRegistry>, strategy: Strategy) -> Self {
        let cursors = registry
            .service_names()
            .into_iter()
            .map(|name| (name, AtomicUsize::new(0)))
            .collect();
        Self {
            registry,
            strategy,
            cursors,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Get the strategy name
    pub fn strategy_name(&self) -> &'static str {
        match self.strategy {
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::Weighted => "weighted",
            LoadBalancingStrategy::LeastConnections => "least_connections",
        }
    }

    /// Select a healthy target for a service
    pub fn select(&self, service: &str) -> Result<SelectedTarget, BalancerError> {
        let healthy = self.registry.healthy_targets(service);
        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyTargets(service.to_string()));
        }

        let index = match self.strategy {
            LoadBalancingStrategy::RoundRobin => self
                .round_robin(service, healthy.len())
                .ok_or_else(|| BalancerError::NoHealthyTargets(service.to_string()))?,
            LoadBalancingStrategy::Weighted => weighted_index(&healthy)
                .ok_or_else(|| BalancerError::NoEligibleTargets(service.to_string()))?,
            LoadBalancingStrategy::LeastConnections => least_connections_index(&healthy)
                .ok_or_else(|| BalancerError::NoHealthyTargets(service.to_string()))?,
        };

        let target = healthy.into_iter().nth(index);
        target
            .map(SelectedTarget::new)
            .ok_or_else(|| BalancerError::NoHealthyTargets(service.to_string()))
    }

    fn round_robin(&self, service: &str, len: usize) -> Option<usize> {
        let index = match self.cursors.get(service) {
            Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed),
            None => 0,
        };
        Some(index % len)
    }
}

/// Weighted selection over targets with a nonzero weight.
/// Returns `None` when no candidate carries any weight.
fn weighted_index(targets: &[ServiceTarget]) -> Option<usize> {
    let total_weight: u64 = targets.iter().map(|t| u64::from(t.weight)).sum();
    if total_weight == 0 {
        return None;
    }

    let mut rng = rand::thread_rng();
    let random_weight = rng.gen_range(0..total_weight);
    let mut cumulative_weight = 0u64;
    for (i, target) in targets.iter().enumerate() {
        cumulative_weight += u64::from(target.weight);
        if random_weight < cumulative_weight {
            return Some(i);
        }
    }

    // unreachable while random_weight < total_weight
    targets.iter().rposition(|t| t.weight > 0)
}

/// Fewest in-flight forwards, first target on ties
fn least_connections_index(targets: &[ServiceTarget]) -> Option<usize> {
    targets
        .iter()
        .enumerate()
        .min_by_key(|(i, t)| (t.in_flight(), *i))
        .map(|(i, _)| i)
}
