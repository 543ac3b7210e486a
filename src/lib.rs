//! Resilience Gateway - an API gateway that keeps failing backends contained
//!
//! This is a gateway service that provides:
//! - Static route table with per-route auth, limits, deadlines, caching and header transforms
//! - Multi-dimensional sliding-window rate limiting over a pluggable counter store
//! - One circuit breaker per backend service with precomputed fallbacks
//! - Health-checked service registry and load balancing
//! - Prometheus metrics and a per-service monitor
//! - Liveness, readiness and admin-guarded management endpoints

pub mod auth;
pub mod balancer;
pub mod circuit;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod management;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod registry;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::{BackgroundTasks, Gateway};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
