//! HTTP surface of the gateway
//!
//! - Operational endpoints: liveness, readiness and Prometheus metrics
//! - Management endpoints behind the admin token guard
//! - Everything else falls through to the proxy pipeline

use crate::circuit::CircuitBreakerManager;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::health::GatewayHealth;
use crate::metrics::GatewayMetrics;
use crate::proxy::{ProxyService, RouteInfo};
use crate::ratelimit::{RateLimitKey, RateLimiter};
use crate::registry::{HealthChecker, ServiceRegistry};
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub proxy: ProxyService,
    pub metrics: Arc<GatewayMetrics>,
    pub registry: Arc<ServiceRegistry>,
    pub checker: Arc<HealthChecker>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub limiter: Arc<RateLimiter>,
    pub health: Arc<GatewayHealth>,
}

/// Build the full router
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/status", get(status_handler))
        .route("/management/routes", get(routes_handler))
        .route("/management/config", get(config_handler))
        .route("/management/services", get(services_handler))
        .route("/management/metrics", get(detailed_metrics_handler))
        .route("/management/circuit-breakers", get(circuit_breakers_handler))
        .route(
            "/management/circuit-breakers/:service/reset",
            post(reset_circuit_breaker_handler),
        )
        .route("/management/rate-limits", get(rate_limits_handler))
        .route("/management/rate-limits/reset", post(reset_rate_limits_handler))
        .route("/management/rate-limits/usage/*key", get(rate_limit_usage_handler))
        .route("/management/registry/refresh", post(refresh_registry_handler))
        .route("/management/registry/health-check", post(health_check_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_guard));

    let mut app = Router::new();
    if state.config.health.enabled {
        app = app
            .route(&state.config.health.path, get(liveness_handler))
            .route(&state.config.health.ready_path, get(readiness_handler));
        info!("Health endpoint enabled at {}", state.config.health.path);
    }
    if state.config.metrics.enabled {
        app = app.route(&state.config.metrics.path, get(metrics_handler));
        info!("Metrics endpoint enabled at {}", state.config.metrics.path);
    }
    if state.config.admin.enabled {
        info!(
            "Admin token guard enabled on the management surface (header: {})",
            state.config.admin.header_name
        );
    } else {
        warn!("Admin token guard is disabled, management endpoints are open");
    }

    app.merge(admin)
        .fallback(proxy_handler)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Admin token middleware for the management surface
async fn admin_guard(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let admin = &state.config.admin;
    if !admin.enabled {
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get(admin.header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
        .filter(|v| !v.is_empty());

    match token {
        Some(token) if admin.validate_token(token) => next.run(req).await,
        Some(_) => {
            warn!("Rejected management request with an invalid admin token");
            GatewayError::Forbidden {
                reason: "invalid admin token".to_string(),
            }
            .into_response()
        }
        None => GatewayError::Unauthorized {
            reason: format!("missing {} header", admin.header_name),
        }
        .into_response(),
    }
}

/// A panicking handler answers 500 with the generic internal error body
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!("Request handler panicked: {}", detail);
    GatewayError::Internal(detail).into_response()
}

/// Liveness handler
async fn liveness_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.health.liveness()))
}

/// Readiness handler
async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    let readiness = state.health.readiness().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}

/// Metrics handler
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.prometheus_output(),
    )
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    Json(json!({
        "gateway": {
            "version": state.health.version(),
            "uptime": state.health.uptime_formatted(),
            "uptime_seconds": state.health.uptime_seconds(),
            "requests": snapshot.total_requests,
            "errors": snapshot.total_errors,
            "error_rate": snapshot.error_rate,
            "routes": state.proxy.routes().len(),
        },
        "services": state.registry.all_services(),
        "rate_limits": state.limiter.status().await,
        "circuit_breakers": state.breakers.status(),
        "timestamp": Utc::now(),
    }))
}

async fn routes_handler(State(state): State<AppState>) -> impl IntoResponse {
    let routes: Vec<RouteInfo> = state.proxy.routes().routes().iter().map(|r| r.info()).collect();
    Json(routes)
}

/// Running configuration with secrets redacted
async fn config_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.sanitized())
}

/// Registry view of every service joined with its monitor counters
async fn services_handler(State(state): State<AppState>) -> impl IntoResponse {
    let services: BTreeMap<String, Value> = state
        .registry
        .all_services()
        .into_iter()
        .map(|(name, view)| {
            let metrics = state.metrics.service_snapshot(&name);
            let mut value = serde_json::to_value(view).unwrap_or(Value::Null);
            if let Value::Object(ref mut map) = value {
                map.insert("metrics".into(), json!(metrics));
            }
            (name, value)
        })
        .collect();
    Json(services)
}

async fn detailed_metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.detailed())
}

async fn circuit_breakers_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.breakers.status())
}

async fn reset_circuit_breaker_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Response {
    match state.breakers.reset(&service) {
        Ok(()) => Json(json!({
            "message": format!("Circuit breaker reset for service {}", service),
            "service": service,
            "state": state.breakers.state(&service),
            "timestamp": Utc::now(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Not Found",
                "message": e.to_string(),
                "timestamp": Utc::now(),
            })),
        )
            .into_response(),
    }
}

async fn rate_limits_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.limiter.status().await)
}

async fn reset_rate_limits_handler(State(state): State<AppState>) -> Response {
    match state.limiter.reset().await {
        Ok(()) => Json(json!({
            "message": "Rate limits reset",
            "timestamp": Utc::now(),
        }))
        .into_response(),
        Err(e) => {
            warn!("Failed to reset rate limits: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "Service Unavailable",
                    "message": "Counter store unavailable",
                    "timestamp": Utc::now(),
                })),
            )
                .into_response()
        }
    }
}

/// Current window usage of one counter, addressed as `dimension:identity`
async fn rate_limit_usage_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    let Some(parsed) = RateLimitKey::parse(&key) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Bad Request",
                "message": format!("'{}' is not a valid rate limit key", key),
                "timestamp": Utc::now(),
            })),
        )
            .into_response();
    };

    match state.limiter.current_usage(&parsed).await {
        Ok(usage) => Json(json!({
            "key": parsed.to_string(),
            "usage": usage,
            "timestamp": Utc::now(),
        }))
        .into_response(),
        Err(e) => {
            warn!("Failed to read usage for {}: {}", parsed, e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "Service Unavailable",
                    "message": "Counter store unavailable",
                    "timestamp": Utc::now(),
                })),
            )
                .into_response()
        }
    }
}

async fn refresh_registry_handler(State(state): State<AppState>) -> impl IntoResponse {
    let results = state.checker.refresh().await;
    let healthy = results.iter().filter(|r| r.healthy).count();
    Json(json!({
        "message": "Service registry refreshed",
        "checked": results.len(),
        "healthy": healthy,
        "timestamp": Utc::now(),
    }))
}

async fn health_check_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.checker.health_check_all().await)
}

/// Proxy handler - runs every unmatched request through the pipeline
async fn proxy_handler(State(state): State<AppState>, req: Request) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    state.proxy.handle(req, peer).await
}
