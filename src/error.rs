//! Client-facing error taxonomy
//!
//! Every short-circuit in the request pipeline ends in a [`GatewayError`].
//! Each variant knows its status code, the subsystem that produced it and a
//! stable JSON body with `error`, `message` and `timestamp` plus context.

use crate::circuit::FallbackResponse;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};
use thiserror::Error;

/// Header naming the pipeline stage that produced an error response
pub const SUBSYSTEM_HEADER: &str = "x-gateway-subsystem";

/// Errors surfaced to gateway clients
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route matches {path}")]
    RouteNotFound { path: String },

    #[error("method {method} is not allowed on {path}")]
    MethodNotAllowed {
        method: String,
        path: String,
        allowed: Vec<String>,
    },

    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("rate limit exceeded on {dimension}")]
    RateLimited {
        dimension: String,
        limit: u32,
        retry_after: u64,
        reset_time: i64,
    },

    #[error("circuit breaker open for {service}")]
    CircuitOpen {
        service: String,
        fallback: Box<FallbackResponse>,
    },

    #[error("no healthy targets for {service}")]
    NoHealthyTargets { service: String },

    #[error("upstream {service} timed out after {timeout_ms}ms")]
    UpstreamTimeout { service: String, timeout_ms: u64 },

    #[error("upstream {service} failed: {message}")]
    Upstream {
        service: String,
        message: String,
        upstream_status: Option<u16>,
    },

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { fallback, .. } => fallback.status,
            Self::NoHealthyTargets { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Pipeline stage that produced the error
    pub fn subsystem(&self) -> &'static str {
        match self {
            Self::RouteNotFound { .. } | Self::MethodNotAllowed { .. } => "router",
            Self::Unauthorized { .. } | Self::Forbidden { .. } => "auth",
            Self::RateLimited { .. } => "rate-limiter",
            Self::CircuitOpen { .. } => "circuit-breaker",
            Self::NoHealthyTargets { .. } => "load-balancer",
            Self::UpstreamTimeout { .. } | Self::Upstream { .. } => "proxy",
            Self::PayloadTooLarge { .. } => "router",
            Self::Internal(_) => "gateway",
        }
    }

    /// Short machine-readable label, also used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RouteNotFound { .. } => "route_not_found",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NoHealthyTargets { .. } => "no_healthy_targets",
            Self::UpstreamTimeout { .. } => "timeout",
            Self::Upstream { .. } => "upstream",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Internal(_) => "internal",
        }
    }

    /// Stable JSON body for the error
    pub fn body(&self) -> Value {
        let timestamp = chrono::Utc::now().to_rfc3339();
        match self {
            Self::RouteNotFound { path } => json!({
                "error": "Not Found",
                "message": "No matching route found",
                "path": path,
                "timestamp": timestamp,
            }),
            Self::MethodNotAllowed {
                method,
                path,
                allowed,
            } => json!({
                "error": "Method Not Allowed",
                "message": format!("Method {} is not allowed on this route", method),
                "path": path,
                "allowed": allowed,
                "timestamp": timestamp,
            }),
            Self::Unauthorized { reason } => json!({
                "error": "Unauthorized",
                "message": reason,
                "timestamp": timestamp,
            }),
            Self::Forbidden { reason } => json!({
                "error": "Forbidden",
                "message": reason,
                "timestamp": timestamp,
            }),
            Self::RateLimited {
                dimension,
                retry_after,
                reset_time,
                ..
            } => json!({
                "error": "Rate limit exceeded",
                "message": "Too many requests",
                "rate_limit": dimension,
                "retry_after": retry_after,
                "reset_time": reset_time,
                "timestamp": timestamp,
            }),
            Self::CircuitOpen { fallback, .. } => fallback.render_body(),
            Self::NoHealthyTargets { service } => json!({
                "error": "Service Unavailable",
                "message": "No healthy targets available",
                "service": service,
                "fallback": true,
                "timestamp": timestamp,
            }),
            Self::UpstreamTimeout {
                service,
                timeout_ms,
            } => json!({
                "error": "Gateway Timeout",
                "message": format!("Upstream did not respond within {}ms", timeout_ms),
                "service": service,
                "timestamp": timestamp,
            }),
            Self::Upstream {
                service,
                upstream_status,
                ..
            } => {
                let mut body = json!({
                    "error": "Bad Gateway",
                    "message": "Upstream service failed",
                    "service": service,
                    "timestamp": timestamp,
                });
                if let Some(status) = upstream_status {
                    body["upstream_status"] = json!(status);
                }
                body
            }
            Self::PayloadTooLarge { limit } => json!({
                "error": "Payload Too Large",
                "message": format!("Request body exceeds {} bytes", limit),
                "timestamp": timestamp,
            }),
            Self::Internal(_) => json!({
                "error": "Internal Server Error",
                "message": "An unexpected error occurred",
                "timestamp": timestamp,
            }),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let Self::CircuitOpen { service, fallback } = &self {
            let mut response = fallback.render(service);
            response.headers_mut().insert(
                HeaderName::from_static(SUBSYSTEM_HEADER),
                HeaderValue::from_static("circuit-breaker"),
            );
            return response;
        }

        let status = self.status();
        let mut response = (status, axum::Json(self.body())).into_response();
        let headers = response.headers_mut();
        headers.insert(
            HeaderName::from_static(SUBSYSTEM_HEADER),
            HeaderValue::from_static(self.subsystem()),
        );

        match &self {
            Self::MethodNotAllowed { allowed, .. } => {
                if let Ok(value) = HeaderValue::from_str(&allowed.join(", ")) {
                    headers.insert(header::ALLOW, value);
                }
            }
            Self::RateLimited {
                limit,
                retry_after,
                reset_time,
                ..
            } => {
                headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
                headers.insert("x-ratelimit-reset", HeaderValue::from(*reset_time));
                headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after));
            }
            Self::NoHealthyTargets { service } => {
                if let Ok(value) = HeaderValue::from_str(service) {
                    headers.insert("x-service", value);
                }
            }
            _ => {}
        }

        response
    }
}
