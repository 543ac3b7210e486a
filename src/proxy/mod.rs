//! Proxy module for routing and forwarding requests to backend services
//!
//! Every inbound request runs the same fixed chain:
//! 1. Route match (404 / 405)
//! 2. Authorization hook, when the route requires it (401 / 403)
//! 3. Rate limiter (429)
//! 4. Circuit breaker (fallback, no backend call)
//! 5. Response cache lookup
//! 6. Load balancer target selection (503)
//! 7. Forward under the route deadline, with a retry budget for idempotent methods
//! 8. Outcome recorded into the breaker and the monitor (502 / 504 on failure)

mod cache;

pub use cache::ResponseCache;

use crate::auth::{AuthDecision, AuthHook};
use crate::balancer::{LoadBalancer, SelectedTarget};
use crate::circuit::CircuitBreakerManager;
use crate::config::{GatewayConfig, RouteConfig};
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::ratelimit::{RateLimiter, RequestIdentity};
use crate::registry::ServiceTarget;
use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue, HOST};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Request, Response, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use http_body_util::{BodyExt, Full, LengthLimitError};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Largest request body buffered for forwarding
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const REQUEST_ID: &str = "x-request-id";

/// A compiled route
#[derive(Debug, Clone)]
pub struct ProxyRoute {
    /// Route name (optional)
    pub name: Option<String>,
    /// Path pattern
    pub path_pattern: String,
    /// Logical service the route forwards to
    pub service: String,
    /// HTTP methods to match (empty = all)
    pub methods: Vec<String>,
    pub auth_required: bool,
    /// Requests per minute on this route
    pub rate_limit: Option<u32>,
    /// Deadline for the whole forward, retries included
    pub timeout: Duration,
    /// Whether to strip the prefix
    pub strip_prefix: bool,
    /// TTL for cached GET responses
    pub cache_ttl: Option<Duration>,
    /// Headers added to the upstream request
    pub request_headers: HeaderMap,
    /// Headers added to the relayed response
    pub response_headers: HeaderMap,
    /// Route description
    pub description: Option<String>,
}

/// Route as listed by the management surface
#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub name: Option<String>,
    pub path: String,
    pub service: String,
    pub methods: Vec<String>,
    pub auth_required: bool,
    pub rate_limit: Option<u32>,
    pub timeout_ms: u64,
    pub strip_prefix: bool,
    pub cache_ttl_secs: Option<u64>,
    pub description: Option<String>,
}

fn header_map(route: &str, headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (name.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!("Ignoring invalid transform header '{}' on route '{}'", name, route),
        }
    }
    map
}

impl ProxyRoute {
    pub fn from_config(route: &RouteConfig) -> Self {
        let transform = route.transform.clone().unwrap_or_default();
        Self {
            name: route.name.clone(),
            path_pattern: route.path.clone(),
            service: route.service.clone(),
            methods: route.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
            auth_required: route.auth_required,
            rate_limit: route.rate_limit,
            timeout: Duration::from_millis(route.timeout_ms),
            strip_prefix: route.strip_prefix,
            cache_ttl: route
                .cache
                .as_ref()
                .filter(|c| c.enabled)
                .map(|c| Duration::from_secs(c.ttl_secs)),
            request_headers: header_map(&route.path, &transform.request_headers),
            response_headers: header_map(&route.path, &transform.response_headers),
            description: route.description.clone(),
        }
    }

    /// Check if this route matches the given path and method
    pub fn matches(&self, path: &str, method: &str) -> bool {
        self.allows_method(method) && self.path_matches(path)
    }

    fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Check if path matches the pattern
    pub fn path_matches(&self, path: &str) -> bool {
        let pattern = &self.path_pattern;

        // Handle wildcard patterns
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return path == prefix || path.starts_with(&format!("{}/", prefix));
        }

        // Handle exact match with optional trailing slash
        if let Some(base) = pattern.strip_suffix('/') {
            return path == base || path.starts_with(pattern.as_str());
        }

        // Exact match
        path == pattern || path.starts_with(&format!("{}/", pattern))
    }

    /// Build the upstream URL for a request path on a target base URL
    pub fn get_target_url(&self, base: &str, path: &str, query: Option<&str>) -> String {
        let target_path = if self.strip_prefix {
            self.strip_path_prefix(path)
        } else {
            path.to_string()
        };

        let base = base.trim_end_matches('/');
        let path_part = if target_path.starts_with('/') {
            target_path
        } else {
            format!("/{}", target_path)
        };

        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", base, path_part, q),
            _ => format!("{}{}", base, path_part),
        }
    }

    /// Strip the matched prefix from the path
    fn strip_path_prefix(&self, path: &str) -> String {
        let prefix = self
            .path_pattern
            .strip_suffix("/*")
            .or_else(|| self.path_pattern.strip_suffix('/'));

        match prefix.and_then(|p| path.strip_prefix(p)) {
            Some(remainder) if remainder.is_empty() || remainder == "/" => "/".to_string(),
            Some(remainder) => remainder.to_string(),
            None => path.to_string(),
        }
    }

    pub fn info(&self) -> RouteInfo {
        RouteInfo {
            name: self.name.clone(),
            path: self.path_pattern.clone(),
            service: self.service.clone(),
            methods: self.methods.clone(),
            auth_required: self.auth_required,
            rate_limit: self.rate_limit,
            timeout_ms: self.timeout.as_millis() as u64,
            strip_prefix: self.strip_prefix,
            cache_ttl_secs: self.cache_ttl.map(|ttl| ttl.as_secs()),
            description: self.description.clone(),
        }
    }
}

/// Static route table, built once at startup
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<ProxyRoute>,
}

impl RouteTable {
    pub fn new(routes: Vec<ProxyRoute>) -> Self {
        Self { routes }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config
                .enabled_routes()
                .into_iter()
                .map(ProxyRoute::from_config)
                .collect(),
        )
    }

    /// First route matching path and method. A path that matches only with
    /// other methods is a 405 carrying the allowed methods.
    pub fn resolve(&self, path: &str, method: &str) -> Result<&ProxyRoute, GatewayError> {
        let mut allowed: Vec<String> = Vec::new();
        for route in self.routes.iter().filter(|r| r.path_matches(path)) {
            if route.allows_method(method) {
                return Ok(route);
            }
            for m in &route.methods {
                if !allowed.contains(m) {
                    allowed.push(m.clone());
                }
            }
        }

        if allowed.is_empty() {
            Err(GatewayError::RouteNotFound {
                path: path.to_string(),
            })
        } else {
            Err(GatewayError::MethodNotAllowed {
                method: method.to_string(),
                path: path.to_string(),
                allowed,
            })
        }
    }

    pub fn routes(&self) -> &[ProxyRoute] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Per-request values carried through the pipeline
#[derive(Debug, Clone)]
struct RequestContext {
    request_id: String,
    peer: Option<SocketAddr>,
    received_at: DateTime<Utc>,
}

/// A buffered upstream response
#[derive(Debug)]
struct Forwarded {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Debug)]
enum FailureKind {
    Transport,
    Timeout(Duration),
    Status(StatusCode),
}

/// Why a forward attempt failed
#[derive(Debug)]
struct ForwardFailure {
    kind: FailureKind,
    message: String,
}

impl ForwardFailure {
    fn transport(message: String) -> Self {
        Self {
            kind: FailureKind::Transport,
            message,
        }
    }

    fn timeout(after: Duration, target: &str) -> Self {
        Self {
            kind: FailureKind::Timeout(after),
            message: format!("target '{}' did not answer within {:?}", target, after),
        }
    }

    fn status(status: StatusCode, target: &str) -> Self {
        Self {
            kind: FailureKind::Status(status),
            message: format!("target '{}' returned {}", target, status.as_u16()),
        }
    }

    /// Metrics label
    fn label(&self) -> &'static str {
        match self.kind {
            FailureKind::Transport => "transport",
            FailureKind::Timeout(_) => "timeout",
            FailureKind::Status(_) => "upstream",
        }
    }

    fn into_error(self, service: &str) -> GatewayError {
        match self.kind {
            FailureKind::Timeout(after) => GatewayError::UpstreamTimeout {
                service: service.to_string(),
                timeout_ms: after.as_millis() as u64,
            },
            FailureKind::Status(status) => GatewayError::Upstream {
                service: service.to_string(),
                message: self.message,
                upstream_status: Some(status.as_u16()),
            },
            FailureKind::Transport => GatewayError::Upstream {
                service: service.to_string(),
                message: self.message,
                upstream_status: None,
            },
        }
    }
}

/// Render a pipeline short-circuit as its client response
fn short_circuit(ctx: &RequestContext, error: GatewayError) -> Response<Body> {
    debug!(
        request_id = %ctx.request_id,
        kind = error.kind(),
        "Request short-circuited: {}",
        error
    );
    axum::response::IntoResponse::into_response(error)
}

/// Holds the active request gauge up for one service while alive
struct ActiveRequest<'a> {
    metrics: &'a GatewayMetrics,
    service: &'a str,
}

impl<'a> ActiveRequest<'a> {
    fn new(metrics: &'a GatewayMetrics, service: &'a str) -> Self {
        metrics.inc_active_requests(service);
        Self { metrics, service }
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.metrics.dec_active_requests(self.service);
    }
}

/// The request pipeline
#[derive(Clone)]
pub struct ProxyService {
    client: Client<HttpConnector, Full<Bytes>>,
    routes: Arc<RouteTable>,
    auth: Arc<dyn AuthHook>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerManager>,
    balancer: Arc<LoadBalancer>,
    metrics: Arc<GatewayMetrics>,
    cache: Arc<ResponseCache>,
}

impl ProxyService {
    pub fn new(
        routes: RouteTable,
        auth: Arc<dyn AuthHook>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakerManager>,
        balancer: Arc<LoadBalancer>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            client,
            routes: Arc::new(routes),
            auth,
            limiter,
            breakers,
            balancer,
            metrics,
            cache: Arc::new(ResponseCache::default()),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Run a request through the pipeline. Never fails: every short-circuit
    /// becomes a synthesized response.
    pub async fn handle(&self, req: Request<Body>, peer: Option<SocketAddr>) -> Response<Body> {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let request_id = req
            .headers()
            .get(REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let ctx = RequestContext {
            request_id,
            peer,
            received_at: Utc::now(),
        };

        let mut response = match self.process(req, &ctx).await {
            Ok(response) => response,
            Err(error) => short_circuit(&ctx, error),
        };

        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            response.headers_mut().insert(REQUEST_ID, value);
        }
        self.metrics.record_request(
            method.as_str(),
            &path,
            response.status().as_u16(),
            start.elapsed(),
        );
        response
    }

    async fn process(&self, req: Request<Body>, ctx: &RequestContext) -> Result<Response<Body>, GatewayError> {
        let (parts, body) = req.into_parts();

        let route = self.routes.resolve(parts.uri.path(), parts.method.as_str())?;

        let user = if route.auth_required {
            self.authorize(&parts).await?
        } else {
            None
        };

        let identity = RequestIdentity::from_parts(
            &parts,
            ctx.peer,
            user,
            &self.limiter.config().priority_header,
        );
        let decision = self.limiter.check(&identity, route.rate_limit).await;
        if !decision.allowed {
            return Err(decision.to_error());
        }

        // past the limiter every response carries the rate limit headers,
        // synthesized ones included
        let service = route.service.as_str();
        let outcome = if self.breakers.is_open(service) {
            Err(GatewayError::CircuitOpen {
                service: service.to_string(),
                fallback: Box::new(self.breakers.fallback_response(service)),
            })
        } else {
            self.dispatch(route, parts, body, ctx).await
        };
        let mut response = match outcome {
            Ok(response) => response,
            Err(error) => short_circuit(ctx, error),
        };
        decision.apply_headers(response.headers_mut());
        Ok(response)
    }

    async fn authorize(&self, parts: &Parts) -> Result<Option<String>, GatewayError> {
        match self.auth.authorize(parts).await {
            AuthDecision::Allow { identity } => Ok(identity),
            AuthDecision::Deny { status, reason } if status == StatusCode::FORBIDDEN => {
                Err(GatewayError::Forbidden { reason })
            }
            AuthDecision::Deny { reason, .. } => Err(GatewayError::Unauthorized { reason }),
        }
    }

    /// Steps 5 to 8, entered only once the breaker has admitted the request.
    /// Every exit either records an outcome or releases the half-open probe.
    async fn dispatch(
        &self,
        route: &ProxyRoute,
        parts: Parts,
        body: Body,
        ctx: &RequestContext,
    ) -> Result<Response<Body>, GatewayError> {
        let service = route.service.as_str();

        let cache_key = route
            .cache_ttl
            .and_then(|_| ResponseCache::key(&parts.method, parts.uri.path(), parts.uri.query()));
        if let Some(cached) = cache_key.as_deref().and_then(|key| self.cache.get(key)) {
            self.breakers.release_probe(service);
            return Ok(cached);
        }

        let selected = match self.balancer.select(service) {
            Ok(selected) => selected,
            Err(e) => {
                self.breakers.release_probe(service);
                warn!("Target selection failed: {}", e);
                return Err(GatewayError::NoHealthyTargets {
                    service: service.to_string(),
                });
            }
        };

        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                self.breakers.release_probe(service);
                let cause = e.into_inner();
                if cause.downcast_ref::<LengthLimitError>().is_some() {
                    return Err(GatewayError::PayloadTooLarge {
                        limit: MAX_BODY_BYTES,
                    });
                }
                return Err(GatewayError::Internal(format!(
                    "failed to read request body: {}",
                    cause
                )));
            }
        };

        let _active = ActiveRequest::new(&self.metrics, service);
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            route.timeout,
            self.forward_with_retries(route, &parts, body, selected, ctx),
        )
        .await;
        let elapsed = started.elapsed();

        let failure = match outcome {
            Ok(Ok(forwarded)) => {
                self.breakers.record_success(service, elapsed);
                self.metrics.record_upstream(service, elapsed, false);
                return Ok(self.relay(route, forwarded, cache_key));
            }
            Ok(Err(failure)) => failure,
            Err(_) => ForwardFailure::timeout(route.timeout, service),
        };

        warn!(
            request_id = %ctx.request_id,
            service = %service,
            "Forward failed: {}",
            failure.message
        );
        self.breakers.record_failure(service);
        self.metrics.record_upstream(service, elapsed, true);
        self.metrics.record_error(service, failure.label());
        Err(failure.into_error(service))
    }

    async fn forward_with_retries(
        &self,
        route: &ProxyRoute,
        parts: &Parts,
        body: Bytes,
        first: SelectedTarget,
        ctx: &RequestContext,
    ) -> Result<Forwarded, ForwardFailure> {
        let budget = if is_idempotent(&parts.method) {
            first.target.retries
        } else {
            0
        };

        let mut selected = first;
        let mut attempt = 0;
        loop {
            let failure = match self
                .forward_once(route, parts, body.clone(), &selected.target, ctx)
                .await
            {
                Ok(forwarded) if !forwarded.status.is_server_error() => return Ok(forwarded),
                Ok(forwarded) => ForwardFailure::status(forwarded.status, &selected.target.name),
                Err(failure) => failure,
            };

            if attempt >= budget {
                return Err(failure);
            }
            attempt += 1;
            debug!(
                request_id = %ctx.request_id,
                attempt,
                "Retrying after: {}",
                failure.message
            );
            selected = match self.balancer.select(&route.service) {
                Ok(next) => next,
                Err(_) => return Err(failure),
            };
        }
    }

    async fn forward_once(
        &self,
        route: &ProxyRoute,
        parts: &Parts,
        body: Bytes,
        target: &ServiceTarget,
        ctx: &RequestContext,
    ) -> Result<Forwarded, ForwardFailure> {
        let target_url = route.get_target_url(&target.url, parts.uri.path(), parts.uri.query());

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(&target_url);
        if let Some(headers) = builder.headers_mut() {
            for (key, value) in parts.headers.iter() {
                // Skip hop-by-hop headers (including Host, which we'll set from target URL)
                if !is_hop_by_hop_header(key.as_str()) {
                    headers.append(key.clone(), value.clone());
                }
            }

            match extract_host_from_url(&target_url).and_then(|h| HeaderValue::from_str(&h).ok()) {
                Some(host) => {
                    headers.insert(HOST, host);
                }
                None => warn!(
                    "Failed to extract host from target URL '{}', Host header may be incorrect",
                    target_url
                ),
            }

            for (name, value) in forwarding_headers(parts, ctx) {
                headers.insert(name, value);
            }
            for (name, value) in &route.request_headers {
                headers.insert(name.clone(), value.clone());
            }
        }

        let request = builder
            .body(Full::new(body))
            .map_err(|e| ForwardFailure::transport(format!("failed to build request: {}", e)))?;

        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| {
                ForwardFailure::transport(format!("failed to reach '{}': {}", target.name, e))
            })?;
            let (head, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e: hyper::Error| {
                    ForwardFailure::transport(format!("failed to read response body: {}", e))
                })?
                .to_bytes();
            Ok::<_, ForwardFailure>(Forwarded {
                status: head.status,
                headers: head.headers,
                body,
            })
        };

        match tokio::time::timeout(target.timeout(), exchange).await {
            Ok(result) => result,
            Err(_) => Err(ForwardFailure::timeout(target.timeout(), &target.name)),
        }
    }

    /// Build the client response, applying the response transform and
    /// storing cacheable bodies
    fn relay(&self, route: &ProxyRoute, forwarded: Forwarded, cache_key: Option<String>) -> Response<Body> {
        let mut headers = forwarded.headers;
        let hop_by_hop: Vec<HeaderName> = headers
            .keys()
            .filter(|name| is_hop_by_hop_header(name.as_str()))
            .cloned()
            .collect();
        for name in hop_by_hop {
            headers.remove(name);
        }
        for (name, value) in &route.response_headers {
            headers.insert(name.clone(), value.clone());
        }
        if let Ok(service) = HeaderValue::from_str(&route.service) {
            headers.insert("x-service", service);
        }

        if let (Some(key), Some(ttl)) = (cache_key, route.cache_ttl) {
            self.cache
                .put(key, forwarded.status, &headers, forwarded.body.clone(), ttl);
        }

        let mut response = Response::new(Body::from(forwarded.body));
        *response.status_mut() = forwarded.status;
        *response.headers_mut() = headers;
        response
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
    )
}

/// Tracing and forwarding headers added to every upstream request
fn forwarding_headers(parts: &Parts, ctx: &RequestContext) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = Vec::new();
    let mut push = |name: &'static str, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.push((HeaderName::from_static(name), value));
        }
    };

    push(REQUEST_ID, &ctx.request_id);

    let existing = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let forwarded_for = match (existing, ctx.peer) {
        (Some(chain), Some(peer)) => Some(format!("{}, {}", chain, peer.ip())),
        (Some(chain), None) => Some(chain.to_string()),
        (None, Some(peer)) => Some(peer.ip().to_string()),
        (None, None) => None,
    };
    if let Some(ref value) = forwarded_for {
        push("x-forwarded-for", value);
    }

    push("x-forwarded-proto", "http");
    if let Some(host) = parts.headers.get(HOST).and_then(|v| v.to_str().ok()) {
        push("x-forwarded-host", host);
    }
    push(
        "x-gateway-start-time",
        &ctx.received_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
    );

    headers
}

/// Check if a header is a hop-by-hop header that should not be forwarded.
///
/// Host is included because it is replaced with the target's authority.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

/// Extract host and optional port from a URL string
fn extract_host_from_url(url: &str) -> Option<String> {
    url.parse::<axum::http::Uri>()
        .ok()?
        .authority()
        .map(|authority| authority.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, TransformConfig};

    fn route_config(path: &str) -> RouteConfig {
        RouteConfig {
            name: None,
            path: path.to_string(),
            service: "pricing-service".to_string(),
            methods: vec![],
            auth_required: false,
            rate_limit: None,
            timeout_ms: 5_000,
            strip_prefix: true,
            cache: None,
            transform: None,
            description: Some("Test route".to_string()),
            enabled: true,
        }
    }

    fn create_test_route() -> ProxyRoute {
        ProxyRoute::from_config(&route_config("/api/*"))
    }

    #[test]
    fn test_route_matching() {
        let route = create_test_route();

        assert!(route.matches("/api/users", "GET"));
        assert!(route.matches("/api/users/1", "POST"));
        assert!(route.matches("/api", "GET"));
        assert!(!route.matches("/apix", "GET"));
        assert!(!route.matches("/other/path", "GET"));
    }

    #[test]
    fn test_method_filtering() {
        let route = ProxyRoute {
            methods: vec!["GET".to_string(), "POST".to_string()],
            ..create_test_route()
        };

        assert!(route.matches("/api/users", "get"));
        assert!(route.matches("/api/users", "POST"));
        assert!(!route.matches("/api/users", "DELETE"));
    }

    #[test]
    fn test_target_url_with_strip_prefix() {
        let route = create_test_route();

        assert_eq!(
            route.get_target_url("http://localhost:8081", "/api/users", None),
            "http://localhost:8081/users"
        );
        assert_eq!(
            route.get_target_url("http://localhost:8081/", "/api/users/1", None),
            "http://localhost:8081/users/1"
        );
        assert_eq!(
            route.get_target_url("http://localhost:8081", "/api/users", Some("page=1")),
            "http://localhost:8081/users?page=1"
        );
        assert_eq!(
            route.get_target_url("http://localhost:8081", "/api", None),
            "http://localhost:8081/"
        );
    }

    #[test]
    fn test_target_url_without_strip_prefix() {
        let route = ProxyRoute {
            strip_prefix: false,
            ..create_test_route()
        };

        assert_eq!(
            route.get_target_url("http://localhost:8081", "/api/users", None),
            "http://localhost:8081/api/users"
        );
    }

    #[test]
    fn test_from_config_cache_and_transform() {
        let mut config = route_config("/pricing/*");
        config.methods = vec!["get".to_string()];
        config.cache = Some(CacheConfig {
            enabled: true,
            ttl_secs: 900,
        });
        let mut transform = TransformConfig::default();
        transform
            .request_headers
            .insert("X-Gateway".to_string(), "resilience".to_string());
        transform
            .response_headers
            .insert("bad header".to_string(), "x".to_string());
        config.transform = Some(transform);

        let route = ProxyRoute::from_config(&config);
        assert_eq!(route.methods, vec!["GET"]);
        assert_eq!(route.cache_ttl, Some(Duration::from_secs(900)));
        assert_eq!(route.request_headers["x-gateway"], "resilience");
        assert!(route.response_headers.is_empty());
        assert_eq!(route.info().cache_ttl_secs, Some(900));

        config.cache = Some(CacheConfig {
            enabled: false,
            ttl_secs: 900,
        });
        assert_eq!(ProxyRoute::from_config(&config).cache_ttl, None);
    }

    #[test]
    fn test_resolve_not_found_and_method_not_allowed() {
        let mut pricing = route_config("/pricing/*");
        pricing.methods = vec!["GET".to_string(), "POST".to_string()];
        let table = RouteTable::new(vec![ProxyRoute::from_config(&pricing)]);

        assert_eq!(
            table.resolve("/pricing/quote", "GET").unwrap().service,
            "pricing-service"
        );

        match table.resolve("/unknown", "GET") {
            Err(GatewayError::RouteNotFound { path }) => assert_eq!(path, "/unknown"),
            other => panic!("expected 404, got {:?}", other.map(|r| r.path_pattern.clone())),
        }

        match table.resolve("/pricing/quote", "DELETE") {
            Err(GatewayError::MethodNotAllowed { allowed, .. }) => {
                assert_eq!(allowed, vec!["GET", "POST"])
            }
            other => panic!("expected 405, got {:?}", other.map(|r| r.path_pattern.clone())),
        }
    }

    #[test]
    fn test_resolve_falls_through_to_later_route() {
        let mut reads = route_config("/offers/*");
        reads.methods = vec!["GET".to_string()];
        let mut writes = route_config("/offers/*");
        writes.methods = vec!["POST".to_string()];
        writes.service = "offer-writer".to_string();
        let table = RouteTable::new(vec![
            ProxyRoute::from_config(&reads),
            ProxyRoute::from_config(&writes),
        ]);

        assert_eq!(table.resolve("/offers/1", "POST").unwrap().service, "offer-writer");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_disabled_routes_skipped() {
        let config = GatewayConfig::parse(
            r#"
[[services]]
name = "pricing-service"
targets = [{ url = "http://pricing-a:8080" }]

[[routes]]
path = "/pricing/*"
service = "pricing-service"
enabled = false
"#,
        )
        .unwrap();

        assert!(RouteTable::from_config(&config).is_empty());
    }

    #[test]
    fn test_forwarding_headers() {
        let (parts, _) = Request::builder()
            .uri("/pricing/quote")
            .header("host", "gateway.local")
            .header("x-forwarded-for", "203.0.113.7")
            .body(())
            .unwrap()
            .into_parts();
        let ctx = RequestContext {
            request_id: "req-1".to_string(),
            peer: Some("10.0.0.2:5555".parse().unwrap()),
            received_at: Utc::now(),
        };

        let headers: HashMap<_, _> = forwarding_headers(&parts, &ctx)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap().to_string()))
            .collect();
        assert_eq!(headers["x-request-id"], "req-1");
        assert_eq!(headers["x-forwarded-for"], "203.0.113.7, 10.0.0.2");
        assert_eq!(headers["x-forwarded-proto"], "http");
        assert_eq!(headers["x-forwarded-host"], "gateway.local");
        assert!(headers.contains_key("x-gateway-start-time"));
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::PUT));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PATCH));
    }

    #[test]
    fn test_extract_host_from_url() {
        assert_eq!(
            extract_host_from_url("http://example.com/path"),
            Some("example.com".to_string())
        );
        assert_eq!(
            extract_host_from_url("http://localhost:8080/path"),
            Some("localhost:8080".to_string())
        );
        assert_eq!(extract_host_from_url("/just/a/path"), None);
    }

    #[test]
    fn test_host_header_is_hop_by_hop() {
        assert!(is_hop_by_hop_header("host"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(!is_hop_by_hop_header("x-request-id"));
    }

    #[test]
    fn test_failure_classification() {
        let timeout = ForwardFailure::timeout(Duration::from_millis(250), "pricing-a");
        assert_eq!(timeout.label(), "timeout");
        assert!(matches!(
            timeout.into_error("pricing-service"),
            GatewayError::UpstreamTimeout { timeout_ms: 250, .. }
        ));

        let status = ForwardFailure::status(StatusCode::SERVICE_UNAVAILABLE, "pricing-a");
        assert_eq!(status.label(), "upstream");
        assert_eq!(
            status.into_error("pricing-service").status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
