//! Authorization hook
//!
//! Credential validation lives outside the gateway. The pipeline only asks an
//! [`AuthHook`] whether a request may pass and, optionally, who made it; the
//! identity then keys the per-user rate limit.

use crate::config::AuthConfig;
use async_trait::async_trait;
use axum::http::request::Parts;
use axum::http::StatusCode;
use std::collections::HashMap;
use tracing::debug;

/// Outcome of an authorization check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow { identity: Option<String> },
    Deny { status: StatusCode, reason: String },
}

impl AuthDecision {
    pub fn deny(status: StatusCode, reason: impl Into<String>) -> Self {
        Self::Deny {
            status,
            reason: reason.into(),
        }
    }
}

/// Pluggable authorization consulted for routes that require it
#[async_trait]
pub trait AuthHook: Send + Sync {
    async fn authorize(&self, parts: &Parts) -> AuthDecision;

    /// Whether the hook can currently answer requests
    fn is_ready(&self) -> bool {
        true
    }
}

/// Accepts every request without an identity
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl AuthHook for AllowAll {
    async fn authorize(&self, _parts: &Parts) -> AuthDecision {
        AuthDecision::Allow { identity: None }
    }
}

/// Static token table read from configuration.
///
/// A missing credential is a 401, an unknown one a 403. A `Bearer ` prefix is
/// accepted and stripped.
#[derive(Debug, Clone)]
pub struct StaticTokenAuth {
    header_name: String,
    tokens: HashMap<String, String>,
}

impl StaticTokenAuth {
    pub fn new(header_name: impl Into<String>, tokens: HashMap<String, String>) -> Self {
        Self {
            header_name: header_name.into(),
            tokens,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.header_name.clone(), config.tokens.clone())
    }

    fn credential<'a>(&self, parts: &'a Parts) -> Option<&'a str> {
        let value = parts.headers.get(self.header_name.as_str())?.to_str().ok()?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .unwrap_or(value)
            .trim();
        (!token.is_empty()).then_some(token)
    }
}

#[async_trait]
impl AuthHook for StaticTokenAuth {
    async fn authorize(&self, parts: &Parts) -> AuthDecision {
        let Some(token) = self.credential(parts) else {
            return AuthDecision::deny(
                StatusCode::UNAUTHORIZED,
                format!("missing credentials in {} header", self.header_name),
            );
        };

        match self.tokens.get(token) {
            Some(identity) => {
                debug!(identity = %identity, "Request authorized");
                AuthDecision::Allow {
                    identity: Some(identity.clone()),
                }
            }
            None => AuthDecision::deny(StatusCode::FORBIDDEN, "invalid credentials"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(header: Option<(&str, &str)>) -> Parts {
        let mut builder = Request::builder().uri("/api/v1/pricing/quote");
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn hook() -> StaticTokenAuth {
        let mut tokens = HashMap::new();
        tokens.insert("secret-token".to_string(), "alice".to_string());
        StaticTokenAuth::from_config(&AuthConfig {
            header_name: "Authorization".to_string(),
            tokens,
        })
    }

    #[tokio::test]
    async fn test_valid_bearer_token() {
        let decision = hook()
            .authorize(&parts(Some(("authorization", "Bearer secret-token"))))
            .await;
        assert_eq!(
            decision,
            AuthDecision::Allow {
                identity: Some("alice".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_raw_token_accepted() {
        let decision = hook()
            .authorize(&parts(Some(("Authorization", "secret-token"))))
            .await;
        assert!(matches!(decision, AuthDecision::Allow { .. }));
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        match hook().authorize(&parts(None)).await {
            AuthDecision::Deny { status, .. } => assert_eq!(status, StatusCode::UNAUTHORIZED),
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_token_is_forbidden() {
        match hook()
            .authorize(&parts(Some(("authorization", "Bearer nope"))))
            .await
        {
            AuthDecision::Deny { status, .. } => assert_eq!(status, StatusCode::FORBIDDEN),
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_allow_all() {
        assert_eq!(
            AllowAll.authorize(&parts(None)).await,
            AuthDecision::Allow { identity: None }
        );
        assert!(AllowAll.is_ready());
    }
}
