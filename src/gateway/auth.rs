//! Bearer token middleware and client address extraction.
//!
//! Two credentials exist:
//! - per-agent tokens, issued on approval or code redemption and resolved
//!   against the registry by the handlers themselves
//! - a single operator token guarding the management routes

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use secrecy::{ExposeSecret, SecretString};

use crate::agents::token::{parse_authorization, tokens_match};
use crate::error::DispatchError;
use crate::gateway::error::ApiError;

/// Bearer token presented by an agent, placed in request extensions by
/// [`require_agent_token`].
#[derive(Debug, Clone)]
pub struct AgentToken(pub String);

/// Operator credential shared by the management routes.
#[derive(Clone)]
pub struct AdminAuth {
    token: Arc<SecretString>,
}

impl AdminAuth {
    pub fn new(token: SecretString) -> Self {
        Self {
            token: Arc::new(token),
        }
    }

    fn accepts(&self, presented: &str) -> bool {
        tokens_match(self.token.expose_secret(), presented)
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_authorization)
}

/// Reject agent requests that carry no token at all.
///
/// Wire up with `axum::middleware::from_fn(require_agent_token)`. Whether the
/// token belongs to an enabled agent is decided by the operation.
pub async fn require_agent_token(mut request: Request, next: Next) -> Result<Response, ApiError> {
    let token = bearer(request.headers())
        .ok_or(DispatchError::Unauthorized)?
        .to_string();
    request.extensions_mut().insert(AgentToken(token));
    Ok(next.run(request).await)
}

/// Validate the operator token (constant-time comparison).
///
/// Wire up with `axum::middleware::from_fn_with_state(admin, admin_auth_middleware)`.
pub async fn admin_auth_middleware(
    State(admin): State<AdminAuth>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorized = bearer(request.headers()).is_some_and(|token| admin.accepts(token));
    if !authorized {
        return Err(DispatchError::Unauthorized.into());
    }
    Ok(next.run(request).await)
}

/// Address of the calling agent.
///
/// First `X-Forwarded-For` entry, else `X-Real-IP`, else the socket peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return Ok(ClientIp(ip.to_string()));
        }

        let real_ip = parts
            .headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = real_ip {
            return Ok(ClientIp(ip.to_string()));
        }

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(ClientIp(peer))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request as HttpRequest;

    use super::*;

    async fn client_ip(request: HttpRequest<()>) -> String {
        let (mut parts, _) = request.into_parts();
        let ClientIp(ip) = ClientIp::from_request_parts(&mut parts, &()).await.unwrap();
        ip
    }

    #[tokio::test]
    async fn test_client_ip_precedence() {
        let req = HttpRequest::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .body(())
            .unwrap();
        assert_eq!(client_ip(req).await, "203.0.113.7");

        let req = HttpRequest::builder()
            .header("x-real-ip", "198.51.100.2")
            .body(())
            .unwrap();
        assert_eq!(client_ip(req).await, "198.51.100.2");

        let mut req = HttpRequest::builder().body(()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 4], 40000))));
        assert_eq!(client_ip(req).await, "192.0.2.4");
    }

    #[test]
    fn test_admin_token_check() {
        let admin = AdminAuth::new(SecretString::from("operator-secret".to_string()));
        assert!(admin.accepts("operator-secret"));
        assert!(!admin.accepts("operator-secre"));
        assert!(!admin.accepts(""));
    }
}
