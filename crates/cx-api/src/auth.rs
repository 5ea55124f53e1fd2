//! Bearer-token authentication for the write endpoints.
//!
//! When security is disabled every request passes through (development
//! mode). When enabled, requests must carry `Authorization: Bearer <token>`
//! matching one of the configured tokens (constant-time comparison), and —
//! when `require_local_only` is set — arrive from a loopback or private
//! peer. Each decision is appended to the JSONL audit log.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};

use cx_core::config::SecurityConfig;

use crate::audit::{mask_token, AuditLog, AuditRecord};

// ---------------------------------------------------------------------------
// AuthLayer
// ---------------------------------------------------------------------------

/// A [`tower::Layer`] applying bearer-token auth + audit to write routes.
#[derive(Clone)]
pub struct AuthLayer {
    security: Arc<SecurityConfig>,
    audit: Option<Arc<AuditLog>>,
}

impl AuthLayer {
    pub fn new(security: SecurityConfig) -> Self {
        let audit = if security.enabled && !security.audit_log.is_empty() {
            Some(Arc::new(AuditLog::new(&security.audit_log)))
        } else {
            None
        };
        Self {
            security: Arc::new(security),
            audit,
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            security: self.security.clone(),
            audit: self.audit.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthMiddleware
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    security: Arc<SecurityConfig>,
    audit: Option<Arc<AuditLog>>,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let security = self.security.clone();
        let audit = self.audit.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if !security.enabled {
                return inner.call(req).await;
            }

            let started = Instant::now();
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            let user_agent = req
                .headers()
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let peer = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            let token = bearer_token(&req);

            let authorized = peer_allowed(&security, peer)
                && token
                    .as_deref()
                    .map(|t| token_allowed(&security, t))
                    .unwrap_or(false);

            let response = if authorized {
                inner.call(req).await?
            } else {
                (
                    StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({"error": "unauthorized"})),
                )
                    .into_response()
            };

            if let Some(audit) = audit {
                audit.append(&AuditRecord {
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    remote_addr: peer.map(|a| a.to_string()).unwrap_or_default(),
                    method,
                    path,
                    user_agent,
                    authorized,
                    token: mask_token(token.as_deref().unwrap_or("")),
                    status_code: response.status().as_u16(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }

            Ok(response)
        })
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

fn bearer_token(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

fn token_allowed(security: &SecurityConfig, presented: &str) -> bool {
    security
        .allowed_tokens
        .iter()
        .any(|allowed| bool::from(presented.as_bytes().ct_eq(allowed.as_bytes())))
}

fn peer_allowed(security: &SecurityConfig, peer: Option<SocketAddr>) -> bool {
    if !security.require_local_only {
        return true;
    }
    match peer {
        Some(addr) => is_local_or_private(addr.ip()),
        // No peer info means the server was not set up with connect info;
        // fail closed when local-only is requested.
        None => false,
    }
}

fn is_local_or_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fc00::/7 unique-local, fe80::/10 link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;
    use tower::ServiceExt;

    fn secured(tokens: Vec<&str>, local_only: bool) -> Router {
        let security = SecurityConfig {
            enabled: true,
            allowed_tokens: tokens.into_iter().map(String::from).collect(),
            require_local_only: local_only,
            audit_log: String::new(),
        };
        Router::new()
            .route("/scheduler/pause", post(|| async { "ok" }))
            .layer(AuthLayer::new(security))
    }

    fn request(token: Option<&str>, peer: Option<SocketAddr>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/scheduler/pause");
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let mut req = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            req.extensions_mut().insert(ConnectInfo(peer));
        }
        req
    }

    #[tokio::test]
    async fn disabled_security_passes_everything() {
        let app = Router::new()
            .route("/scheduler/pause", post(|| async { "ok" }))
            .layer(AuthLayer::new(SecurityConfig::default()));
        let resp = app.oneshot(request(None, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn valid_bearer_token_passes() {
        let app = secured(vec!["s3cret"], false);
        let resp = app.oneshot(request(Some("s3cret"), None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn any_configured_token_works() {
        let app = secured(vec!["first", "second"], false);
        let resp = app.oneshot(request(Some("second"), None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let app = secured(vec!["s3cret"], false);
        let resp = app.oneshot(request(None, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_is_401() {
        let app = secured(vec!["s3cret"], false);
        let resp = app.oneshot(request(Some("nope"), None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn local_only_rejects_public_peer() {
        let app = secured(vec!["s3cret"], true);
        let public: SocketAddr = "203.0.113.9:4444".parse().unwrap();
        let resp = app
            .oneshot(request(Some("s3cret"), Some(public)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn local_only_accepts_loopback_and_private() {
        for addr in ["127.0.0.1:4444", "10.1.2.3:4444", "192.168.0.7:4444"] {
            let app = secured(vec!["s3cret"], true);
            let peer: SocketAddr = addr.parse().unwrap();
            let resp = app
                .oneshot(request(Some("s3cret"), Some(peer)))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "peer {addr}");
        }
    }

    #[test]
    fn private_v6_ranges() {
        assert!(is_local_or_private("::1".parse().unwrap()));
        assert!(is_local_or_private("fd12:3456::1".parse().unwrap()));
        assert!(is_local_or_private("fe80::1".parse().unwrap()));
        assert!(!is_local_or_private("2001:db8::1".parse().unwrap()));
    }
}
