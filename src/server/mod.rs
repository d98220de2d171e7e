//! Serving endpoint run by every worker.
//!
//! Each worker binds the same port (`SO_REUSEPORT`), so the kernel spreads
//! incoming connections across the pool. The router holds the liveness route,
//! whatever routes the resources registered, and a fixed middleware stack:
//!
//! ```text
//! request-id ─► cors (if configured) ─► trace ─► throttle ─► gzip ─► routes
//! ```
//!
//! Nothing here parses `Authorization` headers or answers conditional requests
//! (`If-None-Match`, `If-Modified-Since`). Resources that need either read the
//! headers in their own handlers; there is no JSONP wrapping.

pub mod middleware;
pub mod throttle;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, http::StatusCode, middleware as axum_middleware, routing::get};
use tokio::net::{TcpListener, TcpSocket};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::SkylineConfig;
use middleware::request_id_middleware;
use throttle::{Throttle, throttle_middleware};

/// Liveness route path
pub const HEALTH_CHECK_PATH: &str = "/__hc__";

/// Wrap the resources' routes with the liveness route and middleware stack.
pub fn build_router(resources: Router, config: &SkylineConfig) -> Router {
    let throttle = Arc::new(Throttle::new(config.throttle.clone()));

    let mut app = Router::new()
        .route(HEALTH_CHECK_PATH, get(health_check))
        .merge(resources)
        .layer(CompressionLayer::new())
        .layer(axum_middleware::from_fn_with_state(throttle, throttle_middleware))
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = config.allow_origins.as_deref().and_then(cors_layer) {
        app = app.layer(cors);
    }

    app.layer(axum_middleware::from_fn(request_id_middleware))
}

/// Cross-origin policy for `allow_origins`; `"*"` allows any origin.
pub fn cors_layer(allow_origins: &[String]) -> Option<CorsLayer> {
    let base = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600));

    if allow_origins.iter().any(|origin| origin == "*") {
        return Some(base.allow_origin(Any));
    }

    let origins: Vec<_> = allow_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        None
    } else {
        Some(base.allow_origin(origins))
    }
}

/// Empty 200 for load balancers and the supervisor's operators.
async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// Bind `host:port` so that every worker can share the port.
pub async fn bind_shared(host: &str, port: u16) -> std::io::Result<TcpListener> {
    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address for {host}:{port}"),
            )
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, header};
    use tower::ServiceExt;

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check_is_empty_200() {
        let app = build_router(Router::new(), &SkylineConfig::default());
        let response = app.oneshot(get_request(HEALTH_CHECK_PATH)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_resource_routes_are_mounted() {
        let resources = Router::new().route("/hello", get(|| async { "hi" }));
        let app = build_router(resources, &SkylineConfig::default());

        let response = app.oneshot(get_request("/hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_throttle_applies() {
        let mut config = SkylineConfig::default();
        config.throttle.burst = 1;
        config.throttle.rate = 1;
        let app = build_router(Router::new(), &config);

        let first = app.clone().oneshot(get_request(HEALTH_CHECK_PATH)).await.unwrap();
        let second = app.oneshot(get_request(HEALTH_CHECK_PATH)).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_rotating_forwarded_header_does_not_escape_throttle() {
        let mut config = SkylineConfig::default();
        config.throttle.burst = 1;
        config.throttle.rate = 1;
        let app = build_router(Router::new(), &config);

        let mut admitted = 0;
        for n in 0..50u8 {
            let mut request = Request::builder()
                .uri(HEALTH_CHECK_PATH)
                .header("x-forwarded-for", format!("198.51.100.{n}"))
                .body(Body::empty())
                .unwrap();
            request
                .extensions_mut()
                .insert(axum::extract::ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 40000))));
            let response = app.clone().oneshot(request).await.unwrap();
            if response.status() == StatusCode::OK {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_conditional_and_auth_headers_reach_resources() {
        let resources = Router::new().route(
            "/etag",
            get(|headers: axum::http::HeaderMap| async move {
                let seen = |name: header::HeaderName| headers.contains_key(name);
                format!("{}:{}", seen(header::IF_NONE_MATCH), seen(header::AUTHORIZATION))
            }),
        );
        let app = build_router(resources, &SkylineConfig::default());

        let request = Request::builder()
            .uri("/etag")
            .header(header::IF_NONE_MATCH, "\"v1\"")
            .header(header::AUTHORIZATION, "Bearer token")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"true:true");
    }

    #[tokio::test]
    async fn test_cors_only_when_configured() {
        let preflight = || {
            Request::builder()
                .method("OPTIONS")
                .uri(HEALTH_CHECK_PATH)
                .header(header::ORIGIN, "https://example.com")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                .body(Body::empty())
                .unwrap()
        };

        let mut config = SkylineConfig::default();
        config.allow_origins = Some(vec!["https://example.com".to_string()]);
        let response = build_router(Router::new(), &config)
            .oneshot(preflight())
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://example.com"
        );

        let response = build_router(Router::new(), &SkylineConfig::default())
            .oneshot(preflight())
            .await
            .unwrap();
        assert!(!response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[test]
    fn test_cors_layer_ignores_unparseable_origins() {
        assert!(cors_layer(&[]).is_none());
        assert!(cors_layer(&["*".to_string()]).is_some());
    }

    #[tokio::test]
    async fn test_bind_shared_allows_two_listeners() {
        let first = bind_shared("127.0.0.1", 0).await.unwrap();
        let port = first.local_addr().unwrap().port();
        let second = bind_shared("127.0.0.1", port).await;
        assert!(second.is_ok());
    }
}
