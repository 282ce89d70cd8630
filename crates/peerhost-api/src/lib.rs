pub mod handlers;
pub mod rate_limit;

use std::net::SocketAddr;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, HeaderValue};
use axum::middleware;
use axum::routing::{any, get, post};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

use peerhost_core::config::GatewayConfig;

pub use handlers::ApiState;
pub use rate_limit::RateLimiter;

/// Request-size and request-rate bounds for the HTTP surface.
#[derive(Debug, Clone, Copy)]
pub struct HttpLimits {
    pub body_limit: usize,
    /// Invocations per client per minute; 0 disables limiting.
    pub requests_per_minute: u32,
}

impl From<&GatewayConfig> for HttpLimits {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            body_limit: config.body_limit_bytes,
            requests_per_minute: config.rate_limit_per_minute,
        }
    }
}

/// Headers added to every response that does not already carry them.
const SECURITY_HEADERS: [(HeaderName, &str); 4] = [
    (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    (header::X_FRAME_OPTIONS, "SAMEORIGIN"),
    (header::REFERRER_POLICY, "no-referrer"),
    (header::STRICT_TRANSPORT_SECURITY, "max-age=15552000; includeSubDomains"),
];

/// The gateway's HTTP surface.
///
/// `/_internal/*` is for workers and operators. Everything else of the form
/// `/{project}/{function}` is a function invocation, and only those count
/// against the rate limit.
pub fn router(state: ApiState, limits: HttpLimits) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut invoke = Router::new().route("/{project}/{function}", any(handlers::handle_invoke));
    if limits.requests_per_minute > 0 {
        invoke = invoke.route_layer(middleware::from_fn_with_state(
            RateLimiter::per_minute(limits.requests_per_minute),
            rate_limit::limit_requests,
        ));
    }

    let mut app = Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/_internal/worker-result", post(handlers::handle_worker_result))
        .route(
            "/_internal/requests/{request_id}",
            get(handlers::handle_request_payload),
        )
        .route("/_internal/jobs/{request_id}", get(handlers::handle_job))
        .merge(invoke)
        .layer(DefaultBodyLimit::max(limits.body_limit))
        .layer(cors);
    for (name, value) in SECURITY_HEADERS {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            name,
            HeaderValue::from_static(value),
        ));
    }
    app.with_state(state)
}

pub async fn serve(
    state: ApiState,
    config: &GatewayConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.bind, config.port)).await?;
    tracing::info!(
        bind = %config.bind,
        port = config.port,
        rate_limit_per_minute = config.rate_limit_per_minute,
        "gateway listening"
    );
    let app = router(state, HttpLimits::from(config));
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
