//! Per-client request limiting for the invocation route.
//!
//! Fixed one-minute windows keyed by peer IP. Requests that arrive without
//! connection info (in-process routers) share a single bucket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use serde_json::json;
use tokio::time::Instant;

pub const RATE_LIMITED: &str = "RATE_LIMITED";

const WINDOW: Duration = Duration::from_secs(60);

/// Expired windows are swept once the table grows past this.
const SWEEP_THRESHOLD: usize = 4096;

struct Window {
    started: Instant,
    count: u32,
}

#[derive(Clone)]
pub struct RateLimiter {
    limit: u32,
    clients: Arc<DashMap<IpAddr, Window>>,
}

impl RateLimiter {
    /// `limit` requests per client per minute.
    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            clients: Arc::new(DashMap::new()),
        }
    }

    /// Counts one request from `client`. On rejection returns how long until
    /// the client's window resets.
    pub fn check(&self, client: IpAddr) -> Result<(), Duration> {
        let now = Instant::now();
        if self.clients.len() > SWEEP_THRESHOLD {
            self.clients.retain(|_, w| now.duration_since(w.started) < WINDOW);
        }

        let mut window = self.clients.entry(client).or_insert_with(|| Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= WINDOW {
            window.started = now;
            window.count = 0;
        }
        if window.count >= self.limit {
            return Err(WINDOW.saturating_sub(now.duration_since(window.started)));
        }
        window.count += 1;
        Ok(())
    }
}

pub async fn limit_requests(State(limiter): State<RateLimiter>, req: Request, next: Next) -> Response {
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    match limiter.check(client) {
        Ok(()) => next.run(req).await,
        Err(retry_after) => {
            let secs = retry_after.as_secs().max(1);
            tracing::debug!(%client, retry_after = secs, "request rate limited");
            let mut resp = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": format!("rate limit exceeded, retry in {secs}s"),
                    "code": RATE_LIMITED,
                })),
            )
                .into_response();
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[tokio::test(start_paused = true)]
    async fn window_allows_limit_then_resets() {
        let limiter = RateLimiter::per_minute(2);
        assert!(limiter.check(A).is_ok());
        assert!(limiter.check(A).is_ok());

        tokio::time::advance(Duration::from_secs(20)).await;
        let retry = limiter.check(A).unwrap_err();
        assert_eq!(retry, Duration::from_secs(40));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(limiter.check(A).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_counted_separately() {
        let limiter = RateLimiter::per_minute(1);
        assert!(limiter.check(A).is_ok());
        assert!(limiter.check(A).is_err());
        assert!(limiter.check(B).is_ok());
    }
}
