//! Per-client request limit on the `/api` routes.
//!
//! Clients are keyed by peer IP. Every server shares one limiter, so
//! hopping between ports does not reset a client's budget.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde_json::json;

pub const RATE_LIMITED_MESSAGE: &str = "Too many requests from this IP, please try again later.";

#[derive(Clone)]
pub struct ClientRateLimit {
    limiter: Option<Arc<DefaultKeyedRateLimiter<IpAddr>>>,
}

impl ClientRateLimit {
    /// `max_requests` per client per `window`, refilled evenly. Zero for
    /// either disables the limit.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        let limiter = NonZeroU32::new(max_requests)
            .and_then(|burst| {
                Quota::with_period(window / burst.get()).map(|quota| quota.allow_burst(burst))
            })
            .map(|quota| Arc::new(RateLimiter::keyed(quota)));

        if limiter.is_none() {
            tracing::warn!(
                "API rate limiting disabled (max {} per {:?})",
                max_requests,
                window
            );
        }
        Self { limiter }
    }

    pub fn disabled() -> Self {
        Self { limiter: None }
    }

    /// `Err` carries how long until the client may retry.
    pub fn check(&self, client: IpAddr) -> Result<(), Duration> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        limiter
            .check_key(&client)
            .map_err(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
    }
}

pub async fn limit_requests(
    State(limit): State<ClientRateLimit>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // Absent when the router is driven without a socket (tests)
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    match limit.check(client) {
        Ok(()) => next.run(req).await,
        Err(wait) => {
            tracing::warn!("Rate limit exceeded for {} on {}", client, req.uri().path());
            let mut resp = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "success": false,
                    "error": RATE_LIMITED_MESSAGE,
                    "errorCode": "RATE_LIMITED",
                })),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&wait.as_secs().max(1).to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, value);
            }
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_A: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const CLIENT_B: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));

    #[test]
    fn test_budget_per_window() {
        let limit = ClientRateLimit::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limit.check(CLIENT_A).is_ok());
        }
        let wait = limit.check(CLIENT_A).unwrap_err();
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(20));
    }

    #[test]
    fn test_clients_are_independent() {
        let limit = ClientRateLimit::new(1, Duration::from_secs(60));
        assert!(limit.check(CLIENT_A).is_ok());
        assert!(limit.check(CLIENT_A).is_err());
        assert!(limit.check(CLIENT_B).is_ok());
    }

    #[test]
    fn test_clones_share_budget() {
        let limit = ClientRateLimit::new(1, Duration::from_secs(60));
        let other = limit.clone();
        assert!(limit.check(CLIENT_A).is_ok());
        assert!(other.check(CLIENT_A).is_err());
    }

    #[test]
    fn test_zero_disables() {
        let limit = ClientRateLimit::new(0, Duration::from_secs(60));
        for _ in 0..500 {
            assert!(limit.check(CLIENT_A).is_ok());
        }
        assert!(ClientRateLimit::disabled().check(CLIENT_A).is_ok());
        assert!(ClientRateLimit::new(5, Duration::ZERO).check(CLIENT_A).is_ok());
    }
}
