//! Per-client-IP request quota for the `/api` routes, plus request logging.

use crate::errors::{AppError, ErrorKind};
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const RATE_LIMIT_MESSAGE: &str = "Too many requests from this IP, please try again later";

/// `max_requests` per `window`, per client IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub max_requests: NonZeroU32,
    pub window: Duration,
}

#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<DefaultKeyedRateLimiter<IpAddr>>,
}

impl RateLimitState {
    /// The whole quota is available as a burst and refills evenly over the
    /// window. `None` for a zero-length window.
    pub fn new(settings: RateLimitSettings) -> Option<Self> {
        let replenish = settings.window / settings.max_requests.get();
        let quota = Quota::with_period(replenish)?.allow_burst(settings.max_requests);
        Some(Self {
            limiter: Arc::new(DefaultKeyedRateLimiter::<IpAddr>::keyed(quota)),
        })
    }

    /// Forget clients whose quota has fully replenished. Returns the number
    /// of clients still tracked.
    pub fn prune(&self) -> usize {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        self.limiter.len()
    }

    /// Prune every `every` until the returned task is aborted.
    pub fn spawn_pruner(&self, every: Duration) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let tracked = state.prune();
                debug!("rate limiter pruned, {} clients tracked", tracked);
            }
        })
    }
}

/// Reject requests over quota with 429 and `Retry-After`.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip(&req);
    match state.limiter.check_key(&ip) {
        Ok(()) => next.run(req).await,
        Err(negative) => {
            let wait = negative.wait_time_from(DefaultClock::default().now());
            warn!("rate limit exceeded for {} on {}", ip, req.uri().path());
            let mut response = AppError::new(ErrorKind::RateLimited, RATE_LIMIT_MESSAGE).into_response();
            let secs = wait.as_secs().max(1);
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
            response
        }
    }
}

/// Peer address when the server was started with connect info; requests
/// without it (in-process tests) share the unspecified address.
fn client_ip(req: &Request<Body>) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// One log line per request: method, path, status, latency.
pub async fn log_requests(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    info!(
        "{} {} -> {} ({} ms)",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(max_requests: u32, window: Duration) -> RateLimitState {
        RateLimitState::new(RateLimitSettings {
            max_requests: NonZeroU32::new(max_requests).unwrap(),
            window,
        })
        .unwrap()
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn quota_is_per_client() {
        let state = state(2, Duration::from_secs(900));
        assert!(state.limiter.check_key(&ip(1)).is_ok());
        assert!(state.limiter.check_key(&ip(1)).is_ok());
        assert!(state.limiter.check_key(&ip(1)).is_err());
        assert!(state.limiter.check_key(&ip(2)).is_ok());
    }

    #[tokio::test]
    async fn prune_forgets_replenished_clients() {
        let state = state(2, Duration::from_millis(400));
        for last in 1..=3 {
            state.limiter.check_key(&ip(last)).unwrap();
        }
        assert_eq!(state.limiter.len(), 3);

        // Still inside the window: nothing is dropped.
        assert_eq!(state.prune(), 3);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(state.prune(), 0);
    }

    #[test]
    fn zero_length_window_is_rejected() {
        assert!(
            RateLimitState::new(RateLimitSettings {
                max_requests: NonZeroU32::new(5).unwrap(),
                window: Duration::ZERO,
            })
            .is_none()
        );
    }
}
