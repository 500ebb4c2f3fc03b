use crate::error::AppError;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed, keyed::DashMapStateStore},
};
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

/// Rate limiter for global/unkeyed use
pub type UnkeyedRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Rate limiter keyed by client IP address
pub type IpRateLimiter = Arc<RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>>;

fn quota_for(attempts: u32, window_seconds: u64) -> Quota {
    let attempts = NonZeroU32::new(attempts.max(1)).unwrap_or(NonZeroU32::MIN);
    let period_ms = (window_seconds.max(1) * 1000) / u64::from(attempts.get());
    match Quota::with_period(Duration::from_millis(period_ms.max(1))) {
        Some(quota) => quota.allow_burst(attempts),
        None => Quota::per_second(attempts),
    }
}

/// Allow `attempts` operations per `window_seconds`, bursting up to `attempts`.
pub fn create_unkeyed_rate_limiter(attempts: u32, window_seconds: u64) -> UnkeyedRateLimiter {
    Arc::new(RateLimiter::direct(quota_for(attempts, window_seconds)))
}

/// Same quota as [`create_unkeyed_rate_limiter`], tracked per client IP.
pub fn create_ip_rate_limiter(attempts: u32, window_seconds: u64) -> IpRateLimiter {
    Arc::new(RateLimiter::dashmap(quota_for(attempts, window_seconds)))
}

/// Non-blocking permit check for code paths that are not HTTP middleware.
pub fn try_acquire(limiter: &UnkeyedRateLimiter) -> bool {
    limiter.check().is_ok()
}

/// First hop of `x-forwarded-for`.
pub fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

/// Client IP from `x-forwarded-for` (first hop) or the socket peer address.
pub fn client_ip(request: &Request) -> Option<IpAddr> {
    forwarded_ip(request.headers()).or_else(|| {
        request
            .extensions()
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|axum::extract::ConnectInfo(addr)| addr.ip())
    })
}

/// Middleware for IP-based rate limiting
pub async fn ip_rate_limit_middleware(
    State(limiter): State<IpRateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match client_ip(&request) {
        Some(ip) => match limiter.check_key(&ip) {
            Ok(_) => Ok(next.run(request).await),
            Err(negative) => {
                let wait_time = negative.wait_time_from(DefaultClock::default().now());
                Err(AppError::TooManyRequests(
                    "Too many requests from this IP. Please try again later.".to_string(),
                    Some(wait_time.as_secs()),
                ))
            }
        },
        None => {
            tracing::warn!("Could not determine IP for rate limiting");
            Ok(next.run(request).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unkeyed_limiter_exhausts_burst() {
        let limiter = create_unkeyed_rate_limiter(2, 60);
        assert!(try_acquire(&limiter));
        assert!(try_acquire(&limiter));
        assert!(!try_acquire(&limiter));
    }

    #[test]
    fn forwarded_ip_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(forwarded_ip(&headers), "203.0.113.7".parse().ok());
        assert_eq!(forwarded_ip(&HeaderMap::new()), None);
    }

    #[test]
    fn zero_attempts_still_allows_one() {
        let limiter = create_unkeyed_rate_limiter(0, 60);
        assert!(try_acquire(&limiter));
    }
}
