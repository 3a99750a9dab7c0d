//! HTTP rate limiting (component I, spec §4.I). Grounded in the teacher's
//! `RateLimitConfig`/`governor` idiom, but actually enforced per remote IP
//! instead of the teacher's global sleep-and-warn placeholder.

use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use std::{net::SocketAddr, num::NonZeroU32, sync::Arc};
use tracing::warn;

pub const REQUESTS_PER_MINUTE: u32 = 120;
pub const TASK_SUBMIT_PER_MINUTE: u32 = 20;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

#[derive(Clone)]
pub struct RateLimitConfig {
    general: Arc<KeyedLimiter>,
    task_submit: Arc<KeyedLimiter>,
}

impl RateLimitConfig {
    pub fn new() -> Self {
        let general_quota = Quota::per_minute(NonZeroU32::new(REQUESTS_PER_MINUTE).unwrap());
        let task_quota = Quota::per_minute(NonZeroU32::new(TASK_SUBMIT_PER_MINUTE).unwrap());
        RateLimitConfig {
            general: Arc::new(RateLimiter::keyed(general_quota)),
            task_submit: Arc::new(RateLimiter::keyed(task_quota)),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn rate_limit_middleware(
    axum::extract::State(limits): axum::extract::State<RateLimitConfig>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = addr.ip().to_string();
    let is_task_submit = request.uri().path() == "/tasks" && request.method() == "POST";

    let limiter = if is_task_submit { &limits.task_submit } else { &limits.general };
    if limiter.check_key(&key).is_err() {
        warn!(ip = %key, path = %request.uri().path(), "rate limit exceeded");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_key_is_allowed() {
        let limits = RateLimitConfig::new();
        assert!(limits.general.check_key(&"1.2.3.4".to_string()).is_ok());
    }

    #[test]
    fn task_submit_quota_is_stricter_than_general() {
        let limits = RateLimitConfig::new();
        let key = "5.6.7.8".to_string();
        for _ in 0..TASK_SUBMIT_PER_MINUTE {
            assert!(limits.task_submit.check_key(&key).is_ok());
        }
        assert!(limits.task_submit.check_key(&key).is_err());
    }
}
