//! Retry Policy (§4.D): a pure function from error kind and attempt counters
//! to a retry decision. Grounded on the backoff formula in the teacher's
//! `shared/query.rs::execute_query_with_retry`
//! (`retry_backoff_ms.saturating_mul(2^(attempt-1))`), generalized into a
//! full decision table and parameterized on a configurable multiplier.

use std::time::Duration;

use rand::Rng;

use crate::error::ErrorKind;
use crate::lifecycle::Status;

#[derive(Debug, Clone, Copy)]
pub struct PolicyParams {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    pub per_endpoint_attempt: u32,
    pub global_attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub retry_same: bool,
    pub switch_endpoint: bool,
    pub suspend: bool,
    pub delay: Duration,
    pub final_status: Option<Status>,
    pub reason: &'static str,
}

impl RetryDecision {
    fn terminate(final_status: Status, reason: &'static str) -> Self {
        Self { retry_same: false, switch_endpoint: false, suspend: false, delay: Duration::ZERO, final_status: Some(final_status), reason }
    }
    fn retry_same(delay: Duration, reason: &'static str) -> Self {
        Self { retry_same: true, switch_endpoint: false, suspend: false, delay, final_status: None, reason }
    }
    fn switch(delay: Duration, reason: &'static str) -> Self {
        Self { retry_same: false, switch_endpoint: true, suspend: false, delay, final_status: None, reason }
    }
    fn suspend(delay: Duration, final_status: Status, reason: &'static str) -> Self {
        Self { retry_same: false, switch_endpoint: false, suspend: true, delay, final_status: Some(final_status), reason }
    }
}

/// Status to use if a suspended request entry times out, keyed by the error
/// kind that triggered the suspension (§9 Open Question b context — a
/// rate-limit-driven suspension that times out is still reported as
/// `rate_limited`, not the generic `timeout`).
pub fn suspend_timeout_status(kind: ErrorKind) -> Status {
    match kind {
        ErrorKind::RateLimit => Status::RateLimited,
        _ => Status::Timeout,
    }
}

fn backoff(attempt: u32, base: Duration, max: Duration, multiplier: f64) -> Duration {
    let exp = multiplier.powi(attempt.saturating_sub(1) as i32);
    let computed = base.mul_f64(exp.max(0.0));
    computed.min(max)
}

/// Applies up to ±20% jitter to a computed backoff so concurrent requests
/// retrying the same endpoint don't all wake up together.
fn apply_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(0.8..1.2);
    delay.mul_f64(factor)
}

fn rate_limit_backoff(attempt: u32, params: &PolicyParams, retry_after: Option<Duration>) -> Duration {
    let base = params.base_delay.max(Duration::from_secs(60));
    let multiplier = (params.multiplier * 1.5).max(2.0);
    let cap = params.max_delay * 2;
    let computed = backoff(attempt, base, cap, multiplier);
    match retry_after {
        Some(hint) => computed.max(hint),
        None => computed,
    }
}

/// Decides what to do after one failed forward attempt. Pure and
/// deterministic given the same inputs (§4.D, §8 round-trip property).
pub fn decide(kind: ErrorKind, ctx: RetryContext, params: &PolicyParams, retry_after: Option<Duration>) -> RetryDecision {
    match kind {
        ErrorKind::ClientCancel => RetryDecision::terminate(Status::Cancelled, "client cancelled"),
        ErrorKind::Network => {
            if ctx.per_endpoint_attempt < params.max_attempts {
                RetryDecision::retry_same(
                    apply_jitter(backoff(ctx.per_endpoint_attempt, params.base_delay, params.max_delay, params.multiplier)),
                    "network error, retrying same endpoint",
                )
            } else {
                RetryDecision::switch(apply_jitter(params.base_delay), "network error, endpoint attempts exhausted")
            }
        }
        ErrorKind::Timeout => RetryDecision::switch(
            apply_jitter(backoff(ctx.per_endpoint_attempt, params.base_delay, params.max_delay, params.multiplier)),
            "upstream timeout, switching endpoint",
        ),
        ErrorKind::Http4xx => RetryDecision::terminate(Status::Error, "non-retryable client error"),
        ErrorKind::Server5xx => RetryDecision::switch(
            apply_jitter(backoff(ctx.per_endpoint_attempt, params.base_delay, params.max_delay, params.multiplier)),
            "upstream server error, switching endpoint",
        ),
        ErrorKind::Stream => {
            if ctx.per_endpoint_attempt < params.max_attempts {
                RetryDecision::retry_same(
                    apply_jitter(backoff(ctx.per_endpoint_attempt, params.base_delay, params.max_delay, params.multiplier)),
                    "stream error, retrying same endpoint",
                )
            } else {
                RetryDecision::switch(apply_jitter(params.base_delay), "stream error, endpoint attempts exhausted")
            }
        }
        ErrorKind::Auth => RetryDecision::terminate(Status::AuthError, "authentication failed upstream"),
        ErrorKind::RateLimit => {
            if ctx.global_attempt >= params.max_attempts {
                return RetryDecision::suspend(Duration::ZERO, Status::RateLimited, "rate limited, global attempts exhausted");
            }
            let delay = rate_limit_backoff(ctx.per_endpoint_attempt, params, retry_after);
            if delay > Duration::from_secs(30) {
                RetryDecision::suspend(delay, Status::RateLimited, "rate limited, backoff exceeds suspension threshold")
            } else {
                RetryDecision::switch(delay, "rate limited, switching endpoint")
            }
        }
        ErrorKind::Parsing => RetryDecision::switch(
            apply_jitter(backoff(ctx.per_endpoint_attempt, params.base_delay, params.max_delay, params.multiplier)),
            "response parsing failed, switching endpoint",
        ),
        ErrorKind::Unknown => {
            if ctx.per_endpoint_attempt < params.max_attempts {
                RetryDecision::retry_same(
                    apply_jitter(backoff(ctx.per_endpoint_attempt, params.base_delay, params.max_delay, params.multiplier)),
                    "unknown error, retrying same endpoint",
                )
            } else {
                RetryDecision::switch(apply_jitter(params.base_delay), "unknown error, endpoint attempts exhausted")
            }
        }
    }
}
