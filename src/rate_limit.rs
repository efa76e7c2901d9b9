use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;

use crate::{
    errors::AppError,
    mcp::rpc::ProtocolResponse,
    router::{Middleware, Next, RoutedRequest},
};

/// Token bucket refilled continuously at `per_minute / 60` tokens per second.
#[derive(Debug)]
struct TokenBucket {
    per_minute: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        Self {
            per_minute: f64::from(per_minute),
            tokens: f64::from(per_minute),
            last_refill: Instant::now(),
        }
    }

    /// On refusal, returns how long until one token is available.
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_minute / 60.0).min(self.per_minute);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64(
                (1.0 - self.tokens) * 60.0 / self.per_minute,
            ))
        }
    }
}

/// Budgets `tools/call` requests; other methods pass untouched. A budget of
/// zero disables limiting.
#[derive(Debug)]
pub struct RateLimitMiddleware {
    bucket: Option<Mutex<TokenBucket>>,
}

impl RateLimitMiddleware {
    pub fn per_minute(limit: u32) -> Self {
        Self {
            bucket: (limit > 0).then(|| Mutex::new(TokenBucket::new(limit))),
        }
    }

    pub fn disabled() -> Self {
        Self { bucket: None }
    }

    fn acquire(&self) -> Result<(), AppError> {
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.try_acquire(Instant::now()).map_err(|wait| {
            let retry_after = wait.as_secs_f64().ceil().max(1.0) as u64;
            AppError::rate_limited("tool call rate limit exceeded", Some(retry_after))
        })
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(&self, request: RoutedRequest, next: Next<'_>) -> Option<ProtocolResponse> {
        if request.method() == "tools/call" {
            if let Err(err) = self.acquire() {
                warn!(
                    tool = request.tool_name().unwrap_or("-"),
                    retry_after = err.retry_after().unwrap_or_default(),
                    "tool call rejected by rate limiter"
                );
                return request
                    .id()
                    .map(|id| ProtocolResponse::failure(Some(id.clone()), &err));
            }
        }
        next.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(60);
        let start = Instant::now();
        for _ in 0..60 {
            assert!(bucket.try_acquire(start).is_ok());
        }
        let wait = bucket.try_acquire(start).expect_err("drained");
        assert_eq!(wait, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_acquire(Instant::now()).is_ok());
        assert!(bucket.try_acquire(Instant::now()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(2);
        tokio::time::advance(Duration::from_secs(600)).await;
        let now = Instant::now();
        assert!(bucket.try_acquire(now).is_ok());
        assert!(bucket.try_acquire(now).is_ok());
        assert!(bucket.try_acquire(now).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_reports_retry_after() {
        let limiter = RateLimitMiddleware::per_minute(1);
        assert!(limiter.acquire().is_ok());
        let error = limiter.acquire().expect_err("limited");
        assert_eq!(error.retry_after(), Some(60));
        assert!(error.is_retryable());

        assert!(RateLimitMiddleware::disabled().acquire().is_ok());
        assert!(RateLimitMiddleware::per_minute(0).acquire().is_ok());
    }
}
