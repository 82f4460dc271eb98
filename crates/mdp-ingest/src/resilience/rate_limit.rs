//! Client-side token bucket per source

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;

/// Gates outbound requests to a configured per-minute quota (burst = quota)
pub struct RequestLimiter {
    limiter: DefaultDirectRateLimiter,
    per_minute: NonZeroU32,
}

impl RequestLimiter {
    /// `None` when `requests_per_minute` is zero
    pub fn per_minute(requests_per_minute: u32) -> Option<Self> {
        let per_minute = NonZeroU32::new(requests_per_minute)?;
        Some(Self {
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            per_minute,
        })
    }

    pub fn quota(&self) -> u32 {
        self.per_minute.get()
    }

    /// Wait until a request may be issued
    pub async fn until_ready(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a permit without waiting
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl std::fmt::Debug for RequestLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLimiter")
            .field("per_minute", &self.per_minute)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_equals_quota() {
        let limiter = RequestLimiter::per_minute(3).unwrap();
        assert_eq!(limiter.quota(), 3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_zero_quota_disables_limiter() {
        assert!(RequestLimiter::per_minute(0).is_none());
    }

    #[tokio::test]
    async fn test_until_ready_with_available_permit() {
        let limiter = RequestLimiter::per_minute(60).unwrap();
        limiter.until_ready().await;
        assert!(limiter.try_acquire());
    }
}
