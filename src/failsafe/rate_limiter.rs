//! Per-client request throttling for authenticated traffic

use std::num::NonZeroU32;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorLimiter};

use crate::config::RateLimitConfig;

/// Request throttle keyed by client identifier.
///
/// Disabled when `requests_per_second` is 0.
pub struct RequestThrottle {
    inner: Option<DefaultKeyedRateLimiter<String>>,
}

impl RequestThrottle {
    /// Create a throttle from configuration
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let inner = NonZeroU32::new(config.requests_per_second).map(|rps| {
            let quota = Quota::per_second(rps)
                .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));
            GovernorLimiter::keyed(quota)
        });
        Self { inner }
    }

    /// Try to take a permit for `client_id`
    pub fn try_acquire(&self, client_id: &str) -> bool {
        match &self.inner {
            Some(limiter) => limiter.check_key(&client_id.to_string()).is_ok(),
            None => true,
        }
    }

    /// Whether throttling is active
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Drop state for clients whose quota has fully replenished
    pub fn retain_recent(&self) {
        if let Some(limiter) = &self.inner {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }
}

impl std::fmt::Debug for RequestThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestThrottle")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        let throttle = RequestThrottle::new(&RateLimitConfig::default());
        assert!(!throttle.is_enabled());
        for _ in 0..1000 {
            assert!(throttle.try_acquire("10.0.0.5"));
        }
    }

    #[test]
    fn burst_then_throttled_per_client() {
        let config = RateLimitConfig {
            requests_per_second: 1,
            burst_size: 2,
            ..RateLimitConfig::default()
        };
        let throttle = RequestThrottle::new(&config);
        assert!(throttle.try_acquire("a"));
        assert!(throttle.try_acquire("a"));
        assert!(!throttle.try_acquire("a"));
        assert!(throttle.try_acquire("b"));
        throttle.retain_recent();
    }
}
