//! Failed-authentication lockout
//!
//! Counts failed credential checks per client identifier inside a fixed
//! window. Reaching `max_attempts` locks the identifier out for
//! `lockout`; while locked, every request is refused before the credential
//! is even looked at.
//!
//! Each identifier lives in its own `DashMap` slot and every decision is made
//! while holding that slot's write guard, so two racing failures cannot both
//! slip under the threshold.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use super::clock::{Clock, MonotonicClock};
use crate::config::RateLimitConfig;

/// Fallback lock length when `now + lockout` is not representable
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + after`, clamped to the latest representable instant.
///
/// Never earlier than `now + 1 day` unless the platform cannot represent
/// even that, so an oversized lockout still locks.
fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .or_else(|| now.checked_add(Duration::from_secs(24 * 60 * 60)))
        .unwrap_or(now)
}

/// What the caller knows about the current attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Pre-check before the credential is compared
    Pending,
    /// The credential did not match
    Failed,
    /// The credential matched
    Succeeded,
}

/// Limiter verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The attempt may proceed
    Allowed,
    /// The identifier is locked out
    Locked {
        /// Time until the lockout ends
        retry_after: Duration,
    },
}

impl RateDecision {
    /// `true` for [`RateDecision::Allowed`]
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Whole seconds to advertise in `Retry-After` (rounded up, at least 1)
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Allowed => None,
            Self::Locked { retry_after } => {
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                Some(secs.max(1))
            }
        }
    }
}

/// Per-identifier counters
#[derive(Debug, Clone)]
struct LockoutEntry {
    failure_count: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
    last_seen: Instant,
}

impl LockoutEntry {
    fn new(now: Instant) -> Self {
        Self {
            failure_count: 0,
            window_start: now,
            locked_until: None,
            last_seen: now,
        }
    }

    fn locked_for(&self, now: Instant) -> Option<Duration> {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Start a fresh window once the old one (or an expired lockout) is over
    fn roll(&mut self, now: Instant, window: Duration) {
        let lock_expired = self.locked_until.is_some_and(|until| until <= now);
        // A window end past the representable range never elapses
        let window_over = self
            .window_start
            .checked_add(window)
            .is_some_and(|end| now >= end);
        if lock_expired || window_over {
            self.failure_count = 0;
            self.window_start = now;
            self.locked_until = None;
        }
    }
}

/// Lockout limiter keyed by client identifier
#[derive(Debug)]
pub struct LockoutLimiter {
    entries: DashMap<String, LockoutEntry>,
    max_attempts: u32,
    window: Duration,
    lockout: Duration,
    clock: Arc<dyn Clock>,
}

impl LockoutLimiter {
    /// Create a limiter on the process monotonic clock
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    /// Create a limiter on an explicit clock
    #[must_use]
    pub fn with_clock(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            max_attempts: config.max_attempts.max(1),
            window: config.window,
            lockout: config.lockout,
            clock,
        }
    }

    /// Decide on an attempt from `client_id` and record its outcome
    pub fn check_and_record(&self, client_id: &str, attempt: Attempt) -> RateDecision {
        let now = self.clock.now();

        match attempt {
            Attempt::Pending => {
                let Some(mut entry) = self.entries.get_mut(client_id) else {
                    return RateDecision::Allowed;
                };
                if let Some(retry_after) = entry.locked_for(now) {
                    return RateDecision::Locked { retry_after };
                }
                entry.roll(now, self.window);
                RateDecision::Allowed
            }
            Attempt::Succeeded => match self.entries.entry(client_id.to_string()) {
                Entry::Occupied(occupied) => {
                    if let Some(retry_after) = occupied.get().locked_for(now) {
                        return RateDecision::Locked { retry_after };
                    }
                    occupied.remove();
                    debug!(client_ip = %client_id, "Cleared failed-attempt history");
                    RateDecision::Allowed
                }
                Entry::Vacant(_) => RateDecision::Allowed,
            },
            Attempt::Failed => {
                let mut entry = self
                    .entries
                    .entry(client_id.to_string())
                    .or_insert_with(|| LockoutEntry::new(now));
                if let Some(retry_after) = entry.locked_for(now) {
                    return RateDecision::Locked { retry_after };
                }
                entry.roll(now, self.window);
                entry.failure_count = entry.failure_count.saturating_add(1);
                entry.last_seen = now;

                if entry.failure_count >= self.max_attempts {
                    let until = deadline(now, self.lockout);
                    entry.locked_until = Some(until);
                    let retry_after = until.saturating_duration_since(now);
                    warn!(
                        client_ip = %client_id,
                        failures = entry.failure_count,
                        lockout_secs = retry_after.as_secs(),
                        "Client locked out after repeated authentication failures"
                    );
                    return RateDecision::Locked { retry_after };
                }
                RateDecision::Allowed
            }
        }
    }

    /// Failures counted in the current window for `client_id`
    #[must_use]
    pub fn failure_count(&self, client_id: &str) -> u32 {
        self.entries.get(client_id).map_or(0, |e| e.failure_count)
    }

    /// Whether `client_id` is locked out right now
    #[must_use]
    pub fn is_locked(&self, client_id: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .get(client_id)
            .is_some_and(|e| e.locked_for(now).is_some())
    }

    /// Evict entries that are not locked and have been idle for
    /// `2 × lockout`. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let idle_after = self.lockout.saturating_mul(2);
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.locked_for(now).is_some() || now.duration_since(entry.last_seen) <= idle_after
        });
        before.saturating_sub(self.entries.len())
    }

    /// Number of tracked identifiers
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no identifier is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured lockout duration
    #[must_use]
    pub fn lockout(&self) -> Duration {
        self.lockout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failsafe::ManualClock;

    fn limiter() -> (LockoutLimiter, ManualClock) {
        let clock = ManualClock::new();
        let config = RateLimitConfig::default();
        (LockoutLimiter::with_clock(&config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn lockout_at_threshold() {
        let (limiter, _clock) = limiter();
        for _ in 0..4 {
            assert!(limiter.check_and_record("10.0.0.5", Attempt::Failed).is_allowed());
        }
        let decision = limiter.check_and_record("10.0.0.5", Attempt::Failed);
        assert_eq!(
            decision,
            RateDecision::Locked {
                retry_after: Duration::from_secs(300)
            }
        );
        assert!(!limiter.check_and_record("10.0.0.5", Attempt::Pending).is_allowed());
        assert!(limiter.is_locked("10.0.0.5"));
    }

    #[test]
    fn locked_attempt_does_not_touch_counters() {
        let (limiter, clock) = limiter();
        for _ in 0..5 {
            limiter.check_and_record("a", Attempt::Failed);
        }
        clock.advance(Duration::from_secs(10));
        let decision = limiter.check_and_record("a", Attempt::Failed);
        assert_eq!(decision.retry_after_secs(), Some(290));
        assert_eq!(limiter.failure_count("a"), 5);
    }

    #[test]
    fn success_while_locked_is_refused() {
        let (limiter, _clock) = limiter();
        for _ in 0..5 {
            limiter.check_and_record("a", Attempt::Failed);
        }
        assert!(!limiter.check_and_record("a", Attempt::Succeeded).is_allowed());
    }

    #[test]
    fn lockout_expiry_resets_count() {
        let (limiter, clock) = limiter();
        for _ in 0..5 {
            limiter.check_and_record("a", Attempt::Failed);
        }
        clock.advance(Duration::from_secs(301));
        assert!(limiter.check_and_record("a", Attempt::Pending).is_allowed());
        assert!(limiter.check_and_record("a", Attempt::Succeeded).is_allowed());
        assert_eq!(limiter.failure_count("a"), 0);

        assert!(limiter.check_and_record("a", Attempt::Failed).is_allowed());
        assert_eq!(limiter.failure_count("a"), 1);
    }

    #[test]
    fn expired_lock_restarts_window_even_without_success() {
        let config = RateLimitConfig {
            window: Duration::from_secs(3600),
            lockout: Duration::from_secs(60),
            ..RateLimitConfig::default()
        };
        let clock = ManualClock::new();
        let limiter = LockoutLimiter::with_clock(&config, Arc::new(clock.clone()));
        for _ in 0..5 {
            limiter.check_and_record("a", Attempt::Failed);
        }
        clock.advance(Duration::from_secs(61));
        assert!(limiter.check_and_record("a", Attempt::Failed).is_allowed());
        assert_eq!(limiter.failure_count("a"), 1);
    }

    #[test]
    fn window_rollover_forgets_early_failures() {
        let (limiter, clock) = limiter();
        for _ in 0..4 {
            limiter.check_and_record("a", Attempt::Failed);
        }
        clock.advance(Duration::from_secs(61));
        assert!(limiter.check_and_record("a", Attempt::Failed).is_allowed());
        assert_eq!(limiter.failure_count("a"), 1);
        assert!(!limiter.is_locked("a"));
    }

    #[test]
    fn identifiers_are_isolated() {
        let (limiter, _clock) = limiter();
        for _ in 0..5 {
            limiter.check_and_record("10.0.0.5", Attempt::Failed);
        }
        assert!(limiter.check_and_record("10.0.0.6", Attempt::Pending).is_allowed());
        assert!(limiter.check_and_record("10.0.0.6", Attempt::Succeeded).is_allowed());
        assert_eq!(limiter.failure_count("10.0.0.6"), 0);
    }

    #[test]
    fn pending_never_creates_entries() {
        let (limiter, _clock) = limiter();
        assert!(limiter.check_and_record("a", Attempt::Pending).is_allowed());
        assert!(limiter.check_and_record("b", Attempt::Succeeded).is_allowed());
        assert!(limiter.is_empty());
    }

    #[test]
    fn sweep_evicts_idle_unlocked_entries() {
        let (limiter, clock) = limiter();
        limiter.check_and_record("idle", Attempt::Failed);
        for _ in 0..5 {
            limiter.check_and_record("locked", Attempt::Failed);
        }
        clock.advance(Duration::from_secs(299));
        assert_eq!(limiter.sweep(), 0);

        clock.advance(Duration::from_secs(302));
        assert_eq!(limiter.sweep(), 2);
        assert!(limiter.is_empty());
    }

    #[test]
    fn sweep_keeps_active_lockouts() {
        let config = RateLimitConfig {
            lockout: Duration::from_secs(60),
            ..RateLimitConfig::default()
        };
        let clock = ManualClock::new();
        let limiter = LockoutLimiter::with_clock(&config, Arc::new(clock.clone()));
        for _ in 0..5 {
            limiter.check_and_record("a", Attempt::Failed);
        }
        clock.advance(Duration::from_secs(59));
        assert_eq!(limiter.sweep(), 0);
        assert!(limiter.is_locked("a"));
    }

    #[test]
    fn concurrent_failures_lock_exactly_once() {
        let (limiter, _clock) = limiter();
        let limiter = Arc::new(limiter);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.check_and_record("racer", Attempt::Failed))
            })
            .collect();
        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(RateDecision::is_allowed)
            .count();
        assert_eq!(allowed, 4);
        assert_eq!(limiter.failure_count("racer"), 5);
    }

    #[test]
    fn oversized_lockout_still_locks() {
        let config = RateLimitConfig {
            lockout: Duration::MAX,
            ..RateLimitConfig::default()
        };
        let clock = ManualClock::new();
        let limiter = LockoutLimiter::with_clock(&config, Arc::new(clock.clone()));

        let decisions: Vec<_> = (0..8)
            .map(|_| limiter.check_and_record("10.0.0.5", Attempt::Failed))
            .collect();
        assert!(decisions[..4].iter().all(RateDecision::is_allowed));
        assert!(decisions[4..].iter().all(|d| !d.is_allowed()));
        assert!(decisions[4].retry_after_secs().unwrap() > 365 * 24 * 60 * 60);

        clock.advance(Duration::from_secs(24 * 60 * 60));
        assert!(limiter.is_locked("10.0.0.5"));
        assert!(!limiter.check_and_record("10.0.0.5", Attempt::Succeeded).is_allowed());
        assert_eq!(limiter.sweep(), 0);
    }

    #[test]
    fn oversized_window_keeps_counting() {
        let config = RateLimitConfig {
            window: Duration::MAX,
            ..RateLimitConfig::default()
        };
        let clock = ManualClock::new();
        let limiter = LockoutLimiter::with_clock(&config, Arc::new(clock.clone()));
        for _ in 0..4 {
            assert!(limiter.check_and_record("a", Attempt::Failed).is_allowed());
            clock.advance(Duration::from_secs(3600));
        }
        assert_eq!(limiter.failure_count("a"), 4);
        assert!(!limiter.check_and_record("a", Attempt::Failed).is_allowed());
    }

    #[test]
    fn retry_after_rounds_up() {
        let decision = RateDecision::Locked {
            retry_after: Duration::from_millis(299_001),
        };
        assert_eq!(decision.retry_after_secs(), Some(300));
        assert_eq!(RateDecision::Allowed.retry_after_secs(), None);
    }
}
