//! Failsafe mechanisms: authentication lockout and request throttling

mod clock;
mod lockout;
mod rate_limiter;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use lockout::{Attempt, LockoutLimiter, RateDecision};
pub use rate_limiter::RequestThrottle;
