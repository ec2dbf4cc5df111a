//! Rate limiting logic and state management.

mod clock;
mod counter;
mod key;
mod limiter;
mod rules;
mod sweeper;

pub use clock::{Clock, MockClock, SystemClock};
pub use counter::{AdmissionRecord, CounterFault, Decision, SlidingWindowCounter};
pub use key::{RateLimitKey, Scope};
pub use limiter::{Admission, RateLimiter};
pub use rules::{Policy, PolicyResolver, PolicyRule, ResolvedPolicy};
pub use sweeper::{Sweeper, SweeperHandle};
