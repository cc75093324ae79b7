//! cutover-health — readiness checking for rollouts.
//!
//! Provides HTTP readiness probes, a bounded retry combinator, and the
//! `HealthChecker` the rollout controller calls between steps.
//!
//! # Architecture
//!
//! ```text
//! HealthChecker
//!   ├── check()               one probe → HealthCheckResult
//!   └── wait_until_healthy()  retry_with_backoff(check) → HealthReport
//!         ├── Probe   (HttpProbe in production, scripted in tests)
//!         └── Clock   (TokioClock; pausable under tokio test-util)
//! ```
//!
//! Attempts within one `wait_until_healthy` call are strictly sequential,
//! and the checker never touches environment state: callers decide what
//! a failure means.

pub mod checker;
pub mod clock;
pub mod probe;
pub mod retry;

pub use checker::{HealthChecker, HealthReport};
pub use clock::{Clock, TokioClock};
pub use probe::{HttpProbe, Probe, ProbeResult, ScriptedProbe, StaticProbe};
pub use retry::{retry_with_backoff, RetryOutcome};
