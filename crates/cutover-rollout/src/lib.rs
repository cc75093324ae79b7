//! cutover-rollout — the rollout state machine.
//!
//! The controller drives one rollout per service through
//! `Preparing → DeployingTarget → HealthChecking ⇄ Promoting → Cleanup`,
//! with a `RollingBack` phase reachable from every non-terminal phase.
//!
//! # Components
//!
//! - **`lease`** — in-process guard allowing one rollout per service
//! - **`controller`** — phase handlers, rollback, and crash recovery

pub mod controller;
pub mod lease;

pub use controller::{RolloutController, RolloutRequest};
pub use lease::{LeaseRegistry, RolloutLease};
