//! cutover-state — durable rollout records for cutover.
//!
//! Backed by [redb](https://docs.rs/redb). Every phase transition of a
//! rollout is written here, so a crashed process leaves behind enough
//! to roll back safely on restart.
//!
//! # Tables
//!
//! - `rollouts` — the one active `RolloutState` per service
//! - `stable` — the environment currently serving a service
//! - `history` — finished rollouts keyed `{service}:{started_at}:{version}`
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
