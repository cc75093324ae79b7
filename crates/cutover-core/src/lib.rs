//! cutover-core — shared types for the cutover deployment orchestrator.
//!
//! Everything the other crates agree on lives here: environments and
//! their lifecycle, rollout plans, persisted rollout state, the error
//! taxonomy, `cutover.toml` parsing, command templates for external
//! platform tooling, and the operator abort signal.

pub mod abort;
pub mod command;
pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use abort::{abort_pair, AbortHandle, AbortSignal};
pub use command::{CommandTemplate, TemplateVars};
pub use config::{CutoverConfig, EndpointTemplate};
pub use duration::parse_duration;
pub use error::{CutoverError, CutoverResult};
pub use types::*;
