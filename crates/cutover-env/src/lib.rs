//! cutover-env — target environments and their lifecycle.
//!
//! An environment is one deployable unit of a service (a blue or green
//! slot, or a version-named slot for rolling and canary rollouts). The
//! `EnvironmentManager` owns the in-memory lifecycle record of every
//! environment and drives a `ComputeBackend` to actually start, scale,
//! and stop workloads.
//!
//! ```text
//! EnvironmentManager
//!   ├── start / stop / scale   → ComputeBackend
//!   │       ├── CommandCompute  (operator argv templates)
//!   │       └── MemoryCompute   (dry runs and tests)
//!   └── mark / status / list   lifecycle bookkeeping only
//! ```

pub mod backend;
pub mod manager;

pub use backend::{CommandCompute, ComputeBackend, ComputeCall, ComputeFuture, ComputeOp, MemoryCompute};
pub use manager::EnvironmentManager;
