//! cutover-router — traffic splits between environments of a service.
//!
//! The `TrafficRouter` keeps the authoritative weight table for each
//! service and pushes changes to a `RoutingBackend` before recording
//! them, so the table never claims a split the routing layer refused.

pub mod backend;
pub mod router;

pub use backend::{CommandRouting, MemoryRouting, RoutingBackend, RoutingFuture, WeightChange};
pub use router::{RoutingMode, TrafficRouter};
