//! Cutover traffic router: owns the live traffic map of every service.
//!
//! Each service maps to a [`TrafficAssignment`]: task set ids and weights
//! summing to 1.0. A shift replaces the whole map at once; readers see the
//! old assignment or the new one, never a mix.
//!
//! # Components
//!
//! - **`router`**: `TrafficRouter`: validation, steady checks, atomic swap
//! - **`backend`**: `RouterBackend` seam and the in-process backend

pub mod backend;
pub mod error;
pub mod router;

pub use backend::{BackendError, MemoryRouterBackend, RouterBackend};
pub use error::{RouterError, RouterResult};
pub use router::{TrafficAssignment, TrafficRouter};
