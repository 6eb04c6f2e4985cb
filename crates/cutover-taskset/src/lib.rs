//! cutover-taskset: task set lifecycle on top of an infrastructure platform.
//!
//! The `TaskSetManager` is the only component that talks to the
//! [`Platform`]. It:
//!
//! - Creates task sets idempotently (keyed by `{deployment_id}/{role}`)
//! - Drains then removes task sets, tolerating repeats
//! - Serves status within a bounded time, falling back to a cached copy
//! - Retries transient platform errors with exponential backoff
//! - Feeds the health prober with expected instances
//!
//! # Architecture
//!
//! ```text
//! TaskSetManager
//!   ├── Platform (create / find_by_key / describe / instances / scale / drain / remove)
//!   ├── idempotency key → task set id cache
//!   └── task set id → last known TaskSet cache (served with stale = true on timeout)
//! ```
//!
//! [`MemoryPlatform`] is an in-process fleet used for standalone mode and
//! tests.

pub mod error;
pub mod manager;
pub mod memory;
pub mod platform;

pub use error::{TaskSetError, TaskSetResult};
pub use manager::{TaskSetManager, TaskSetStatus};
pub use memory::MemoryPlatform;
pub use platform::{Platform, PlatformError, TaskSetRequest};
