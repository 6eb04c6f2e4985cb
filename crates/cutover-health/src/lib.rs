//! cutover-health: liveness probing for task sets.
//!
//! The prober runs one background loop per task set. Each cycle asks a
//! [`ProbeTargets`] source which instances are expected, probes all of
//! them concurrently through an [`InstanceProbe`], and publishes a
//! [`HealthSnapshot`].
//!
//! # Architecture
//!
//! ```text
//! HealthProber
//!   ├── Per-task-set background task
//!   │   ├── ProbeTargets::probe_targets() → expected count + instances
//!   │   ├── InstanceProbe::probe() per instance, bounded by probe_timeout
//!   │   ├── CycleTracker (consecutive passing cycles)
//!   │   └── watch::Sender<Option<HealthSnapshot>>  (single-slot mailbox)
//!   └── subscribe() hands out watch receivers
//! ```
//!
//! # Mailbox
//!
//! Snapshots go through `tokio::sync::watch`: the prober overwrites the
//! slot every cycle and never waits for a reader. A reader that falls
//! behind sees only the freshest verdict, never a queue of stale ones.

pub mod checker;
pub mod prober;

pub use checker::{CycleTracker, HttpProbe, InstanceProbe, ProbeResult};
pub use prober::{HealthProber, HealthSnapshot, ProbeTargetSet, ProbeTargets};
