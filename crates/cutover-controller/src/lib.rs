//! Cutover deployment controller: the blue/green state machine.
//!
//! One tokio task drives each active deployment through
//!
//! ```text
//! REQUESTED → PROVISIONING_GREEN → AWAITING_HEALTH → SHIFTING_TRAFFIC
//!           → POST_SHIFT_VERIFY → DRAINING_BLUE → COMPLETED
//!
//! failures after provisioning:  → ROLLING_BACK → ROLLED_BACK
//! unrecoverable:                → FAILED
//! ```
//!
//! Every transition is persisted (compare-and-swap on the record version)
//! before the next state's entry action runs, so a restarted controller
//! re-enters the stored state and repeats its idempotent entry action.
//!
//! # Components
//!
//! - **`controller`**: `Controller`: submit, cancel, resume, shutdown
//! - **`runner`**: per-deployment entry actions and commits
//! - **`gate`**: pure health verdicts for the two waiting states
//! - **`sweep`**: reconcile pass for task sets whose termination failed
//! - **`events`**: transition broadcast

pub mod controller;
pub mod error;
pub mod events;
pub mod gate;
pub mod request;
mod runner;
pub mod sweep;

pub use controller::{Controller, ControllerSettings};
pub use error::{ControllerError, ControllerResult};
pub use events::DeploymentEvent;
pub use gate::{Verdict, VerifyWindow};
pub use request::DeploymentRequest;
pub use sweep::{SweepReport, run_sweeper};
