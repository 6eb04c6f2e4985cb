//! cutover-state: deployment records and their durable store.
//!
//! Backed by [redb](https://docs.rs/redb). Deployments are JSON-serialized
//! into `&[u8]` value columns keyed by deployment id; a second table maps
//! each service to its one non-terminal deployment and doubles as the
//! per-service lock.
//!
//! Every record carries a `version`. Writes are compare-and-swap on that
//! version: a writer holding a stale copy gets [`StateError::Conflict`]
//! and must reload before retrying.
//!
//! The `DeploymentStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use cutover_core::HealthPolicy;
pub use error::{StateError, StateResult};
pub use store::DeploymentStore;
pub use types::*;
