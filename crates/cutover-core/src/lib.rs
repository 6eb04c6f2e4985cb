//! cutover-core: shared plumbing for the Cutover crates.
//!
//! Nothing in here knows about deployments. It holds the pieces every
//! other crate leans on: the `cutover.toml` config file, human-readable
//! duration strings, container image reference parsing, and the bounded
//! exponential-backoff retry used around every infrastructure call.

pub mod config;
pub mod duration;
pub mod image;
pub mod retry;

pub use config::{ConfigError, CutoverConfig, HealthPolicy};
pub use duration::{format_duration, parse_duration};
pub use image::{ImageRef, ImageRefError};
pub use retry::{RetryPolicy, retry};
