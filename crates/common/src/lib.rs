#![deny(missing_docs)]

//! Shared error types, configuration, and concurrency primitives for opal crates.
//!
//! Architecture role:
//! - defines the [`Error`] / [`Result`] contracts used across the planner stack
//! - provides planner configuration passed across layers
//! - hosts the cancellation token and the concurrent byte unifier
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`cancel`]
//! - [`unify`]

/// Cooperative cancellation.
pub mod cancel;
/// Planner configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Lock-free byte-string deduplication.
pub mod unify;

pub use cancel::CancelToken;
pub use config::PlannerConfig;
pub use error::{Error, Result};
pub use unify::Unifier;
