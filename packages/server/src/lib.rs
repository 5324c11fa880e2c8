//! Engine core for automated media publication.
//!
//! Discovers pre-produced media under per-project content sources, places
//! each item on a cadence-constrained timeline, and publishes it through a
//! rate-governed platform client, with a durable Postgres task store as the
//! single arbiter of state.

pub mod common;
pub mod config;
pub mod kernel;

pub use common::error::{AdapterError, CoreError, CoreResult};
pub use config::CoreConfig;
