//! Memory-stall driven CPU frequency governor.
//!
//! Every update event on a unit may re-evaluate its domain's frequency from
//! perf counter deltas. Decisions are applied through the cpufreq driver and
//! recorded in a bounded per-domain log for export.

pub mod datasource;
pub mod error;
pub mod model;
pub mod utils;

pub use error::{CounterError, GovernorError, GovernorResult, ResolveError};
