//! Job manager -- the state machine every job and rule scope goes through.
//!
//! Split into focused submodules:
//! - `core`: manager struct, constructor, the `change_state` transition and
//!   deferred listener delivery, queries
//! - `scheduling`: schedule/cancel/sleep/wake, job selection for workers,
//!   job completion and shutdown
//! - `join`: waiting for jobs, families and groups
//! - `yielding`: implicit rule scopes and cooperative rule yielding

mod core;
mod join;
mod scheduling;
mod yielding;
#[cfg(test)]
mod tests;

pub use self::core::JobManager;
pub(crate) use self::core::{Deferred, ManagerInner, Unit};
pub use self::yielding::YieldTarget;
