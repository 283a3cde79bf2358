//! Progress reporting seam.
//!
//! The engine only ever calls the methods of [`ProgressMonitor`]; how progress
//! is rendered is up to whoever supplies the monitors through a
//! [`ProgressProvider`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::job::Job;

pub trait ProgressMonitor: Send + Sync {
    /// `total` is `None` when the amount of work is unknown.
    fn begin_task(&self, _name: &str, _total: Option<u32>) {}

    fn worked(&self, _units: u32) {}

    fn done(&self) {}

    fn is_canceled(&self) -> bool;

    fn set_canceled(&self, canceled: bool);

    /// The owning operation is waiting on `reason` before it can continue.
    fn set_blocked(&self, _reason: &str) {}

    fn clear_blocked(&self) {}
}

/// A monitor that tracks only cancellation.
#[derive(Default)]
pub struct NullProgressMonitor {
    canceled: AtomicBool,
}

impl NullProgressMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn ProgressMonitor> {
        Arc::new(Self::default())
    }
}

impl ProgressMonitor for NullProgressMonitor {
    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    fn set_canceled(&self, canceled: bool) {
        self.canceled.store(canceled, Ordering::Release);
    }
}

impl fmt::Debug for NullProgressMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NullProgressMonitor")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Monitor used while a yielding job re-acquires its rule: a pending cancel
/// of the job must not abort the re-acquisition.
pub(crate) struct UncancelableMonitor;

impl ProgressMonitor for UncancelableMonitor {
    fn is_canceled(&self) -> bool {
        false
    }

    fn set_canceled(&self, _canceled: bool) {}
}

/// Factory for the monitors handed to running jobs.
pub trait ProgressProvider: Send + Sync {
    fn create_monitor(&self, job: &Job) -> Arc<dyn ProgressMonitor>;

    /// Monitor for a job that reports into a shared progress group, owning
    /// `ticks` of the group's work. See [`Job::set_progress_group`].
    fn create_group_monitor(
        &self,
        job: &Job,
        _group_monitor: &Arc<dyn ProgressMonitor>,
        _ticks: u32,
    ) -> Arc<dyn ProgressMonitor> {
        self.create_monitor(job)
    }
}

pub(crate) fn is_canceled(monitor: Option<&Arc<dyn ProgressMonitor>>) -> bool {
    monitor.is_some_and(|m| m.is_canceled())
}
