use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::core::{JobManager, ManagerState, Unit};
use crate::error::{JobsError, Result};
use crate::group::{GroupState, JobGroup};
use crate::job::{Job, JobId, JobState};
use crate::monitor::{is_canceled, ProgressMonitor};

/// Next wait slice, or `None` once the deadline has passed.
fn slice(deadline: Option<Instant>, interval: Duration) -> Option<Duration> {
    match deadline {
        None => Some(interval),
        Some(deadline) => {
            let now = Instant::now();
            (now < deadline).then(|| (deadline - now).min(interval))
        }
    }
}

impl JobManager {
    /// Block until `job` finishes. Returns false if `timeout` passed first.
    ///
    /// Fails with [`JobsError::Canceled`] if `monitor` is canceled while
    /// waiting, and with [`JobsError::IllegalState`] for joins that could
    /// never complete: a job joining itself, or a job joining a member of its
    /// own capped group without a timeout.
    pub fn join(
        &self,
        job: &Job,
        timeout: Option<Duration>,
        monitor: Option<&Arc<dyn ProgressMonitor>>,
    ) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let me = thread::current().id();

        if let (Some(group), Some(current)) = (job.group(), self.current_job()) {
            if timeout.is_none() && group.max_threads() > 0 && current.group().as_ref() == Some(&group) {
                return Err(JobsError::IllegalState(format!(
                    "{current} cannot join {job}: both run in capped group {}",
                    group.name()
                )));
            }
        }

        let target = {
            let st = self.inner.state.lock();
            let data = job.core().data.lock();
            if data.state == JobState::None {
                return Ok(true);
            }
            // Nothing will start while scheduling is suspended.
            if st.suspended && !matches!(data.state, JobState::Running | JobState::AboutToRun) {
                return Ok(true);
            }
            if data.state == JobState::Running && data.thread == Some(me) {
                return Err(JobsError::IllegalState(format!("{job} cannot join itself")));
            }
            data.completions
        };

        let interval = self.inner.config.max_wait_interval();
        let core = job.core();
        loop {
            {
                let mut data = core.data.lock();
                if data.completions != target {
                    return Ok(true);
                }
                let Some(wait) = slice(deadline, interval) else {
                    return Ok(false);
                };
                core.changed.wait_for(&mut data, wait);
                if data.completions != target {
                    return Ok(true);
                }
            }
            if is_canceled(monitor) {
                debug!(job = %job, "join canceled");
                return Err(JobsError::Canceled);
            }
        }
    }

    /// Block until no job of `family` (any job for `None`) is waiting,
    /// sleeping or running. Jobs scheduled into the family meanwhile are
    /// waited for too. Progress is reported to `monitor` as jobs finish.
    pub fn join_family(
        &self,
        family: Option<&str>,
        timeout: Option<Duration>,
        monitor: Option<&Arc<dyn ProgressMonitor>>,
    ) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let current = self.current_job();
        let interval = self.inner.config.max_wait_interval();

        let first = pending_family(&self.inner.state.lock(), family, current.as_ref());
        if first.is_empty() {
            return Ok(true);
        }
        let mut seen: BTreeSet<JobId> = first.into_iter().collect();
        let mut reported = 0;
        if let Some(m) = monitor {
            m.begin_task(&format!("waiting for jobs of {}", family.unwrap_or("any family")), Some(seen.len() as u32));
            m.set_blocked(&format!("{} jobs still running", seen.len()));
        }

        let outcome = loop {
            let (remaining, completions) = {
                let st = self.inner.state.lock();
                (pending_family(&st, family, current.as_ref()), st.completions)
            };
            seen.extend(remaining.iter().copied());
            let finished = seen.len() - remaining.len();
            if finished > reported {
                if let Some(m) = monitor {
                    m.worked((finished - reported) as u32);
                }
                reported = finished;
            }
            if remaining.is_empty() {
                break Ok(true);
            }
            if is_canceled(monitor) {
                break Err(JobsError::Canceled);
            }
            let Some(wait) = slice(deadline, interval) else {
                break Ok(false);
            };
            let mut st = self.inner.state.lock();
            if st.completions == completions {
                self.inner.job_done.wait_for(&mut st, wait);
            }
        };

        if let Some(m) = monitor {
            m.clear_blocked();
            m.done();
        }
        outcome
    }

    /// Cancel every job in `group`. The group completes once its running
    /// jobs have stopped, with a CANCEL entry in its result.
    pub fn cancel_group(&self, group: &JobGroup) {
        self.inner.cancel_group(group, false);
    }

    /// Block until `group` has no active jobs left and has recorded its
    /// result.
    pub fn join_group(
        &self,
        group: &JobGroup,
        timeout: Option<Duration>,
        monitor: Option<&Arc<dyn ProgressMonitor>>,
    ) -> Result<bool> {
        if let Some(current) = self.current_job() {
            if current.group().as_ref() == Some(group) {
                return Err(JobsError::IllegalState(format!(
                    "{current} cannot join its own group {}",
                    group.name()
                )));
            }
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let interval = self.inner.config.max_wait_interval();
        loop {
            {
                let mut data = group.data();
                if data.state == GroupState::None {
                    return Ok(true);
                }
                let Some(wait) = slice(deadline, interval) else {
                    return Ok(false);
                };
                group.changed().wait_for(&mut data, wait);
                if data.state == GroupState::None {
                    return Ok(true);
                }
            }
            if is_canceled(monitor) {
                return Err(JobsError::Canceled);
            }
        }
    }
}

/// Jobs a family join still waits for. While scheduling is suspended only
/// running jobs count, since nothing else will start.
fn pending_family(st: &ManagerState, family: Option<&str>, current: Option<&Job>) -> Vec<JobId> {
    st.units
        .values()
        .filter_map(|unit| match unit {
            Unit::Job(job) if job.belongs_to(family) && Some(job) != current => Some(job),
            _ => None,
        })
        .filter(|job| !st.suspended || matches!(job.internal_state(), JobState::Running | JobState::AboutToRun))
        .map(Job::id)
        .collect()
}
