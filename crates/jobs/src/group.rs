use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::error;

use crate::job::{Job, JobId, JobState};
use crate::listener::panic_message;
use crate::status::{JobStatus, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    /// No active jobs; the last result (if any) is final.
    None,
    Active,
    Canceling,
}

type CancelPolicy = Box<dyn Fn(&JobStatus, usize, usize) -> bool + Send + Sync>;
type ResultPolicy = Box<dyn Fn(&str, &[JobStatus]) -> JobStatus + Send + Sync>;

pub(crate) struct GroupData {
    pub(crate) state: GroupState,
    pub(crate) running: BTreeMap<JobId, Job>,
    pub(crate) others: BTreeMap<JobId, Job>,
    pub(crate) results: Vec<JobStatus>,
    pub(crate) failed: usize,
    pub(crate) canceled: usize,
    pub(crate) seeds_remaining: i64,
    pub(crate) canceling_due_to_error: bool,
    pub(crate) result: Option<JobStatus>,
}

impl GroupData {
    pub(crate) fn active_count(&self) -> usize {
        self.running.len() + self.others.len()
    }

    /// Nothing left to run and every seed job has been scheduled (or the
    /// group is being torn down anyway).
    pub(crate) fn is_complete(&self) -> bool {
        self.state != GroupState::None
            && self.active_count() == 0
            && (self.seeds_remaining <= 0 || self.state == GroupState::Canceling)
    }
}

struct GroupInner {
    name: String,
    max_threads: usize,
    seed_jobs: usize,
    should_cancel: CancelPolicy,
    compute_result: ResultPolicy,
    data: Mutex<GroupData>,
    changed: Condvar,
}

/// A set of related jobs with an optional concurrency cap and a combined
/// result.
///
/// `seed_jobs` is the number of jobs the creating code intends to schedule
/// into the group; the group cannot complete before that many have been
/// scheduled. Jobs scheduled from inside one of the group's own jobs do not
/// count as seeds.
#[derive(Clone)]
pub struct JobGroup {
    inner: Arc<GroupInner>,
}

impl JobGroup {
    /// `max_threads == 0` means unlimited concurrency.
    pub fn new(name: impl Into<String>, max_threads: usize, seed_jobs: usize) -> Self {
        JobGroupBuilder::new(name, max_threads, seed_jobs).build()
    }

    pub fn builder(name: impl Into<String>, max_threads: usize, seed_jobs: usize) -> JobGroupBuilder {
        JobGroupBuilder::new(name, max_threads, seed_jobs)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_threads(&self) -> usize {
        self.inner.max_threads
    }

    pub fn seed_jobs(&self) -> usize {
        self.inner.seed_jobs
    }

    pub fn state(&self) -> GroupState {
        self.inner.data.lock().state
    }

    /// Combined result of the last completed run of the group.
    pub fn result(&self) -> Option<JobStatus> {
        self.inner.data.lock().result.clone()
    }

    /// Jobs of this group that are waiting, sleeping or running.
    pub fn active_jobs(&self) -> Vec<Job> {
        let data = self.inner.data.lock();
        data.running.values().chain(data.others.values()).cloned().collect()
    }

    pub(crate) fn data(&self) -> MutexGuard<'_, GroupData> {
        self.inner.data.lock()
    }

    pub(crate) fn changed(&self) -> &Condvar {
        &self.inner.changed
    }

    /// True if the cap leaves no room for another running job.
    pub(crate) fn at_capacity(&self) -> bool {
        let data = self.inner.data.lock();
        self.inner.max_threads > 0
            && data.state != GroupState::Canceling
            && data.running.len() >= self.inner.max_threads
    }

    pub(crate) fn is_canceling(&self) -> bool {
        self.inner.data.lock().state == GroupState::Canceling
    }

    /// Mirror a visible state change of one of the group's jobs.
    pub(crate) fn job_state_changed(
        &self,
        job: &Job,
        old: JobState,
        new: JobState,
        result: Option<&JobStatus>,
        seeded_from_group: bool,
    ) {
        if old == new {
            return;
        }
        let mut data = self.inner.data.lock();
        match old {
            JobState::None => {}
            JobState::Running => {
                data.running.remove(&job.id());
            }
            _ => {
                data.others.remove(&job.id());
            }
        }
        match new {
            JobState::None => {}
            JobState::Running => {
                data.running.insert(job.id(), job.clone());
            }
            _ => {
                data.others.insert(job.id(), job.clone());
            }
        }

        if old == JobState::None {
            if data.state == GroupState::None {
                data.state = GroupState::Active;
                data.results.clear();
                data.failed = 0;
                data.canceled = 0;
                data.seeds_remaining = self.inner.seed_jobs as i64;
                data.canceling_due_to_error = false;
                data.result = None;
            }
            if !seeded_from_group {
                data.seeds_remaining -= 1;
            }
        }

        if new == JobState::None && old == JobState::Running {
            if let Some(result) = result {
                match result.severity {
                    Severity::Error => data.failed += 1,
                    Severity::Cancel => data.canceled += 1,
                    _ => {}
                }
                data.results.push(result.clone());
            }
        }
        self.inner.changed.notify_all();
    }

    /// Move to CANCELING and return the jobs to cancel. A user cancel
    /// overrides an error-triggered one, never the reverse.
    pub(crate) fn begin_cancel(&self, due_to_error: bool) -> Option<Vec<Job>> {
        let mut data = self.inner.data.lock();
        match data.state {
            GroupState::None => return None,
            GroupState::Canceling => {
                if due_to_error {
                    return None;
                }
                data.canceling_due_to_error = false;
            }
            GroupState::Active => {
                data.state = GroupState::Canceling;
                data.canceling_due_to_error = due_to_error;
            }
        }
        self.inner.changed.notify_all();
        Some(data.running.values().chain(data.others.values()).cloned().collect())
    }

    /// Record the final result and return to NONE.
    pub(crate) fn end(&self, result: JobStatus) {
        let mut data = self.inner.data.lock();
        data.state = GroupState::None;
        data.result = Some(result);
        self.inner.changed.notify_all();
    }

    /// Evaluate the cancel policy; a panicking policy counts as "no".
    pub(crate) fn should_cancel(&self, last: &JobStatus, failed: usize, canceled: usize) -> bool {
        panic::catch_unwind(AssertUnwindSafe(|| (self.inner.should_cancel)(last, failed, canceled)))
            .unwrap_or_else(|payload| {
                error!(group = %self.inner.name, panic = %panic_message(payload.as_ref()), "should_cancel panicked");
                false
            })
    }

    pub(crate) fn compute_result(&self, results: &[JobStatus]) -> JobStatus {
        panic::catch_unwind(AssertUnwindSafe(|| (self.inner.compute_result)(&self.inner.name, results)))
            .unwrap_or_else(|payload| {
                let msg = panic_message(payload.as_ref());
                error!(group = %self.inner.name, panic = %msg, "compute_result panicked");
                JobStatus::error(format!("group result computation failed: {msg}"))
            })
    }
}

impl PartialEq for JobGroup {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for JobGroup {}

impl fmt::Debug for JobGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobGroup")
            .field("name", &self.inner.name)
            .field("max_threads", &self.inner.max_threads)
            .field("seed_jobs", &self.inner.seed_jobs)
            .finish()
    }
}

/// Default roll-up: every result that is not OK.
pub fn default_group_result(name: &str, results: &[JobStatus]) -> JobStatus {
    let important: Vec<JobStatus> = results.iter().filter(|r| !r.is_ok()).cloned().collect();
    JobStatus::multi(name, important)
}

pub struct JobGroupBuilder {
    name: String,
    max_threads: usize,
    seed_jobs: usize,
    should_cancel: CancelPolicy,
    compute_result: ResultPolicy,
}

impl JobGroupBuilder {
    pub fn new(name: impl Into<String>, max_threads: usize, seed_jobs: usize) -> Self {
        Self {
            name: name.into(),
            max_threads,
            seed_jobs,
            should_cancel: Box::new(|_, failed, _| failed > 0),
            compute_result: Box::new(default_group_result),
        }
    }

    /// `(last_result, failed_count, canceled_count) -> cancel the group?`
    pub fn should_cancel(mut self, f: impl Fn(&JobStatus, usize, usize) -> bool + Send + Sync + 'static) -> Self {
        self.should_cancel = Box::new(f);
        self
    }

    /// `(group_name, completed_results) -> group result`
    pub fn compute_result(mut self, f: impl Fn(&str, &[JobStatus]) -> JobStatus + Send + Sync + 'static) -> Self {
        self.compute_result = Box::new(f);
        self
    }

    pub fn build(self) -> JobGroup {
        JobGroup {
            inner: Arc::new(GroupInner {
                name: self.name,
                max_threads: self.max_threads,
                seed_jobs: self.seed_jobs,
                should_cancel: self.should_cancel,
                compute_result: self.compute_result,
                data: Mutex::new(GroupData {
                    state: GroupState::None,
                    running: BTreeMap::new(),
                    others: BTreeMap::new(),
                    results: Vec::new(),
                    failed: 0,
                    canceled: 0,
                    seeds_remaining: 0,
                    canceling_due_to_error: false,
                    result: None,
                }),
                changed: Condvar::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new("member", |_| JobStatus::ok())
    }

    #[test]
    fn first_schedule_activates_and_consumes_seed() {
        let group = JobGroup::new("g", 2, 2);
        let a = job();
        group.job_state_changed(&a, JobState::None, JobState::Waiting, None, false);
        assert_eq!(group.state(), GroupState::Active);
        assert_eq!(group.data().seeds_remaining, 1);
        assert_eq!(group.active_jobs().len(), 1);
        assert!(!group.data().is_complete());
    }

    #[test]
    fn completion_needs_all_seeds() {
        let group = JobGroup::new("g", 0, 2);
        let a = job();
        group.job_state_changed(&a, JobState::None, JobState::Waiting, None, false);
        group.job_state_changed(&a, JobState::Waiting, JobState::Running, None, false);
        group.job_state_changed(&a, JobState::Running, JobState::None, Some(&JobStatus::ok()), false);
        // One seed still outstanding.
        assert!(!group.data().is_complete());

        let b = job();
        group.job_state_changed(&b, JobState::None, JobState::Waiting, None, false);
        group.job_state_changed(&b, JobState::Waiting, JobState::Running, None, false);
        group.job_state_changed(&b, JobState::Running, JobState::None, Some(&JobStatus::error("x")), false);
        let data = group.data();
        assert!(data.is_complete());
        assert_eq!(data.failed, 1);
        assert_eq!(data.results.len(), 2);
    }

    #[test]
    fn jobs_spawned_inside_group_are_not_seeds() {
        let group = JobGroup::new("g", 0, 1);
        let a = job();
        group.job_state_changed(&a, JobState::None, JobState::Waiting, None, false);
        let child = job();
        group.job_state_changed(&child, JobState::None, JobState::Waiting, None, true);
        assert_eq!(group.data().seeds_remaining, 0);
        assert_eq!(group.data().active_count(), 2);
    }

    #[test]
    fn capacity_tracks_running_jobs() {
        let group = JobGroup::new("g", 1, 1);
        let a = job();
        assert!(!group.at_capacity());
        group.job_state_changed(&a, JobState::None, JobState::Waiting, None, false);
        group.job_state_changed(&a, JobState::Waiting, JobState::Running, None, false);
        assert!(group.at_capacity());
        group.begin_cancel(false);
        assert!(!group.at_capacity());
    }

    #[test]
    fn user_cancel_overrides_error_cancel() {
        let group = JobGroup::new("g", 0, 1);
        let a = job();
        group.job_state_changed(&a, JobState::None, JobState::Waiting, None, false);

        let jobs = group.begin_cancel(true).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(group.data().canceling_due_to_error);

        assert!(group.begin_cancel(true).is_none());
        assert!(group.begin_cancel(false).is_some());
        assert!(!group.data().canceling_due_to_error);
        assert_eq!(group.state(), GroupState::Canceling);
    }

    #[test]
    fn cancel_of_idle_group_is_noop() {
        let group = JobGroup::new("g", 0, 1);
        assert!(group.begin_cancel(false).is_none());
    }

    #[test]
    fn default_result_keeps_non_ok() {
        let results = vec![JobStatus::ok(), JobStatus::warning("w"), JobStatus::error("e")];
        let status = default_group_result("g", &results);
        assert_eq!(status.children.len(), 2);
        assert_eq!(status.severity, Severity::Error);
        assert_eq!(status.message, "g");
    }

    #[test]
    fn policies_are_pluggable() {
        let group = JobGroup::builder("g", 0, 1)
            .should_cancel(|_, failed, _| failed >= 2)
            .compute_result(|name, results| JobStatus::info(format!("{name}:{}", results.len())))
            .build();
        assert!(!group.should_cancel(&JobStatus::error("e"), 1, 0));
        assert!(group.should_cancel(&JobStatus::error("e"), 2, 0));
        assert_eq!(group.compute_result(&[JobStatus::ok()]).message, "g:1");
    }

    #[test]
    fn panicking_policy_is_contained() {
        let group = JobGroup::builder("g", 0, 1)
            .should_cancel(|_, _, _| panic!("policy bug"))
            .build();
        assert!(!group.should_cancel(&JobStatus::ok(), 0, 0));
    }
}
