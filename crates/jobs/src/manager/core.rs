use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::info;

use crate::config::JobsConfig;
use crate::error::Result;
use crate::group::{GroupState, JobGroup};
use crate::implicit::{ImplicitJobs, ThreadJob};
use crate::job::{Job, JobCore, JobId, JobState};
use crate::listener::{self, JobChangeEvent, JobChangeListener, JobEventKind, ListenerList};
use crate::lock::{LockManager, OrderedLock};
use crate::metrics::JobMetrics;
use crate::monitor::{NullProgressMonitor, ProgressMonitor, ProgressProvider};
use crate::queue::{BlockedChains, JobQueue, QueueEntry};
use crate::rule::{rules_conflict, Rule};
use crate::status::JobStatus;
use crate::worker::WorkerPool;

/// Anything the manager schedules: a real job or a thread holding a rule
/// through `begin_rule`.
#[derive(Clone)]
pub(crate) enum Unit {
    Job(Job),
    Implicit(Arc<ThreadJob>),
}

impl Unit {
    pub(crate) fn core(&self) -> &JobCore {
        match self {
            Unit::Job(job) => job.core(),
            Unit::Implicit(tj) => tj.core(),
        }
    }

    pub(crate) fn id(&self) -> JobId {
        self.core().id
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Unit::Job(job) => job.to_string(),
            Unit::Implicit(tj) => format!("rule {:?} held by {:?}", tj.rule(), tj.core().thread()),
        }
    }
}

/// Everything guarded by the manager lock.
pub(crate) struct ManagerState {
    /// Every unit not in state `None`.
    pub(crate) units: HashMap<JobId, Unit>,
    pub(crate) waiting: JobQueue,
    /// Ordered by wake-up time.
    pub(crate) sleeping: JobQueue,
    /// `AboutToRun` and `Running` units.
    pub(crate) running: BTreeSet<JobId>,
    pub(crate) blocked: BlockedChains,
    /// Threads blocked in `begin_rule`, in arrival order.
    pub(crate) waiting_threads: JobQueue,
    pub(crate) waiting_thread_jobs: HashMap<JobId, Arc<ThreadJob>>,
    next_wait_stamp: u64,
    /// Bumped every time any unit returns to `None`.
    pub(crate) completions: u64,
    pub(crate) suspended: bool,
    pub(crate) active: bool,
    pub(crate) progress_provider: Option<Arc<dyn ProgressProvider>>,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            units: HashMap::new(),
            waiting: JobQueue::new(false, true),
            sleeping: JobQueue::new(false, true),
            running: BTreeSet::new(),
            blocked: BlockedChains::default(),
            waiting_threads: JobQueue::new(false, false),
            waiting_thread_jobs: HashMap::new(),
            next_wait_stamp: 1,
            completions: 0,
            suspended: false,
            active: true,
            progress_provider: None,
        }
    }

    pub(crate) fn next_wait_stamp(&mut self) -> u64 {
        let stamp = self.next_wait_stamp;
        self.next_wait_stamp += 1;
        stamp
    }

    pub(crate) fn running_jobs(&self) -> Vec<Job> {
        self.running
            .iter()
            .filter_map(|id| match self.units.get(id) {
                Some(Unit::Job(job)) => Some(job.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Listener notifications and pool wake-ups collected under the manager
/// lock and delivered by [`ManagerInner::flush`] once it is released.
#[derive(Default)]
pub(crate) struct Deferred {
    pub(crate) events: Vec<JobChangeEvent>,
    pub(crate) wake_pool: bool,
}

impl Deferred {
    pub(crate) fn event(event: JobChangeEvent) -> Self {
        Self {
            events: vec![event],
            wake_pool: false,
        }
    }
}

pub(crate) struct ManagerInner {
    pub(crate) config: JobsConfig,
    pub(crate) state: Mutex<ManagerState>,
    /// Signalled whenever a unit returns to `None`.
    pub(crate) job_done: Condvar,
    pub(crate) listeners: ListenerList,
    pub(crate) lock_manager: Arc<LockManager>,
    pub(crate) implicit: ImplicitJobs,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) metrics: RwLock<JobMetrics>,
    epoch: Instant,
    weak_self: Weak<ManagerInner>,
}

/// Schedules jobs onto an elastic worker pool and arbitrates scheduling
/// rules between jobs and threads.
///
/// Cheap to clone; clones share one engine. The engine shuts its workers
/// down once the last handle is dropped.
#[derive(Clone)]
pub struct JobManager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl JobManager {
    pub fn new(config: JobsConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(WorkerPool::new(&config));
        let lock_manager = Arc::new(LockManager::new(config.deadlock_detection));
        info!(
            min_threads = config.min_threads,
            max_threads = config.max_threads,
            deadlock_detection = config.deadlock_detection,
            "job manager started"
        );
        let inner = Arc::new_cyclic(|weak_self| ManagerInner {
            config,
            state: Mutex::new(ManagerState::new()),
            job_done: Condvar::new(),
            listeners: ListenerList::default(),
            lock_manager,
            implicit: ImplicitJobs::default(),
            pool,
            metrics: RwLock::new(JobMetrics::default()),
            epoch: Instant::now(),
            weak_self: Weak::clone(weak_self),
        });
        Ok(Self { inner })
    }

    /// Manager with configuration from `JOBS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(JobsConfig::from_env()?)
    }

    pub fn config(&self) -> &JobsConfig {
        &self.inner.config
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.inner.lock_manager
    }

    /// A new [`OrderedLock`] that takes part in deadlock detection.
    pub fn new_lock(&self) -> OrderedLock {
        OrderedLock::new(Arc::clone(&self.inner.lock_manager))
    }

    /// Snapshot of the engine counters.
    pub fn metrics(&self) -> JobMetrics {
        let mut metrics = self.inner.metrics.read().clone();
        metrics.deadlocks_resolved = self.inner.lock_manager.deadlocks_resolved();
        metrics.workers_spawned = self.inner.pool.spawned();
        metrics.workers_retired = self.inner.pool.retired();
        metrics
    }

    pub fn add_job_change_listener(&self, listener: Arc<dyn JobChangeListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_job_change_listener(&self, listener: &Arc<dyn JobChangeListener>) {
        self.inner.listeners.remove(listener);
    }

    pub fn set_progress_provider(&self, provider: Option<Arc<dyn ProgressProvider>>) {
        self.inner.state.lock().progress_provider = provider;
    }

    /// A monitor for `job` from the installed provider, or a
    /// [`NullProgressMonitor`] when there is none.
    pub fn create_monitor(&self, job: &Job) -> Arc<dyn ProgressMonitor> {
        self.inner.create_monitor(job)
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspended
    }

    /// True when nothing is running or waiting to run.
    pub fn is_idle(&self) -> bool {
        let st = self.inner.state.lock();
        st.running.is_empty() && st.waiting.is_empty()
    }

    /// The job the calling thread is running, if it is a worker.
    pub fn current_job(&self) -> Option<Job> {
        self.inner.current_job()
    }

    /// The rule in effect on the calling thread: its outermost `begin_rule`
    /// scope, else the rule of the job it is running.
    pub fn current_rule(&self) -> Option<Rule> {
        let me = thread::current().id();
        if let Some(rule) = self.inner.implicit.thread_job(me).and_then(|tj| tj.current_rule()) {
            return Some(rule);
        }
        self.current_job().and_then(|job| job.rule())
    }

    /// Jobs of `family` (every job for `None`) that are waiting, sleeping
    /// or running.
    pub fn find(&self, family: Option<&str>) -> Vec<Job> {
        let st = self.inner.state.lock();
        let mut jobs: Vec<Job> = st
            .units
            .values()
            .filter_map(|unit| match unit {
                Unit::Job(job) if job.belongs_to(family) => Some(job.clone()),
                _ => None,
            })
            .collect();
        jobs.sort_by_key(Job::id);
        jobs
    }

    /// True if the running `job` holds up a non-system job or thread of the
    /// same or higher priority.
    pub fn is_blocking(&self, job: &Job) -> bool {
        let st = self.inner.state.lock();
        if job.internal_state() != JobState::Running {
            return false;
        }
        let priority = job.priority();
        let blocks_job = st.blocked.chain(job.id()).iter().any(|id| match st.units.get(id) {
            Some(Unit::Job(waiting)) => waiting.priority() <= priority && !waiting.is_system(),
            _ => false,
        });
        if blocks_job {
            return true;
        }
        let rule = job.rule();
        st.waiting_threads.iter().any(|entry| {
            st.waiting_thread_jobs
                .get(&entry.id)
                .is_some_and(|tj| !tj.is_system() && rules_conflict(rule.as_ref(), Some(tj.rule())))
        })
    }

    pub fn suspend_scheduling(&self) {
        self.inner.state.lock().suspended = true;
        info!("job scheduling suspended");
    }

    pub fn resume_scheduling(&self) {
        self.inner.state.lock().suspended = false;
        info!("job scheduling resumed");
        self.inner.flush(Deferred {
            events: Vec::new(),
            wake_pool: true,
        });
    }
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("JobManager")
            .field("active", &st.active)
            .field("suspended", &st.suspended)
            .field("waiting", &st.waiting.len())
            .field("sleeping", &st.sleeping.len())
            .field("running", &st.running.len())
            .finish()
    }
}

impl ManagerInner {
    pub(crate) fn now_ms(&self) -> i64 {
        i64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub(crate) fn current_job(&self) -> Option<Job> {
        let st = self.state.lock();
        self.current_job_locked(&st)
    }

    pub(crate) fn current_job_locked(&self, st: &ManagerState) -> Option<Job> {
        let me = thread::current().id();
        st.running_jobs().into_iter().find(|job| job.thread() == Some(me))
    }

    pub(crate) fn create_monitor(&self, job: &Job) -> Arc<dyn ProgressMonitor> {
        let provider = self.state.lock().progress_provider.clone();
        let group = job.core().data.lock().progress_group.clone();
        match (provider, group) {
            (Some(provider), Some((group_monitor, ticks))) => provider.create_group_monitor(job, &group_monitor, ticks),
            (Some(provider), None) => provider.create_monitor(job),
            (None, _) => NullProgressMonitor::shared(),
        }
    }

    /// Monitor installed for the current run of `job`.
    pub(crate) fn job_monitor(&self, job: &Job) -> Arc<dyn ProgressMonitor> {
        job.core()
            .data
            .lock()
            .monitor
            .clone()
            .unwrap_or_else(NullProgressMonitor::shared)
    }

    pub(crate) fn set_unit_thread(&self, core: &JobCore, thread: Option<ThreadId>) {
        let _st = self.state.lock();
        core.data.lock().thread = thread;
        core.changed.notify_all();
    }

    /// Move `unit` to `new`, keeping every container, the blocked chains
    /// and the unit's group consistent. Callers set `start_time` and
    /// `wait_stamp` before moving a unit into a queue.
    pub(crate) fn change_state(&self, st: &mut ManagerState, unit: &Unit, new: JobState, d: &mut Deferred) {
        let core = unit.core();
        let id = core.id;
        let old = core.state();
        match old {
            JobState::Waiting => {
                st.waiting.remove(id);
            }
            JobState::Sleeping => {
                st.sleeping.remove(id);
            }
            JobState::Blocked => {
                st.blocked.remove(id);
            }
            JobState::AboutToRun | JobState::Running => {
                st.running.remove(&id);
            }
            JobState::None | JobState::AboutToSchedule | JobState::Yielding => {}
        }

        let (entry, group, result) = {
            let mut data = core.data.lock();
            data.state = new;
            match new {
                JobState::None => {
                    data.start_time = None;
                    data.wait_stamp = None;
                    data.run_canceled = false;
                    data.completions += 1;
                }
                JobState::AboutToRun | JobState::Running => {
                    data.start_time = None;
                    data.wait_stamp = None;
                }
                _ => {}
            }
            if new == JobState::AboutToRun {
                data.reschedule_delay = None;
            }
            core.changed.notify_all();
            let entry = QueueEntry {
                id,
                start_time: data.start_time.unwrap_or(0),
                wait_stamp: data.wait_stamp,
                rule: data.rule.clone(),
            };
            (entry, data.group.clone(), data.result.clone())
        };

        match new {
            JobState::Waiting => st.waiting.enqueue(entry),
            JobState::Sleeping => st.sleeping.enqueue(entry),
            JobState::AboutToRun | JobState::Running => {
                st.running.insert(id);
            }
            _ => {}
        }

        if new == JobState::None {
            st.units.remove(&id);
            st.completions += 1;
            self.job_done.notify_all();
        } else if old == JobState::None {
            st.units.insert(id, unit.clone());
        }

        let was_running = matches!(old, JobState::AboutToRun | JobState::Running);
        let is_running = matches!(new, JobState::AboutToRun | JobState::Running);
        if was_running && !is_running {
            let chain = st.blocked.take_chain(id);
            if !chain.is_empty() {
                d.wake_pool = true;
            }
            for blocked in chain {
                if let Some(unit) = st.units.get(&blocked).cloned() {
                    self.change_state(st, &unit, JobState::Waiting, d);
                }
            }
        }

        if let (Unit::Job(job), Some(group)) = (unit, group) {
            let (old_visible, new_visible) = (old.visible(), new.visible());
            if old_visible != new_visible {
                let seeded = old_visible == JobState::None && self.is_running_group_job(st, &group);
                let result = if old_visible == JobState::Running && new_visible == JobState::None {
                    result
                } else {
                    None
                };
                group.job_state_changed(job, old_visible, new_visible, result.as_ref(), seeded);
            }
        }
    }

    /// True if the calling thread is running a job of `group`.
    fn is_running_group_job(&self, st: &ManagerState, group: &JobGroup) -> bool {
        self.current_job_locked(st)
            .is_some_and(|job| job.group().as_ref() == Some(group))
    }

    /// The running unit (or a unit already blocked behind one) whose rule
    /// conflicts with `rule`.
    pub(crate) fn find_blocking(&self, st: &ManagerState, rule: Option<&Rule>) -> Option<Unit> {
        let rule = rule?;
        let mut any_blocked = false;
        for id in &st.running {
            let Some(unit) = st.units.get(id) else { continue };
            if rules_conflict(Some(rule), unit.core().rule().as_ref()) {
                return Some(unit.clone());
            }
            any_blocked |= !st.blocked.chain(*id).is_empty();
        }
        if !any_blocked {
            return None;
        }
        st.running
            .iter()
            .flat_map(|id| st.blocked.chain(*id))
            .filter_map(|id| st.units.get(id))
            .find(|unit| rules_conflict(Some(rule), unit.core().rule().as_ref()))
            .cloned()
    }

    /// Deliver what was deferred while the manager lock was held. Must be
    /// called without holding any engine lock.
    pub(crate) fn flush(&self, d: Deferred) {
        if !d.events.is_empty() {
            let global = self.listeners.snapshot();
            for mut event in d.events {
                if event.kind == JobEventKind::Done {
                    if let Some(group) = event.job.group() {
                        event.group_result = self.update_group(&group, &event);
                    }
                }
                let panicked = listener::deliver(&global, &event);
                if panicked > 0 {
                    self.metrics.write().listener_panics += panicked as u64;
                }
            }
        }
        if d.wake_pool {
            self.pool.job_queued(&self.weak_self);
        }
    }

    /// Group bookkeeping after one of its jobs finished. Returns the group
    /// result if this completion completed the group.
    fn update_group(&self, group: &JobGroup, event: &JobChangeEvent) -> Option<JobStatus> {
        let last = event.result.clone().unwrap_or_else(JobStatus::ok);
        let (complete, active, failed, canceled, results, user_canceled) = {
            let _st = self.state.lock();
            let data = group.data();
            (
                data.is_complete(),
                data.state == GroupState::Active,
                data.failed,
                data.canceled,
                data.results.clone(),
                data.state == GroupState::Canceling && !data.canceling_due_to_error,
            )
        };

        if !complete {
            if active && group.should_cancel(&last, failed, canceled) {
                info!(group = group.name(), failed, canceled, "canceling group after job failure");
                self.cancel_group(group, true);
            }
            return None;
        }

        let mut result = group.compute_result(&results);
        if user_canceled {
            result.add(JobStatus::cancel());
        }
        let _st = self.state.lock();
        let still_complete = group.data().is_complete();
        if !still_complete {
            return None;
        }
        group.end(result.clone());
        info!(group = group.name(), status = %result, "job group completed");
        Some(result)
    }

    /// Cancel every job of `group` and stop it from starting new ones.
    pub(crate) fn cancel_group(&self, group: &JobGroup, due_to_error: bool) {
        let Some(jobs) = group.begin_cancel(due_to_error) else {
            return;
        };
        for job in jobs {
            self.cancel(&job);
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}
