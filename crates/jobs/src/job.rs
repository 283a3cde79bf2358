use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::Result;
use crate::group::JobGroup;
use crate::listener::{panic_message, JobChangeListener};
use crate::manager::{JobManager, YieldTarget};
use crate::monitor::ProgressMonitor;
use crate::rule::Rule;
use crate::status::JobStatus;

/// Stable handle of a schedulable unit inside the manager.
pub type JobId = u64;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_job_id() -> JobId {
    NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)
}

/// Job priority, fastest to slowest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Interactive,
    Short,
    #[default]
    Long,
    Build,
    Decorate,
}

impl JobPriority {
    /// Minimum latency a waiting job of this priority accepts. Queue order
    /// is by `schedule time + min_latency`, so priorities age into each other.
    pub fn min_latency(self) -> Duration {
        match self {
            JobPriority::Interactive => Duration::ZERO,
            JobPriority::Short => Duration::from_millis(50),
            JobPriority::Long => Duration::from_millis(100),
            JobPriority::Build => Duration::from_millis(500),
            JobPriority::Decorate => Duration::from_millis(1000),
        }
    }
}

/// Scheduling state of a job.
///
/// Only `None`, `Waiting`, `Sleeping` and `Running` are visible through
/// [`Job::state`]; the other states are transitional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    None,
    AboutToSchedule,
    Waiting,
    Sleeping,
    Blocked,
    AboutToRun,
    Running,
    Yielding,
}

impl JobState {
    /// The state as clients see it.
    pub fn visible(self) -> JobState {
        match self {
            JobState::AboutToSchedule | JobState::Blocked | JobState::Yielding => JobState::Waiting,
            JobState::AboutToRun => JobState::Running,
            other => other,
        }
    }
}

/// Mutable per-unit scheduling data, guarded by the unit's own lock and only
/// written while the manager lock is held.
pub(crate) struct JobData {
    pub(crate) state: JobState,
    pub(crate) priority: JobPriority,
    pub(crate) rule: Option<Rule>,
    pub(crate) group: Option<JobGroup>,
    /// Absolute start (waiting) or wake-up (sleeping) time in manager millis.
    pub(crate) start_time: Option<i64>,
    pub(crate) wait_stamp: Option<u64>,
    pub(crate) thread: Option<ThreadId>,
    pub(crate) result: Option<JobStatus>,
    pub(crate) monitor: Option<Arc<dyn ProgressMonitor>>,
    pub(crate) about_to_run_canceled: bool,
    pub(crate) run_canceled: bool,
    /// Delay requested by `schedule` while the job was running.
    pub(crate) reschedule_delay: Option<u64>,
    pub(crate) listeners: Vec<Arc<dyn JobChangeListener>>,
    /// Bumped every time the unit returns to `None` after being scheduled.
    pub(crate) completions: u64,
    /// Implicit units only: registered as a waiting thread job.
    pub(crate) is_waiting: bool,
    pub(crate) progress_group: Option<(Arc<dyn ProgressMonitor>, u32)>,
}

pub(crate) struct JobCore {
    pub(crate) id: JobId,
    pub(crate) data: Mutex<JobData>,
    pub(crate) changed: Condvar,
}

impl JobCore {
    pub(crate) fn new(priority: JobPriority, rule: Option<Rule>, group: Option<JobGroup>) -> Self {
        Self {
            id: next_job_id(),
            data: Mutex::new(JobData {
                state: JobState::None,
                priority,
                rule,
                group,
                start_time: None,
                wait_stamp: None,
                thread: None,
                result: None,
                monitor: None,
                about_to_run_canceled: false,
                run_canceled: false,
                reschedule_delay: None,
                listeners: Vec::new(),
                completions: 0,
                is_waiting: false,
                progress_group: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> JobState {
        self.data.lock().state
    }

    pub(crate) fn rule(&self) -> Option<Rule> {
        self.data.lock().rule.clone()
    }

    pub(crate) fn thread(&self) -> Option<ThreadId> {
        self.data.lock().thread
    }
}

type JobBody = Box<dyn Fn(&JobContext<'_>) -> JobStatus + Send + Sync>;
type JobPredicate = Box<dyn Fn(&Job) -> bool + Send + Sync>;
type JobHook = Box<dyn Fn(&Job) + Send + Sync>;

struct JobInner {
    core: JobCore,
    name: String,
    family: Option<String>,
    system: bool,
    user: bool,
    body: JobBody,
    should_run: Option<JobPredicate>,
    should_schedule: Option<JobPredicate>,
    on_canceling: Option<JobHook>,
}

/// A unit of schedulable work. Cheap to clone; clones refer to the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&JobContext<'_>) -> JobStatus + Send + Sync + 'static,
    {
        JobBuilder::new(name).build(body)
    }

    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder::new(name)
    }

    pub fn id(&self) -> JobId {
        self.inner.core.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn family(&self) -> Option<&str> {
        self.inner.family.as_deref()
    }

    /// `None` matches every job.
    pub fn belongs_to(&self, family: Option<&str>) -> bool {
        match family {
            None => true,
            Some(f) => self.inner.family.as_deref() == Some(f),
        }
    }

    /// System jobs are internal housekeeping and never count as blocking.
    pub fn is_system(&self) -> bool {
        self.inner.system
    }

    /// User jobs were initiated directly by a user action.
    pub fn is_user(&self) -> bool {
        self.inner.user
    }

    pub fn state(&self) -> JobState {
        self.inner.core.state().visible()
    }

    pub fn priority(&self) -> JobPriority {
        self.inner.core.data.lock().priority
    }

    pub fn rule(&self) -> Option<Rule> {
        self.inner.core.rule()
    }

    pub fn group(&self) -> Option<JobGroup> {
        self.inner.core.data.lock().group.clone()
    }

    /// Result of the most recent run, `None` before the first completion.
    pub fn result(&self) -> Option<JobStatus> {
        self.inner.core.data.lock().result.clone()
    }

    /// Thread currently running this job.
    pub fn thread(&self) -> Option<ThreadId> {
        self.inner.core.thread()
    }

    pub fn add_job_change_listener(&self, listener: Arc<dyn JobChangeListener>) {
        self.inner.core.data.lock().listeners.push(listener);
    }

    pub fn remove_job_change_listener(&self, listener: &Arc<dyn JobChangeListener>) {
        self.inner
            .core
            .data
            .lock()
            .listeners
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Report this job's progress into `group_monitor`, as `ticks` units of
    /// its work. Takes effect the next time the job starts.
    pub fn set_progress_group(&self, group_monitor: Arc<dyn ProgressMonitor>, ticks: u32) {
        self.inner.core.data.lock().progress_group = Some((group_monitor, ticks));
    }

    pub(crate) fn core(&self) -> &JobCore {
        &self.inner.core
    }

    pub(crate) fn internal_state(&self) -> JobState {
        self.inner.core.state()
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn JobChangeListener>> {
        self.inner.core.data.lock().listeners.clone()
    }

    pub(crate) fn run(&self, ctx: &JobContext<'_>) -> JobStatus {
        (self.inner.body)(ctx)
    }

    pub(crate) fn should_run(&self) -> bool {
        self.veto("should_run", self.inner.should_run.as_ref())
    }

    pub(crate) fn should_schedule(&self) -> bool {
        self.veto("should_schedule", self.inner.should_schedule.as_ref())
    }

    /// A panicking predicate vetoes.
    fn veto(&self, hook: &str, predicate: Option<&JobPredicate>) -> bool {
        let Some(predicate) = predicate else {
            return true;
        };
        panic::catch_unwind(AssertUnwindSafe(|| predicate(self))).unwrap_or_else(|payload| {
            error!(job = %self, hook, panic = %panic_message(payload.as_ref()), "job predicate panicked");
            false
        })
    }

    pub(crate) fn canceling(&self) {
        if let Some(hook) = &self.inner.on_canceling {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(self))) {
                error!(job = %self, panic = %panic_message(payload.as_ref()), "on_canceling hook panicked");
            }
        }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Job {}

impl Hash for Job {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("name", &self.inner.name)
            .finish()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.inner.name, self.id())
    }
}

/// Fluent constructor for [`Job`].
pub struct JobBuilder {
    name: String,
    priority: JobPriority,
    rule: Option<Rule>,
    group: Option<JobGroup>,
    family: Option<String>,
    system: bool,
    user: bool,
    should_run: Option<JobPredicate>,
    should_schedule: Option<JobPredicate>,
    on_canceling: Option<JobHook>,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: JobPriority::default(),
            rule: None,
            group: None,
            family: None,
            system: false,
            user: false,
            should_run: None,
            should_schedule: None,
            on_canceling: None,
        }
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// The rule is validated when the job is first scheduled.
    pub fn rule(mut self, rule: Rule) -> Self {
        self.rule = Some(rule);
        self
    }

    pub fn group(mut self, group: &JobGroup) -> Self {
        self.group = Some(group.clone());
        self
    }

    pub fn family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn system(mut self, system: bool) -> Self {
        self.system = system;
        self
    }

    pub fn user(mut self, user: bool) -> Self {
        self.user = user;
        self
    }

    /// Veto consulted right before the job would start.
    pub fn should_run(mut self, f: impl Fn(&Job) -> bool + Send + Sync + 'static) -> Self {
        self.should_run = Some(Box::new(f));
        self
    }

    /// Veto consulted on every schedule and reschedule.
    pub fn should_schedule(mut self, f: impl Fn(&Job) -> bool + Send + Sync + 'static) -> Self {
        self.should_schedule = Some(Box::new(f));
        self
    }

    /// Called when a running job is asked to cancel.
    pub fn on_canceling(mut self, f: impl Fn(&Job) + Send + Sync + 'static) -> Self {
        self.on_canceling = Some(Box::new(f));
        self
    }

    pub fn build<F>(self, body: F) -> Job
    where
        F: Fn(&JobContext<'_>) -> JobStatus + Send + Sync + 'static,
    {
        Job {
            inner: Arc::new(JobInner {
                core: JobCore::new(self.priority, self.rule, self.group),
                name: self.name,
                family: self.family,
                system: self.system,
                user: self.user,
                body: Box::new(body),
                should_run: self.should_run,
                should_schedule: self.should_schedule,
                on_canceling: self.on_canceling,
            }),
        }
    }
}

/// What a running job body sees of the engine.
pub struct JobContext<'a> {
    manager: &'a JobManager,
    job: &'a Job,
    monitor: Arc<dyn ProgressMonitor>,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(manager: &'a JobManager, job: &'a Job, monitor: Arc<dyn ProgressMonitor>) -> Self {
        Self { manager, job, monitor }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn manager(&self) -> &JobManager {
        self.manager
    }

    pub fn monitor(&self) -> &Arc<dyn ProgressMonitor> {
        &self.monitor
    }

    /// Cooperative cancellation check; bodies should poll this.
    pub fn is_canceled(&self) -> bool {
        self.monitor.is_canceled()
    }

    /// Temporarily hand this job's rule to a job it is blocking.
    pub fn yield_rule(&self, monitor: Option<&Arc<dyn ProgressMonitor>>) -> Result<Option<YieldTarget>> {
        self.manager.yield_rule(self.job, monitor)
    }
}
