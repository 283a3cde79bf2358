use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::debug;

use super::core::{Deferred, JobManager, Unit};
use crate::error::{JobsError, Result};
use crate::implicit::ThreadJob;
use crate::job::{Job, JobState};
use crate::monitor::{ProgressMonitor, UncancelableMonitor};
use crate::rule::{rules_conflict, validate_rule, Rule};

/// Who got to run while a job yielded its rule.
#[derive(Debug, Clone)]
pub enum YieldTarget {
    Job(Job),
    /// A thread that was waiting in `begin_rule`.
    ImplicitThread(ThreadId),
}

// ── Implicit rule scopes ────────────────────────────────────────────

impl JobManager {
    /// Hold `rule` on the calling thread until the matching
    /// [`end_rule`](Self::end_rule), blocking while a conflicting job or
    /// thread holds it. Scopes nest; a nested rule must be contained in the
    /// outermost one. Inside a job with a rule, that rule is reused.
    pub fn begin_rule(&self, rule: Option<&Rule>, monitor: Option<&Arc<dyn ProgressMonitor>>) -> Result<()> {
        if let Some(rule) = rule {
            validate_rule(rule.as_ref())?;
        }
        self.inner.implicit.begin(&self.inner, rule.cloned(), monitor, false)
    }

    /// Close the innermost scope opened by [`begin_rule`](Self::begin_rule).
    pub fn end_rule(&self, rule: Option<&Rule>) -> Result<()> {
        self.inner.implicit.end(&self.inner, rule, false)
    }

    /// Like `begin_rule`, but rules contained in `rule` that are begun
    /// later on any thread are treated as already held until
    /// [`resume_rule`](Self::resume_rule).
    pub fn suspend_rule(&self, rule: &Rule, monitor: Option<&Arc<dyn ProgressMonitor>>) -> Result<()> {
        validate_rule(rule.as_ref())?;
        self.inner.implicit.begin(&self.inner, Some(Arc::clone(rule)), monitor, true)
    }

    pub fn resume_rule(&self, rule: &Rule) -> Result<()> {
        self.inner.implicit.end(&self.inner, Some(rule), true)
    }

    /// Move the calling thread's outermost scope on `rule` to `destination`
    /// without releasing it. The destination thread must end it.
    pub fn transfer_rule(&self, rule: &Rule, destination: ThreadId) -> Result<()> {
        self.inner.implicit.transfer(&self.inner, rule, destination)
    }

    /// Let the first job or thread blocked on `job`'s rule run, then take
    /// the rule back. Must be called from inside `job`. Returns who ran, or
    /// `None` when nothing was waiting.
    pub fn yield_rule(&self, job: &Job, monitor: Option<&Arc<dyn ProgressMonitor>>) -> Result<Option<YieldTarget>> {
        let me = thread::current().id();
        {
            let data = job.core().data.lock();
            if data.state != JobState::Running || data.thread != Some(me) {
                return Err(JobsError::IllegalState(format!(
                    "yield_rule must be called by {job} while it runs"
                )));
            }
        }
        let Some(rule) = job.rule() else {
            return Ok(None);
        };

        let mut d = Deferred::default();
        let unblocked = {
            let mut st = self.inner.state.lock();
            let behind = st.blocked.first_behind(job.id()).and_then(|id| st.units.get(&id).cloned());
            let unblocked = behind.or_else(|| {
                st.waiting_threads
                    .iter()
                    .filter_map(|entry| st.waiting_thread_jobs.get(&entry.id))
                    .find(|tj| rules_conflict(Some(&rule), Some(tj.rule())))
                    .map(|tj| Unit::Implicit(Arc::clone(tj)))
            });
            let Some(unblocked) = unblocked else {
                return Ok(None);
            };
            job.core().data.lock().thread = None;
            self.inner.change_state(&mut st, &Unit::Job(job.clone()), JobState::Yielding, &mut d);
            unblocked
        };
        self.inner.lock_manager.remove_rule_thread(me, &rule);
        self.inner.flush(d);

        let target = match &unblocked {
            Unit::Job(other) => Some(YieldTarget::Job(other.clone())),
            Unit::Implicit(tj) => tj.core().thread().map(YieldTarget::ImplicitThread),
        };
        debug!(job = %job, to = %unblocked.describe(), "job yielded its rule");
        if let Some(m) = monitor {
            m.set_blocked(&format!("yielded to {}", unblocked.describe()));
        }
        self.wait_until_started(&unblocked);

        // Take the rule back like a thread would, so the wait is visible to
        // deadlock detection. A pending cancel of the job must not abort it.
        let proxy = ThreadJob::new(Arc::clone(&rule), Some(job.clone()), true, me);
        if self.inner.run_now(&proxy, false).is_some() {
            let uncancelable: Arc<dyn ProgressMonitor> = Arc::new(UncancelableMonitor);
            self.inner.implicit.join_run(&self.inner, &proxy, Some(&uncancelable))?;
        } else {
            self.inner.lock_manager.add_rule_thread(me, &rule);
        }

        let mut d = Deferred::default();
        {
            let mut st = self.inner.state.lock();
            self.inner.change_state(&mut st, &Unit::Implicit(Arc::clone(&proxy)), JobState::None, &mut d);
            job.core().data.lock().thread = Some(me);
            self.inner.change_state(&mut st, &Unit::Job(job.clone()), JobState::Running, &mut d);
        }
        self.inner.flush(d);
        if let Some(m) = monitor {
            m.clear_blocked();
        }
        debug!(job = %job, "job resumed after yield");
        Ok(target)
    }

    /// Wait until a unit released by a yield is no longer queued.
    fn wait_until_started(&self, unit: &Unit) {
        let interval = self.inner.config.max_wait_interval();
        let core = unit.core();
        let mut data = core.data.lock();
        loop {
            let queued = match unit {
                Unit::Job(_) => matches!(
                    data.state,
                    JobState::Waiting | JobState::Blocked | JobState::AboutToSchedule
                ),
                Unit::Implicit(_) => data.is_waiting,
            };
            if !queued {
                return;
            }
            core.changed.wait_for(&mut data, interval);
        }
    }
}
