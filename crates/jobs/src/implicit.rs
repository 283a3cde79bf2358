//! Implicit jobs: scheduling rules held by plain threads.
//!
//! `begin_rule`/`end_rule` on a thread create a [`ThreadJob`] that competes
//! with real jobs for the rule. Nested begins only push onto the thread job's
//! rule stack; the rule is released when the outermost scope ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{JobsError, Result};
use crate::job::{Job, JobCore, JobPriority, JobState};
use crate::manager::{Deferred, ManagerInner};
use crate::monitor::{is_canceled, ProgressMonitor};
use crate::rule::{rule_eq, Rule};

/// The unit that represents a thread holding a rule outside any job.
pub(crate) struct ThreadJob {
    core: JobCore,
    /// Outermost rule of the scope; the one contended for.
    rule: Rule,
    /// The job the thread was running when the scope began, if any.
    real_job: Option<Job>,
    /// False when the rule is borrowed from `real_job` or from a suspended
    /// scope, i.e. already held by this thread.
    acquire_rule: bool,
    stack: Mutex<Vec<Option<Rule>>>,
}

impl ThreadJob {
    pub(crate) fn new(rule: Rule, real_job: Option<Job>, acquire_rule: bool, thread: ThreadId) -> Arc<Self> {
        let core = JobCore::new(JobPriority::Interactive, Some(rule.clone()), None);
        core.data.lock().thread = Some(thread);
        Arc::new(Self {
            core,
            rule,
            real_job,
            acquire_rule,
            stack: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn core(&self) -> &JobCore {
        &self.core
    }

    pub(crate) fn rule(&self) -> &Rule {
        &self.rule
    }

    pub(crate) fn acquires_rule(&self) -> bool {
        self.acquire_rule
    }

    pub(crate) fn is_system(&self) -> bool {
        self.real_job.as_ref().is_some_and(Job::is_system)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.core.state() == JobState::Running
    }

    /// Outermost non-empty rule of the scope stack.
    pub(crate) fn current_rule(&self) -> Option<Rule> {
        self.stack.lock().iter().flatten().next().cloned()
    }

    /// The rule is pushed even when rejected, so the caller's matching
    /// `end_rule` still balances.
    fn push(&self, rule: Option<Rule>) -> Result<()> {
        let mut stack = self.stack.lock();
        stack.push(rule.clone());
        match rule {
            Some(r) if !(self.rule.contains(r.as_ref()) && self.rule.is_conflicting(r.as_ref())) => {
                Err(JobsError::IllegalArgument(format!(
                    "nested rule {r:?} is not contained by the outer rule {:?}",
                    self.rule
                )))
            }
            _ => Ok(()),
        }
    }

    /// Returns true when the outermost scope was popped.
    fn pop(&self, rule: Option<&Rule>) -> Result<bool> {
        let mut stack = self.stack.lock();
        match stack.last() {
            Some(top) if rule_eq(top.as_ref(), rule) => {
                stack.pop();
                Ok(stack.is_empty())
            }
            Some(top) => Err(JobsError::IllegalArgument(format!(
                "end_rule({rule:?}) does not match the innermost begin_rule({top:?})"
            ))),
            None => Err(JobsError::IllegalArgument(format!(
                "end_rule({rule:?}) without a matching begin_rule"
            ))),
        }
    }
}

#[derive(Default)]
struct ImplicitState {
    thread_jobs: HashMap<ThreadId, Arc<ThreadJob>>,
    /// Outermost rules of scopes opened with `suspend_rule`.
    suspended_rules: Vec<Rule>,
}

impl ImplicitState {
    fn covered_by_suspended(&self, rule: &Rule) -> bool {
        self.suspended_rules.iter().any(|s| s.contains(rule.as_ref()))
    }
}

#[derive(Default)]
pub(crate) struct ImplicitJobs {
    state: Mutex<ImplicitState>,
}

impl ImplicitJobs {
    pub(crate) fn thread_job(&self, thread: ThreadId) -> Option<Arc<ThreadJob>> {
        self.state.lock().thread_jobs.get(&thread).cloned()
    }

    /// Open a rule scope on the current thread, blocking until the rule is
    /// free unless it is already held.
    pub(crate) fn begin(
        &self,
        mgr: &ManagerInner,
        rule: Option<Rule>,
        monitor: Option<&Arc<dyn ProgressMonitor>>,
        suspend: bool,
    ) -> Result<()> {
        let me = thread::current().id();
        let (thread_job, rule) = {
            let st = self.state.lock();
            if let Some(existing) = st.thread_jobs.get(&me) {
                return existing.push(rule);
            }
            let Some(rule) = rule else {
                return Ok(());
            };
            let real_job = mgr.current_job();
            let (base, mut acquire) = match real_job.as_ref().and_then(Job::rule) {
                Some(job_rule) => (job_rule, false),
                None => (rule.clone(), true),
            };
            if st.covered_by_suspended(&rule) {
                acquire = false;
            }
            (ThreadJob::new(base, real_job, acquire, me), rule)
        };

        let pushed = thread_job.push(Some(rule.clone()));
        if thread_job.acquire_rule {
            let acquired = match mgr.run_now(&thread_job, false) {
                None => {
                    mgr.lock_manager.add_rule_thread(me, thread_job.rule());
                    Ok(())
                }
                Some(_) => self.join_run(mgr, &thread_job, monitor),
            };
            if let Err(e) = acquired {
                debug!(rule = ?rule, error = %e, "begin_rule gave up waiting");
                return Err(e);
            }
        }

        let mut st = self.state.lock();
        st.thread_jobs.insert(me, thread_job);
        if suspend {
            st.suspended_rules.push(rule);
        }
        pushed
    }

    /// Close the innermost scope on the current thread.
    pub(crate) fn end(&self, mgr: &ManagerInner, rule: Option<&Rule>, resume: bool) -> Result<()> {
        let me = thread::current().id();
        let mut st = self.state.lock();
        let Some(thread_job) = st.thread_jobs.get(&me).cloned() else {
            return match rule {
                None => Ok(()),
                Some(r) => Err(JobsError::IllegalArgument(format!(
                    "end_rule({r:?}) without a matching begin_rule"
                ))),
            };
        };
        if !thread_job.pop(rule)? {
            return Ok(());
        }
        let deferred = self.end_thread_job(mgr, &mut st, me, &thread_job, rule.filter(|_| resume));
        drop(st);
        mgr.flush(deferred);
        Ok(())
    }

    /// Hand the current thread's rule scope to `destination`.
    pub(crate) fn transfer(&self, mgr: &ManagerInner, rule: &Rule, destination: ThreadId) -> Result<()> {
        let me = thread::current().id();
        if destination == me {
            return Ok(());
        }
        let mut st = self.state.lock();
        if st.thread_jobs.contains_key(&destination) {
            return Err(JobsError::IllegalArgument(format!(
                "thread {destination:?} already holds a rule scope"
            )));
        }
        let Some(source) = st.thread_jobs.get(&me).cloned() else {
            return Err(JobsError::IllegalArgument(format!(
                "transfer_rule({rule:?}) without a matching begin_rule"
            )));
        };
        if !Arc::ptr_eq(source.rule(), rule) {
            return Err(JobsError::IllegalArgument(format!(
                "transfer_rule({rule:?}) does not match the outermost rule {:?}",
                source.rule()
            )));
        }

        mgr.set_unit_thread(source.core(), Some(destination));
        st.thread_jobs.remove(&me);
        st.thread_jobs.insert(destination, Arc::clone(&source));
        if source.acquire_rule {
            mgr.lock_manager.remove_rule_thread(me, rule);
            mgr.lock_manager.add_rule_thread(destination, rule);
        }
        debug!(rule = ?rule, from = ?me, to = ?destination, "rule scope transferred");
        Ok(())
    }

    /// A worker finished a job; close any scope its body left open.
    pub(crate) fn end_job(&self, mgr: &ManagerInner, last: &Job) {
        let me = thread::current().id();
        let mut st = self.state.lock();
        let Some(thread_job) = st.thread_jobs.get(&me).cloned() else {
            return;
        };
        error!(
            job = %last,
            rule = ?thread_job.rule(),
            "job finished without ending its begin_rule scope, releasing it"
        );
        let deferred = self.end_thread_job(mgr, &mut st, me, &thread_job, None);
        drop(st);
        mgr.flush(deferred);
    }

    fn end_thread_job(
        &self,
        mgr: &ManagerInner,
        st: &mut ImplicitState,
        me: ThreadId,
        thread_job: &Arc<ThreadJob>,
        resumed: Option<&Rule>,
    ) -> Deferred {
        st.thread_jobs.remove(&me);
        if let Some(rule) = resumed {
            st.suspended_rules.retain(|r| !Arc::ptr_eq(r, rule));
        }
        if thread_job.acquire_rule {
            mgr.lock_manager.remove_rule_thread(me, thread_job.rule());
        }
        let mut deferred = Deferred::default();
        if thread_job.is_running() {
            mgr.end_implicit(thread_job, &mut deferred);
        }
        deferred
    }

    /// Block until `thread_job` can run. Gives up with `Canceled` if the
    /// monitor is canceled while waiting.
    pub(crate) fn join_run(
        &self,
        mgr: &ManagerInner,
        thread_job: &Arc<ThreadJob>,
        monitor: Option<&Arc<dyn ProgressMonitor>>,
    ) -> Result<()> {
        if is_canceled(monitor) {
            return Err(JobsError::Canceled);
        }
        let me = thread::current().id();
        let interval = mgr.config.max_wait_interval();
        mgr.add_waiting_thread_job(thread_job);
        mgr.lock_manager.add_rule_wait_thread(me, thread_job.rule());

        let mut reported = false;
        let outcome = loop {
            if is_canceled(monitor) {
                break Err(JobsError::Canceled);
            }
            let Some(blocker) = mgr.run_now(thread_job, true) else {
                break Ok(());
            };
            if !reported {
                if let Some(m) = monitor {
                    m.set_blocked(&format!("waiting for {}", blocker.describe()));
                }
                reported = true;
            }
            // A blocker parked in a blocked chain stays put until its root
            // ends, so wait on it too. Any state change notifies.
            let core = blocker.core();
            let mut data = core.data.lock();
            if matches!(
                data.state,
                JobState::Running | JobState::AboutToRun | JobState::Blocked
            ) {
                core.changed.wait_for(&mut data, interval);
            }
        };

        mgr.remove_waiting_thread_job(thread_job);
        if reported {
            if let Some(m) = monitor {
                m.clear_blocked();
            }
        }
        match outcome {
            Ok(()) => mgr.lock_manager.add_rule_thread(me, thread_job.rule()),
            Err(_) => mgr.lock_manager.remove_rule_wait_thread(me, thread_job.rule()),
        }
        mgr.lock_manager.resume_suspended_locks(me);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{ExclusiveRule, PathRule};

    fn thread_job(rule: Rule) -> Arc<ThreadJob> {
        ThreadJob::new(rule, None, true, thread::current().id())
    }

    #[test]
    fn nested_scopes_balance() {
        let outer = PathRule::shared("/a");
        let inner = PathRule::shared("/a/b");
        let tj = thread_job(outer.clone());
        tj.push(Some(outer.clone())).unwrap();
        tj.push(Some(inner.clone())).unwrap();
        tj.push(None).unwrap();

        assert!(!tj.pop(None).unwrap());
        assert!(!tj.pop(Some(&inner)).unwrap());
        assert!(tj.pop(Some(&outer)).unwrap());
    }

    #[test]
    fn uncontained_nested_rule_is_rejected_but_recorded() {
        let outer = PathRule::shared("/a");
        let other = PathRule::shared("/b");
        let tj = thread_job(outer.clone());
        tj.push(Some(outer.clone())).unwrap();
        assert!(matches!(tj.push(Some(other.clone())), Err(JobsError::IllegalArgument(_))));
        assert!(!tj.pop(Some(&other)).unwrap());
        assert!(tj.pop(Some(&outer)).unwrap());
    }

    #[test]
    fn mismatched_end_is_rejected() {
        let outer = ExclusiveRule::shared("r");
        let tj = thread_job(outer.clone());
        tj.push(Some(outer.clone())).unwrap();
        let err = tj.pop(Some(&ExclusiveRule::shared("r"))).unwrap_err();
        assert!(matches!(err, JobsError::IllegalArgument(_)));
        assert!(tj.pop(Some(&outer)).unwrap());
        assert!(tj.pop(Some(&outer)).is_err());
    }

    #[test]
    fn current_rule_skips_empty_scopes() {
        let outer = PathRule::shared("/a");
        let tj = thread_job(outer.clone());
        assert!(tj.current_rule().is_none());
        tj.push(None).unwrap();
        tj.push(Some(outer.clone())).unwrap();
        assert!(Arc::ptr_eq(&tj.current_rule().unwrap(), &outer));
        assert_eq!(tj.core().thread(), Some(thread::current().id()));
        assert_eq!(tj.core().data.lock().priority, JobPriority::Interactive);
    }
}
