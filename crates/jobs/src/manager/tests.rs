#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::any::Any;
    use std::thread;
    use std::time::{Duration, Instant};

    use parking_lot::{Condvar, Mutex};

    use crate::config::JobsConfig;
    use crate::error::JobsError;
    use crate::job::{Job, JobPriority, JobState};
    use crate::manager::{JobManager, YieldTarget};
    use crate::rule::{ExclusiveRule, MultiRule, PathRule, Rule, SchedulingRule};
    use crate::status::{JobStatus, Severity};

    fn manager(max_threads: usize) -> JobManager {
        JobManager::new(JobsConfig {
            max_threads,
            min_threads: 0,
            decorate_busy_delay_ms: 10_000,
            ..JobsConfig::default()
        })
        .unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    /// One-shot latch a job body can block on.
    #[derive(Clone, Default)]
    struct Gate(Arc<(Mutex<bool>, Condvar)>);

    impl Gate {
        fn open(&self) {
            *self.0 .0.lock() = true;
            self.0 .1.notify_all();
        }

        fn wait(&self) {
            let mut open = self.0 .0.lock();
            while !*open {
                self.0 .1.wait(&mut open);
            }
        }
    }

    fn gated_job(name: &str, rule: Option<Rule>, gate: &Gate) -> Job {
        let gate = gate.clone();
        let mut builder = Job::builder(name);
        if let Some(rule) = rule {
            builder = builder.rule(rule);
        }
        builder.build(move |_| {
            gate.wait();
            JobStatus::ok()
        })
    }

    #[test]
    fn waiting_queue_orders_by_priority() {
        let mgr = manager(1);
        mgr.suspend_scheduling();
        let long = Job::builder("long").priority(JobPriority::Long).build(|_| JobStatus::ok());
        let short = Job::builder("short").priority(JobPriority::Short).build(|_| JobStatus::ok());
        let interactive = Job::builder("interactive")
            .priority(JobPriority::Interactive)
            .build(|_| JobStatus::ok());
        for job in [&long, &short, &interactive] {
            mgr.schedule(job).unwrap();
            assert_eq!(job.state(), JobState::Waiting);
        }

        let order = mgr.inner.state.lock().waiting.ids();
        assert_eq!(order, vec![interactive.id(), short.id(), long.id()]);
        assert_eq!(mgr.find(None).len(), 3);

        for job in [&long, &short, &interactive] {
            assert!(mgr.cancel(job));
            assert_eq!(job.state(), JobState::None);
        }
        assert!(mgr.inner.state.lock().waiting.is_empty());
        assert!(mgr.is_idle());
    }

    #[test]
    fn set_priority_requeues_waiting_job() {
        let mgr = manager(1);
        mgr.suspend_scheduling();
        let a = Job::new("a", |_| JobStatus::ok());
        let b = Job::new("b", |_| JobStatus::ok());
        mgr.schedule(&a).unwrap();
        mgr.schedule(&b).unwrap();
        assert_eq!(mgr.inner.state.lock().waiting.ids(), vec![a.id(), b.id()]);

        mgr.set_priority(&b, JobPriority::Interactive);
        assert_eq!(b.priority(), JobPriority::Interactive);
        assert_eq!(mgr.inner.state.lock().waiting.ids(), vec![b.id(), a.id()]);
        mgr.cancel_family(None);
    }

    #[test]
    fn conflicting_job_is_blocked_behind_runner() {
        let mgr = manager(4);
        let rule = ExclusiveRule::shared("r");
        let gate = Gate::default();
        let first = gated_job("first", Some(rule.clone()), &gate);
        let second = Job::builder("second").rule(rule).build(|_| JobStatus::ok());

        mgr.schedule(&first).unwrap();
        assert!(wait_until(|| first.state() == JobState::Running));
        mgr.schedule(&second).unwrap();
        assert!(wait_until(|| second.internal_state() == JobState::Blocked));

        assert_eq!(mgr.inner.state.lock().blocked.chain(first.id()), &[second.id()]);
        assert_eq!(second.state(), JobState::Waiting);
        assert!(mgr.is_blocking(&first));
        assert!(!mgr.is_blocking(&second));

        gate.open();
        assert!(mgr.join(&second, Some(Duration::from_secs(5)), None).unwrap());
        assert!(second.result().unwrap().is_ok());
        assert!(mgr.inner.state.lock().blocked.is_empty());
    }

    #[test]
    fn sleep_and_wake_up() {
        let mgr = manager(2);
        let ran = Arc::new(AtomicBool::new(false));
        let job = {
            let ran = ran.clone();
            Job::new("sleeper", move |_| {
                ran.store(true, Ordering::SeqCst);
                JobStatus::ok()
            })
        };

        mgr.schedule_after(&job, Duration::from_secs(3600)).unwrap();
        assert_eq!(job.state(), JobState::Sleeping);
        assert!(mgr.sleep(&job));
        assert_eq!(job.core().data.lock().start_time, Some(i64::MAX));
        assert_eq!(mgr.inner.sleep_hint(), None);

        mgr.wake_up(&job, Duration::ZERO);
        assert!(mgr.join(&job, Some(Duration::from_secs(5)), None).unwrap());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn running_job_cannot_sleep() {
        let mgr = manager(2);
        let gate = Gate::default();
        let job = gated_job("busy", None, &gate);
        mgr.schedule(&job).unwrap();
        assert!(wait_until(|| job.state() == JobState::Running));
        assert!(!mgr.sleep(&job));
        gate.open();
        assert!(mgr.join(&job, None, None).unwrap());
    }

    #[test]
    fn cancel_running_job_is_cooperative() {
        let mgr = manager(2);
        let hooked = Arc::new(AtomicBool::new(false));
        let job = {
            let hooked = hooked.clone();
            Job::builder("spinner")
                .on_canceling(move |_| hooked.store(true, Ordering::SeqCst))
                .build(|ctx| {
                    while !ctx.is_canceled() {
                        thread::sleep(Duration::from_millis(2));
                    }
                    JobStatus::cancel()
                })
        };
        mgr.schedule(&job).unwrap();
        assert!(wait_until(|| job.state() == JobState::Running));

        assert!(!mgr.cancel(&job));
        assert!(!mgr.cancel(&job));
        assert!(mgr.join(&job, Some(Duration::from_secs(5)), None).unwrap());
        assert!(hooked.load(Ordering::SeqCst));
        assert_eq!(job.result().unwrap().severity, Severity::Cancel);
        assert_eq!(mgr.metrics().cancellations["spinner"], 1);
    }

    #[test]
    fn schedule_while_running_reschedules() {
        let mgr = manager(2);
        let runs = Arc::new(AtomicUsize::new(0));
        let job = {
            let runs = runs.clone();
            Job::new("again", move |ctx| {
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    ctx.manager().schedule(ctx.job()).unwrap();
                }
                JobStatus::ok()
            })
        };
        mgr.schedule(&job).unwrap();
        assert!(wait_until(|| runs.load(Ordering::SeqCst) == 2 && job.state() == JobState::None));
        assert_eq!(mgr.metrics().runs["again"], 2);
    }

    #[test]
    fn set_rule_requires_unscheduled_job() {
        let mgr = manager(1);
        mgr.suspend_scheduling();
        let job = Job::new("ruled", |_| JobStatus::ok());
        mgr.schedule(&job).unwrap();
        let err = mgr.set_rule(&job, Some(ExclusiveRule::shared("r"))).unwrap_err();
        assert!(matches!(err, JobsError::IllegalState(_)));

        assert!(mgr.cancel(&job));
        let rule = ExclusiveRule::shared("r");
        mgr.set_rule(&job, Some(rule.clone())).unwrap();
        assert!(Arc::ptr_eq(&job.rule().unwrap(), &rule));
    }

    #[test]
    fn shutdown_cancels_queued_jobs_and_rejects_new_ones() {
        let mgr = manager(1);
        mgr.suspend_scheduling();
        let job = Job::new("queued", |_| JobStatus::ok());
        mgr.schedule(&job).unwrap();

        mgr.shutdown();
        assert!(!mgr.is_active());
        assert_eq!(job.state(), JobState::None);
        assert!(job.result().is_none());
        assert!(matches!(mgr.schedule(&job), Err(JobsError::ShutDown)));
    }

    #[test]
    fn decorate_job_waits_while_pool_is_busy() {
        let mgr = manager(2);
        let gate = Gate::default();
        let busy = gated_job("busy", None, &gate);
        mgr.schedule(&busy).unwrap();
        assert!(wait_until(|| busy.state() == JobState::Running));

        let decorator = Job::builder("decorator")
            .priority(JobPriority::Decorate)
            .build(|_| JobStatus::ok());
        mgr.schedule(&decorator).unwrap();
        assert_eq!(decorator.state(), JobState::Sleeping);

        assert!(mgr.cancel(&decorator));
        gate.open();
        assert!(mgr.join(&busy, None, None).unwrap());
    }

    #[test]
    fn current_rule_comes_from_job_or_scope() {
        let mgr = manager(2);
        let rule = ExclusiveRule::shared("job-rule");
        let seen = Arc::new(Mutex::new(None));
        let job = {
            let seen = seen.clone();
            Job::builder("ruled").rule(rule.clone()).build(move |ctx| {
                let current = ctx.manager().current_job().map(|j| j.id());
                *seen.lock() = Some((current, ctx.manager().current_rule()));
                JobStatus::ok()
            })
        };
        mgr.schedule(&job).unwrap();
        assert!(mgr.join(&job, Some(Duration::from_secs(5)), None).unwrap());
        let (current, current_rule) = seen.lock().take().unwrap();
        assert_eq!(current, Some(job.id()));
        assert!(Arc::ptr_eq(&current_rule.unwrap(), &rule));

        let scope = ExclusiveRule::shared("scope");
        assert!(mgr.current_rule().is_none());
        mgr.begin_rule(Some(&scope), None).unwrap();
        assert!(Arc::ptr_eq(&mgr.current_rule().unwrap(), &scope));
        mgr.end_rule(Some(&scope)).unwrap();
        assert!(mgr.current_rule().is_none());
        assert!(mgr.lock_manager().is_empty());
    }

    #[test]
    fn joining_self_is_illegal() {
        let mgr = manager(2);
        let outcome = Arc::new(Mutex::new(None));
        let job = {
            let outcome = outcome.clone();
            Job::new("narcissus", move |ctx| {
                *outcome.lock() = Some(ctx.manager().join(ctx.job(), None, None));
                JobStatus::ok()
            })
        };
        mgr.schedule(&job).unwrap();
        assert!(mgr.join(&job, Some(Duration::from_secs(5)), None).unwrap());
        let result = outcome.lock().take().unwrap();
        assert!(matches!(result, Err(JobsError::IllegalState(_))));
    }

    #[test]
    fn join_times_out() {
        let mgr = manager(2);
        let gate = Gate::default();
        let job = gated_job("slow", None, &gate);
        mgr.schedule(&job).unwrap();
        assert!(!mgr.join(&job, Some(Duration::from_millis(30)), None).unwrap());
        gate.open();
        assert!(mgr.join(&job, None, None).unwrap());
    }

    #[test]
    fn yield_rule_runs_blocked_job_in_between() {
        let mgr = manager(4);
        let rule = ExclusiveRule::shared("shared");
        let second_ran = Arc::new(AtomicBool::new(false));
        let second = {
            let second_ran = second_ran.clone();
            Job::builder("second").rule(rule.clone()).build(move |_| {
                second_ran.store(true, Ordering::SeqCst);
                JobStatus::ok()
            })
        };
        let observed = Arc::new(Mutex::new(None));
        let first = {
            let second = second.clone();
            let second_ran = second_ran.clone();
            let observed = observed.clone();
            Job::builder("first").rule(rule).build(move |ctx| {
                assert!(wait_until(|| second.internal_state() == JobState::Blocked));
                let target = ctx.yield_rule(None);
                let ran_during_yield = second_ran.load(Ordering::SeqCst);
                let still_running = ctx.job().internal_state() == JobState::Running;
                *observed.lock() = Some((target, ran_during_yield, still_running));
                JobStatus::ok()
            })
        };

        mgr.schedule(&first).unwrap();
        assert!(wait_until(|| first.state() == JobState::Running));
        mgr.schedule(&second).unwrap();
        assert!(mgr.join(&first, Some(Duration::from_secs(5)), None).unwrap());

        let (target, ran_during_yield, still_running) = observed.lock().take().unwrap();
        assert!(matches!(target, Ok(Some(YieldTarget::Job(ref j))) if *j == second));
        assert!(ran_during_yield);
        assert!(still_running);
        assert!(mgr.lock_manager().is_empty());
    }

    #[test]
    fn yield_without_contention_returns_none() {
        let mgr = manager(2);
        let observed = Arc::new(Mutex::new(None));
        let job = {
            let observed = observed.clone();
            Job::builder("alone")
                .rule(ExclusiveRule::shared("r"))
                .build(move |ctx| {
                    *observed.lock() = Some(ctx.yield_rule(None).map(|t| t.is_none()));
                    JobStatus::ok()
                })
        };
        mgr.schedule(&job).unwrap();
        assert!(mgr.join(&job, Some(Duration::from_secs(5)), None).unwrap());
        assert!(matches!(observed.lock().take(), Some(Ok(true))));

        let outside = Job::new("outside", |_| JobStatus::ok());
        assert!(matches!(mgr.yield_rule(&outside, None), Err(JobsError::IllegalState(_))));
    }

    #[test]
    fn vetoed_job_ends_as_canceled() {
        let mgr = manager(2);
        let job = Job::builder("vetoed")
            .should_run(|_| false)
            .build(|_| panic!("vetoed job must not run"));
        mgr.schedule(&job).unwrap();
        assert!(mgr.join(&job, Some(Duration::from_secs(5)), None).unwrap());
        assert_eq!(job.result().unwrap().severity, Severity::Cancel);
    }

    #[test]
    fn panicking_job_reports_error() {
        let mgr = manager(2);
        let job = Job::new("explodes", |_| panic!("kaboom"));
        mgr.schedule(&job).unwrap();
        assert!(mgr.join(&job, Some(Duration::from_secs(5)), None).unwrap());
        let result = job.result().unwrap();
        assert_eq!(result.severity, Severity::Error);
        assert!(result.message.contains("kaboom"));
        assert_eq!(mgr.metrics().failures["explodes"], 1);
    }

    /// Path rule that counts how often it is asked about conflicts.
    #[derive(Debug)]
    struct CountingRule {
        inner: PathRule,
        checks: Arc<AtomicUsize>,
    }

    impl SchedulingRule for CountingRule {
        fn contains(&self, other: &dyn SchedulingRule) -> bool {
            self.inner.contains(other)
        }

        fn is_conflicting(&self, other: &dyn SchedulingRule) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.inner.is_conflicting(other)
        }

        fn as_any(&self) -> &dyn Any {
            &self.inner
        }
    }

    #[test]
    fn begin_rule_sleeps_behind_blocked_job() {
        let mgr = manager(4);
        let gate = Gate::default();
        let holder = gated_job("holder", Some(PathRule::shared("/a")), &gate);
        let both = Job::builder("both")
            .rule(Arc::new(MultiRule::new([PathRule::shared("/a"), PathRule::shared("/b")])))
            .build(|_| JobStatus::ok());

        mgr.schedule(&holder).unwrap();
        assert!(wait_until(|| holder.state() == JobState::Running));
        mgr.schedule(&both).unwrap();
        assert!(wait_until(|| both.internal_state() == JobState::Blocked));

        let checks = Arc::new(AtomicUsize::new(0));
        let rule: Rule = Arc::new(CountingRule {
            inner: PathRule::new("/b"),
            checks: checks.clone(),
        });
        let waiter = {
            let (mgr, rule) = (mgr.clone(), rule.clone());
            thread::spawn(move || {
                mgr.begin_rule(Some(&rule), None)?;
                mgr.end_rule(Some(&rule))
            })
        };

        thread::sleep(Duration::from_millis(50));
        let before = checks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(500));
        let during = checks.load(Ordering::SeqCst) - before;
        assert!(during < 100, "{during} conflict checks while waiting");
        assert!(!waiter.is_finished());

        gate.open();
        waiter.join().unwrap().unwrap();
        assert!(mgr.join(&both, Some(Duration::from_secs(5)), None).unwrap());
        assert!(mgr.lock_manager().is_empty());
    }
}
