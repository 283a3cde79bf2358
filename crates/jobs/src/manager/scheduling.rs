use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::core::{Deferred, JobManager, ManagerInner, ManagerState, Unit};
use crate::error::{JobsError, Result};
use crate::implicit::ThreadJob;
use crate::job::{Job, JobPriority, JobState};
use crate::listener::{JobChangeEvent, JobEventKind};
use crate::queue::QueueEntry;
use crate::rule::{validate_rule, Rule};
use crate::status::{JobStatus, Severity};

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn offset(now: i64, ms: u64) -> i64 {
    now.saturating_add(i64::try_from(ms).unwrap_or(i64::MAX))
}

impl JobManager {
    /// Queue `job` to run as soon as possible.
    pub fn schedule(&self, job: &Job) -> Result<()> {
        self.schedule_after(job, Duration::ZERO)
    }

    /// Queue `job` to run once `delay` has passed. Scheduling a job that is
    /// already waiting or sleeping does nothing; scheduling a running job
    /// makes it run again after it finishes.
    pub fn schedule_after(&self, job: &Job, delay: Duration) -> Result<()> {
        if !job.should_schedule() {
            debug!(job = %job, "schedule vetoed by should_schedule");
            return Ok(());
        }
        self.inner.schedule(job, delay, false)
    }

    /// Request cancellation. Returns true if the job will not run (again);
    /// false if it is running and has only been asked to stop.
    pub fn cancel(&self, job: &Job) -> bool {
        self.inner.cancel(job)
    }

    /// Cancel every job of `family` (all jobs for `None`).
    pub fn cancel_family(&self, family: Option<&str>) {
        for job in self.find(family) {
            self.inner.cancel(&job);
        }
    }

    /// Park a waiting job until [`wake_up`](Self::wake_up). Returns false if
    /// the job is running and cannot be put to sleep.
    pub fn sleep(&self, job: &Job) -> bool {
        self.inner.sleep(job)
    }

    pub fn sleep_family(&self, family: Option<&str>) {
        for job in self.find(family) {
            self.inner.sleep(&job);
        }
    }

    /// Move a sleeping job back to the queue after `delay`.
    pub fn wake_up(&self, job: &Job, delay: Duration) {
        self.inner.wake_up(job, delay);
    }

    pub fn wake_up_family(&self, family: Option<&str>) {
        for job in self.find(family) {
            self.inner.wake_up(&job, Duration::ZERO);
        }
    }

    /// Change the priority of `job`; a waiting job is re-queued accordingly.
    pub fn set_priority(&self, job: &Job, priority: JobPriority) {
        let mut st = self.inner.state.lock();
        let mut data = job.core().data.lock();
        let old = data.priority;
        if old == priority {
            return;
        }
        data.priority = priority;
        if data.state != JobState::Waiting {
            return;
        }
        let shift = millis(priority.min_latency()) as i64 - millis(old.min_latency()) as i64;
        let start = data.start_time.unwrap_or(0).saturating_add(shift);
        data.start_time = Some(start);
        let entry = QueueEntry {
            id: job.id(),
            start_time: start,
            wait_stamp: data.wait_stamp,
            rule: data.rule.clone(),
        };
        drop(data);
        st.waiting.resort(entry);
    }

    /// Replace the rule of a job that is not scheduled.
    pub fn set_rule(&self, job: &Job, rule: Option<Rule>) -> Result<()> {
        if let Some(rule) = &rule {
            validate_rule(rule.as_ref())?;
        }
        let _st = self.inner.state.lock();
        let mut data = job.core().data.lock();
        if data.state != JobState::None {
            return Err(JobsError::IllegalState(format!(
                "cannot change the rule of {job} while it is scheduled"
            )));
        }
        data.rule = rule;
        Ok(())
    }

    /// Stop and cancel everything. Running jobs are asked to cancel and
    /// given a bounded time to finish; scheduling afterwards fails with
    /// [`JobsError::ShutDown`].
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl ManagerInner {
    pub(crate) fn schedule(&self, job: &Job, delay: Duration, reschedule: bool) -> Result<()> {
        if let Some(rule) = job.rule() {
            validate_rule(rule.as_ref())?;
        }
        let delay_ms = millis(delay);
        let mut d = Deferred::default();
        {
            let mut st = self.state.lock();
            if !st.active {
                return Err(JobsError::ShutDown);
            }
            match job.internal_state() {
                JobState::None => {}
                JobState::AboutToRun | JobState::Running => {
                    job.core().data.lock().reschedule_delay = Some(delay_ms);
                    debug!(job = %job, delay_ms, "job will be rescheduled when it finishes");
                    return Ok(());
                }
                _ => return Ok(()),
            }
            self.change_state(&mut st, &Unit::Job(job.clone()), JobState::AboutToSchedule, &mut d);
        }
        self.metrics.write().jobs_scheduled += 1;

        let mut event = JobChangeEvent::new(JobEventKind::Scheduled, job.clone());
        event.delay = Some(delay);
        event.reschedule = reschedule;
        d.events.push(event);
        self.flush(d);

        let mut d = Deferred::default();
        {
            let mut st = self.state.lock();
            self.do_schedule(&mut st, job, delay_ms, &mut d);
        }
        d.wake_pool = true;
        self.flush(d);
        Ok(())
    }

    /// Put an about-to-schedule or sleeping job into the waiting queue, or
    /// to sleep if it has a delay.
    fn do_schedule(&self, st: &mut ManagerState, job: &Job, delay_ms: u64, d: &mut Deferred) {
        let state = job.internal_state();
        if state != JobState::AboutToSchedule && state != JobState::Sleeping {
            return;
        }
        let priority = job.priority();
        let mut delay_ms = delay_ms;
        if priority == JobPriority::Decorate {
            // Decorations give way to everything else while the pool is busy.
            let busy = st.running.len() as u64 * self.config.decorate_busy_delay_ms;
            delay_ms = delay_ms.max(busy);
        }
        let now = self.now_ms();
        let unit = Unit::Job(job.clone());
        if delay_ms > 0 {
            job.core().data.lock().start_time = Some(offset(now, delay_ms));
            self.change_state(st, &unit, JobState::Sleeping, d);
        } else {
            let stamp = st.next_wait_stamp();
            {
                let mut data = job.core().data.lock();
                data.start_time = Some(offset(now, millis(priority.min_latency())));
                data.wait_stamp = Some(stamp);
            }
            self.change_state(st, &unit, JobState::Waiting, d);
        }
    }

    pub(crate) fn cancel(&self, job: &Job) -> bool {
        let mut d = Deferred::default();
        let running_monitor = {
            let mut st = self.state.lock();
            match job.internal_state() {
                JobState::None => return true,
                JobState::AboutToRun => {
                    job.core().data.lock().about_to_run_canceled = true;
                    return false;
                }
                JobState::Running | JobState::Yielding => {
                    let mut data = job.core().data.lock();
                    if data.run_canceled {
                        return false;
                    }
                    data.run_canceled = true;
                    Some(data.monitor.clone())
                }
                _ => {
                    self.change_state(&mut st, &Unit::Job(job.clone()), JobState::None, &mut d);
                    None
                }
            }
        };

        if let Some(monitor) = running_monitor {
            if let Some(monitor) = monitor {
                monitor.set_canceled(true);
            }
            job.canceling();
            debug!(job = %job, "cancel requested for running job");
            return false;
        }

        debug!(job = %job, "job canceled before running");
        let mut event = JobChangeEvent::new(JobEventKind::Done, job.clone());
        event.result = Some(JobStatus::cancel());
        d.events.push(event);
        self.flush(d);
        true
    }

    pub(crate) fn sleep(&self, job: &Job) -> bool {
        let mut d = Deferred::default();
        {
            let mut st = self.state.lock();
            let unit = Unit::Job(job.clone());
            match job.internal_state() {
                JobState::None => return true,
                JobState::Running | JobState::Yielding => return false,
                JobState::Sleeping => {
                    job.core().data.lock().start_time = Some(i64::MAX);
                    self.change_state(&mut st, &unit, JobState::Sleeping, &mut d);
                    return true;
                }
                _ => {
                    job.core().data.lock().start_time = Some(i64::MAX);
                    self.change_state(&mut st, &unit, JobState::Sleeping, &mut d);
                }
            }
        }
        d.events.push(JobChangeEvent::new(JobEventKind::Sleeping, job.clone()));
        self.flush(d);
        true
    }

    pub(crate) fn wake_up(&self, job: &Job, delay: Duration) {
        let mut d = Deferred::default();
        {
            let mut st = self.state.lock();
            if job.internal_state() != JobState::Sleeping {
                return;
            }
            self.do_schedule(&mut st, job, millis(delay), &mut d);
        }
        d.wake_pool = true;
        if delay.is_zero() {
            d.events.push(JobChangeEvent::new(JobEventKind::Awake, job.clone()));
        }
        self.flush(d);
    }

    /// How long a worker may nap before something could become runnable.
    /// `None` means nothing is scheduled at all.
    pub(crate) fn sleep_hint(&self) -> Option<Duration> {
        let st = self.state.lock();
        if st.suspended {
            return None;
        }
        if !st.waiting.is_empty() {
            return Some(Duration::ZERO);
        }
        let next = st.sleeping.peek()?;
        if next.start_time == i64::MAX {
            return None;
        }
        let ms = next.start_time.saturating_sub(self.now_ms()).max(0);
        Some(Duration::from_millis(ms as u64))
    }

    /// Pick the next runnable job and move it to `AboutToRun`. Due sleepers
    /// are promoted first; waiting jobs with a conflicting rule are parked
    /// behind their blocker.
    fn next_job(&self, st: &mut ManagerState, d: &mut Deferred) -> Option<Job> {
        if st.suspended {
            return None;
        }
        let now = self.now_ms();
        while let Some(entry) = st.sleeping.peek() {
            if entry.start_time > now {
                break;
            }
            let id = entry.id;
            let Some(Unit::Job(job)) = st.units.get(&id).cloned() else {
                st.sleeping.remove(id);
                continue;
            };
            let stamp = st.next_wait_stamp();
            {
                let mut data = job.core().data.lock();
                data.start_time = Some(offset(now, millis(data.priority.min_latency())));
                data.wait_stamp = Some(stamp);
            }
            self.change_state(st, &Unit::Job(job), JobState::Waiting, d);
        }

        for id in st.waiting.ids() {
            let Some(unit) = st.units.get(&id).cloned() else { continue };
            let Unit::Job(job) = &unit else { continue };
            if let Some(blocker) = self.find_blocking(st, job.rule().as_ref()) {
                self.change_state(st, &unit, JobState::Blocked, d);
                st.blocked.add_last(blocker.id(), id);
                continue;
            }
            if job.group().is_some_and(|g| g.at_capacity()) {
                continue;
            }
            self.change_state(st, &unit, JobState::AboutToRun, d);
            return Some(job.clone());
        }
        None
    }

    /// Hand the calling worker its next job, already in `Running` with a
    /// fresh monitor.
    pub(crate) fn start_job(&self) -> Option<Job> {
        enum Start {
            Run,
            Veto,
            Gone,
        }

        let me = thread::current().id();
        loop {
            let mut d = Deferred::default();
            let job = {
                let mut st = self.state.lock();
                self.next_job(&mut st, &mut d)
            };
            self.flush(d);
            let job = job?;

            let mut should_run = job.should_run();
            if should_run {
                self.flush(Deferred::event(JobChangeEvent::new(JobEventKind::AboutToRun, job.clone())));
            }
            let monitor = self.create_monitor(&job);

            let start = {
                let _st = self.state.lock();
                if job.group().is_some_and(|g| g.is_canceling()) {
                    should_run = false;
                }
                let mut data = job.core().data.lock();
                if data.state != JobState::AboutToRun {
                    Start::Gone
                } else if should_run && !data.about_to_run_canceled {
                    data.monitor = Some(Arc::clone(&monitor));
                    data.thread = Some(me);
                    data.state = JobState::Running;
                    job.core().changed.notify_all();
                    Start::Run
                } else {
                    data.about_to_run_canceled = false;
                    Start::Veto
                }
            };

            match start {
                Start::Run => {
                    self.flush(Deferred::event(JobChangeEvent::new(JobEventKind::Running, job.clone())));
                    debug!(job = %job, "job started");
                    return Some(job);
                }
                Start::Veto => {
                    debug!(job = %job, "job vetoed before running");
                    self.end_job(&job, JobStatus::cancel(), true);
                }
                Start::Gone => {}
            }
        }
    }

    /// Return a finished (or vetoed) job to `None` and reschedule it if a
    /// schedule call arrived while it ran.
    pub(crate) fn end_job(&self, job: &Job, result: JobStatus, notify: bool) {
        let mut d = Deferred::default();
        let (reschedule_delay, active) = {
            let mut st = self.state.lock();
            if job.internal_state() == JobState::None {
                return;
            }
            let reschedule_delay = {
                let mut data = job.core().data.lock();
                data.result = Some(result.clone());
                data.monitor = None;
                data.thread = None;
                data.reschedule_delay.take()
            };
            self.change_state(&mut st, &Unit::Job(job.clone()), JobState::None, &mut d);
            if !st.waiting.is_empty() {
                d.wake_pool = true;
            }
            (reschedule_delay, st.active)
        };
        self.metrics.write().jobs_completed += 1;

        if job.group().is_none() {
            match result.severity {
                Severity::Error => error!(job = %job, status = %result, "job failed"),
                Severity::Warning => warn!(job = %job, status = %result, "job finished with warnings"),
                _ => {}
            }
        }

        let reschedule = active && reschedule_delay.is_some() && job.should_schedule();
        if notify {
            let mut event = JobChangeEvent::new(JobEventKind::Done, job.clone());
            event.result = Some(result);
            event.reschedule = reschedule;
            d.events.push(event);
        }
        self.flush(d);

        if let (true, Some(delay)) = (reschedule, reschedule_delay) {
            if let Err(e) = self.schedule(job, Duration::from_millis(delay), true) {
                warn!(job = %job, error = %e, "reschedule failed");
            }
        }
    }

    /// Try to start a thread job right away. Returns the unit blocking it
    /// otherwise. With `release_waiting` the thread job also leaves the
    /// waiting-thread queue in the same step.
    pub(crate) fn run_now(&self, thread_job: &Arc<ThreadJob>, release_waiting: bool) -> Option<Unit> {
        let mut d = Deferred::default();
        let blocker = {
            let mut st = self.state.lock();
            match self.find_blocking(&st, Some(thread_job.rule())) {
                Some(blocker) => Some(blocker),
                None => {
                    if release_waiting {
                        let id = thread_job.core().id;
                        st.waiting_threads.remove(id);
                        st.waiting_thread_jobs.remove(&id);
                        thread_job.core().data.lock().is_waiting = false;
                    }
                    self.change_state(&mut st, &Unit::Implicit(Arc::clone(thread_job)), JobState::Running, &mut d);
                    None
                }
            }
        };
        self.flush(d);
        blocker
    }

    /// End a running thread job without notifying listeners.
    pub(crate) fn end_implicit(&self, thread_job: &Arc<ThreadJob>, d: &mut Deferred) {
        let mut st = self.state.lock();
        if thread_job.core().state() == JobState::None {
            return;
        }
        {
            let mut data = thread_job.core().data.lock();
            data.result = Some(JobStatus::ok());
            data.thread = None;
        }
        self.change_state(&mut st, &Unit::Implicit(Arc::clone(thread_job)), JobState::None, d);
    }

    pub(crate) fn add_waiting_thread_job(&self, thread_job: &Arc<ThreadJob>) {
        let mut st = self.state.lock();
        let id = thread_job.core().id;
        st.waiting_threads.enqueue(QueueEntry {
            id,
            start_time: 0,
            wait_stamp: None,
            rule: Some(Arc::clone(thread_job.rule())),
        });
        st.waiting_thread_jobs.insert(id, Arc::clone(thread_job));
        thread_job.core().data.lock().is_waiting = true;
        thread_job.core().changed.notify_all();
    }

    pub(crate) fn remove_waiting_thread_job(&self, thread_job: &Arc<ThreadJob>) {
        let mut st = self.state.lock();
        let id = thread_job.core().id;
        st.waiting_threads.remove(id);
        st.waiting_thread_jobs.remove(&id);
        thread_job.core().data.lock().is_waiting = false;
        thread_job.core().changed.notify_all();
    }

    pub(crate) fn shutdown(&self) {
        let mut d = Deferred::default();
        let running = {
            let mut st = self.state.lock();
            if !st.active {
                return;
            }
            st.active = false;
            let queued: Vec<Unit> = st
                .units
                .values()
                .filter(|unit| {
                    matches!(
                        unit.core().state(),
                        JobState::Waiting | JobState::Sleeping | JobState::Blocked
                    )
                })
                .cloned()
                .collect();
            for unit in &queued {
                self.change_state(&mut st, unit, JobState::None, &mut d);
                if let Unit::Job(job) = unit {
                    let mut event = JobChangeEvent::new(JobEventKind::Done, job.clone());
                    event.result = Some(JobStatus::cancel());
                    d.events.push(event);
                }
            }
            st.running_jobs()
        };
        info!(running = running.len(), canceled = d.events.len(), "job manager shutting down");
        self.flush(d);

        for job in &running {
            self.cancel(job);
        }
        let interval = self.config.max_wait_interval();
        for _ in 0..self.config.shutdown_wait_attempts {
            if self.state.lock().running_jobs().is_empty() {
                break;
            }
            thread::sleep(interval);
        }
        for job in self.state.lock().running_jobs() {
            warn!(job = %job, "job still running after shutdown");
        }
        self.pool.shutdown();
    }
}
