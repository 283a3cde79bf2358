//! Elastic worker pool.
//!
//! Threads are spawned on demand up to `max_threads`, nap while there is
//! nothing to run, and retire after `best_before` of idleness as long as
//! more than `min_threads` remain. Workers only hold a weak reference to the
//! manager, so an idle pool never keeps a dropped manager alive.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::config::JobsConfig;
use crate::job::{Job, JobContext};
use crate::listener::panic_message;
use crate::manager::{JobManager, ManagerInner};
use crate::status::JobStatus;

struct PoolState {
    num_threads: usize,
    /// Workers running a job or looking for one.
    busy: usize,
    /// Workers napping on `wake`.
    sleeping: usize,
    /// Work was queued while no worker was napping.
    pending: bool,
    shutdown: bool,
    next_id: u64,
}

pub(crate) struct WorkerPool {
    state: Mutex<PoolState>,
    wake: Condvar,
    min_threads: usize,
    max_threads: usize,
    best_before: Duration,
    max_wait_interval: Duration,
    name_prefix: String,
    spawned: AtomicU64,
    retired: AtomicU64,
}

impl WorkerPool {
    pub(crate) fn new(config: &JobsConfig) -> Self {
        Self {
            state: Mutex::new(PoolState {
                num_threads: 0,
                busy: 0,
                sleeping: 0,
                pending: false,
                shutdown: false,
                next_id: 0,
            }),
            wake: Condvar::new(),
            min_threads: config.min_threads,
            max_threads: config.max_threads,
            best_before: config.best_before(),
            max_wait_interval: config.max_wait_interval(),
            name_prefix: config.worker_name_prefix.clone(),
            spawned: AtomicU64::new(0),
            retired: AtomicU64::new(0),
        }
    }

    pub(crate) fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub(crate) fn retired(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }

    /// Something became runnable: wake a napping worker or grow the pool.
    pub(crate) fn job_queued(self: &Arc<Self>, manager: &Weak<ManagerInner>) {
        let id = {
            let mut st = self.state.lock();
            if st.shutdown {
                return;
            }
            if st.sleeping > 0 {
                self.wake.notify_one();
                return;
            }
            st.pending = true;
            if st.busy < st.num_threads || st.num_threads >= self.max_threads {
                return;
            }
            st.num_threads += 1;
            st.next_id += 1;
            st.next_id
        };

        let name = format!("{}-{}", self.name_prefix, id);
        let pool = Arc::clone(self);
        let manager = Weak::clone(manager);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || Worker { pool, manager }.run());
        match spawned {
            Ok(_) => {
                self.spawned.fetch_add(1, Ordering::Relaxed);
                debug!(worker = %name, "worker spawned");
            }
            Err(e) => {
                self.state.lock().num_threads -= 1;
                error!(worker = %name, error = %e, "failed to spawn worker thread");
            }
        }
    }

    /// Stop handing out work. Running jobs finish; their threads exit after.
    pub(crate) fn shutdown(&self) {
        let mut st = self.state.lock();
        if st.shutdown {
            return;
        }
        st.shutdown = true;
        self.wake.notify_all();
        debug!(threads = st.num_threads, "worker pool shut down");
    }

    /// Find the next job for the calling worker. `None` means the worker
    /// should exit; it has already been removed from the pool.
    fn start_job(&self, manager: &Weak<ManagerInner>, me: ThreadId) -> Option<(Arc<ManagerInner>, Job)> {
        {
            let mut st = self.state.lock();
            if st.shutdown {
                st.num_threads -= 1;
                return None;
            }
            st.busy += 1;
        }
        let mut idle_since = Instant::now();
        loop {
            let hint = {
                let inner = match manager.upgrade() {
                    Some(inner) if inner.is_active() => inner,
                    _ => return self.exit(),
                };
                if let Some(job) = inner.start_job() {
                    if let Some(rule) = job.rule() {
                        inner.lock_manager.add_rule_thread(me, &rule);
                    }
                    // More work is ready; get another worker onto it.
                    if inner.sleep_hint() == Some(Duration::ZERO) {
                        inner.pool.job_queued(&Arc::downgrade(&inner));
                    }
                    return Some((inner, job));
                }
                inner.sleep_hint()
            };

            let mut st = self.state.lock();
            if st.shutdown {
                return self.exit_locked(&mut st);
            }
            if std::mem::take(&mut st.pending) {
                continue;
            }
            if idle_since.elapsed() >= self.best_before && st.num_threads > self.min_threads {
                trace!(threads = st.num_threads, "idle worker retiring");
                self.retired.fetch_add(1, Ordering::Relaxed);
                return self.exit_locked(&mut st);
            }
            let nap = match hint {
                Some(h) if h.is_zero() => self.max_wait_interval,
                Some(h) => h.min(self.best_before),
                None => self.best_before,
            };
            st.busy -= 1;
            st.sleeping += 1;
            let woken = !self.wake.wait_for(&mut st, nap).timed_out();
            st.sleeping -= 1;
            st.busy += 1;
            if woken {
                idle_since = Instant::now();
            }
        }
    }

    fn exit(&self) -> Option<(Arc<ManagerInner>, Job)> {
        let mut st = self.state.lock();
        self.exit_locked(&mut st)
    }

    fn exit_locked(&self, st: &mut PoolState) -> Option<(Arc<ManagerInner>, Job)> {
        st.busy -= 1;
        st.num_threads -= 1;
        None
    }

    /// The calling worker finished `job` with `result`.
    fn end_job(&self, inner: &ManagerInner, job: &Job, result: JobStatus, me: ThreadId) {
        self.state.lock().busy -= 1;
        if let Some(rule) = job.rule() {
            inner.lock_manager.remove_lock_completely(me, &rule);
        }
        inner.end_job(job, result, true);
        inner.implicit.end_job(inner, job);
    }
}

struct Worker {
    pool: Arc<WorkerPool>,
    manager: Weak<ManagerInner>,
}

impl Worker {
    fn run(self) {
        let me = thread::current().id();
        while let Some((inner, job)) = self.pool.start_job(&self.manager, me) {
            let manager = JobManager { inner };
            let monitor = manager.inner.job_monitor(&job);
            let started = Instant::now();

            let ctx = JobContext::new(&manager, &job, Arc::clone(&monitor));
            let result = panic::catch_unwind(AssertUnwindSafe(|| job.run(&ctx))).unwrap_or_else(|payload| {
                let msg = panic_message(payload.as_ref());
                error!(job = %job, panic = %msg, "job panicked");
                JobStatus::error(format!("job panicked: {msg}"))
            });
            monitor.done();

            let elapsed = started.elapsed();
            manager
                .inner
                .metrics
                .write()
                .record_execution(job.name(), elapsed, result.severity);
            debug!(job = %job, status = %result, elapsed_ms = elapsed.as_millis() as u64, "job finished");

            self.pool.end_job(&manager.inner, &job, result, me);
        }
        trace!("worker exiting");
    }
}
