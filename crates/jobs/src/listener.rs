//! Job change notifications.
//!
//! Listeners are third-party code: they are always called outside the
//! manager lock, and a panicking listener is logged and skipped so delivery
//! to the remaining listeners continues.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::error;

use crate::job::Job;
use crate::status::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Scheduled,
    Awake,
    Sleeping,
    AboutToRun,
    Running,
    Done,
}

#[derive(Debug, Clone)]
pub struct JobChangeEvent {
    pub kind: JobEventKind,
    pub job: Job,
    /// Requested delay, for `Scheduled` events.
    pub delay: Option<Duration>,
    /// Completion status, for `Done` events.
    pub result: Option<JobStatus>,
    /// The job is about to be scheduled again.
    pub reschedule: bool,
    /// Set on the `Done` event of the job that completed its group.
    pub group_result: Option<JobStatus>,
}

impl JobChangeEvent {
    pub(crate) fn new(kind: JobEventKind, job: Job) -> Self {
        Self {
            kind,
            job,
            delay: None,
            result: None,
            reschedule: false,
            group_result: None,
        }
    }
}

/// Observer of job lifecycle transitions. Every method defaults to a no-op.
pub trait JobChangeListener: Send + Sync {
    fn scheduled(&self, _event: &JobChangeEvent) {}

    fn awake(&self, _event: &JobChangeEvent) {}

    fn sleeping(&self, _event: &JobChangeEvent) {}

    /// The job was selected and will run unless a listener cancels it.
    fn about_to_run(&self, _event: &JobChangeEvent) {}

    fn running(&self, _event: &JobChangeEvent) {}

    fn done(&self, _event: &JobChangeEvent) {}
}

/// Copy-on-read list of global listeners.
#[derive(Default)]
pub(crate) struct ListenerList {
    listeners: RwLock<Vec<Arc<dyn JobChangeListener>>>,
}

impl ListenerList {
    pub(crate) fn add(&self, listener: Arc<dyn JobChangeListener>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub(crate) fn remove(&self, listener: &Arc<dyn JobChangeListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn JobChangeListener>> {
        self.listeners.read().clone()
    }
}

/// Deliver `event` to job-local listeners first, then global ones.
/// Returns how many listeners panicked.
pub(crate) fn deliver(global: &[Arc<dyn JobChangeListener>], event: &JobChangeEvent) -> usize {
    let local = event.job.listeners();
    let outcomes: Vec<Result<(), String>> = local
        .iter()
        .chain(global.iter())
        .map(|listener| {
            panic::catch_unwind(AssertUnwindSafe(|| dispatch(listener.as_ref(), event)))
                .map_err(|payload| panic_message(payload.as_ref()))
        })
        .collect();

    outcomes
        .into_iter()
        .filter_map(Result::err)
        .inspect(|msg| {
            error!(job = %event.job, event = ?event.kind, panic = %msg, "job change listener panicked");
        })
        .count()
}

fn dispatch(listener: &dyn JobChangeListener, event: &JobChangeEvent) {
    match event.kind {
        JobEventKind::Scheduled => listener.scheduled(event),
        JobEventKind::Awake => listener.awake(event),
        JobEventKind::Sleeping => listener.sleeping(event),
        JobEventKind::AboutToRun => listener.about_to_run(event),
        JobEventKind::Running => listener.running(event),
        JobEventKind::Done => listener.done(event),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting {
        done: AtomicUsize,
    }

    impl JobChangeListener for Counting {
        fn done(&self, _event: &JobChangeEvent) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Exploding;

    impl JobChangeListener for Exploding {
        fn done(&self, _event: &JobChangeEvent) {
            panic!("listener bug");
        }
    }

    fn done_event() -> JobChangeEvent {
        JobChangeEvent::new(JobEventKind::Done, Job::new("j", |_| JobStatus::ok()))
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let counting = Arc::new(Counting { done: AtomicUsize::new(0) });
        let listeners: Vec<Arc<dyn JobChangeListener>> =
            vec![Arc::new(Exploding), counting.clone(), Arc::new(Exploding)];

        let failures = deliver(&listeners, &done_event());
        assert_eq!(failures, 2);
        assert_eq!(counting.done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn job_local_listeners_receive_events() {
        let counting = Arc::new(Counting { done: AtomicUsize::new(0) });
        let event = done_event();
        event.job.add_job_change_listener(counting.clone());

        deliver(&[], &event);
        assert_eq!(counting.done.load(Ordering::SeqCst), 1);

        let as_dyn: Arc<dyn JobChangeListener> = counting.clone();
        event.job.remove_job_change_listener(&as_dyn);
        deliver(&[], &event);
        assert_eq!(counting.done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn list_ignores_duplicates() {
        let list = ListenerList::default();
        let listener: Arc<dyn JobChangeListener> = Arc::new(Exploding);
        list.add(listener.clone());
        list.add(listener.clone());
        assert_eq!(list.snapshot().len(), 1);
        list.remove(&listener);
        assert!(list.snapshot().is_empty());
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 7");
    }
}
