//! Lock bookkeeping shared by scheduling rules and [`OrderedLock`]s.
//!
//! Every acquire, release and wait of a rule or lock is reported here so the
//! [`DeadlockDetector`](detector::DeadlockDetector) can see waits-for cycles.
//! When a cycle appears the locks of one thread in it are force-released and
//! parked on that thread's suspension stack; the thread takes them back as
//! soon as its own wait ends.
//!
//! If the detector ever reports an inconsistent graph it is switched off for
//! the rest of the manager's life. Scheduling keeps working without it.

pub(crate) mod detector;
mod ordered;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::error::Result;
use crate::listener::panic_message;
use crate::rule::Rule;

use detector::{DeadlockDetector, LockNode};
pub use ordered::OrderedLock;
pub(crate) use ordered::LockInner;

/// A lock taken away from a thread to break a deadlock.
struct SuspendedLock {
    lock: OrderedLock,
    depth: u32,
}

pub struct LockManager {
    /// `None` once detection is disabled.
    detector: Mutex<Option<DeadlockDetector>>,
    /// Per thread, one frame per resolved deadlock.
    suspended: Mutex<HashMap<ThreadId, Vec<Vec<SuspendedLock>>>>,
    deadlocks_resolved: AtomicU64,
}

impl LockManager {
    pub(crate) fn new(detection_enabled: bool) -> Self {
        Self {
            detector: Mutex::new(detection_enabled.then(DeadlockDetector::default)),
            suspended: Mutex::new(HashMap::new()),
            deadlocks_resolved: AtomicU64::new(0),
        }
    }

    /// True while deadlock detection is running.
    pub fn is_enabled(&self) -> bool {
        self.detector.lock().is_some()
    }

    /// True if the current thread holds any rule or ordered lock.
    pub fn is_lock_owner(&self) -> bool {
        let me = thread::current().id();
        self.detector.lock().as_ref().is_some_and(|d| d.owns_locks(me))
    }

    /// True if nothing is held or waited for.
    pub fn is_empty(&self) -> bool {
        self.detector.lock().as_ref().map_or(true, DeadlockDetector::is_empty)
    }

    pub fn deadlocks_resolved(&self) -> u64 {
        self.deadlocks_resolved.load(Ordering::Relaxed)
    }

    pub(crate) fn add_lock_thread(&self, thread: ThreadId, node: &LockNode) {
        self.with_detector("lock_acquired", |d| {
            d.lock_acquired(thread, node);
            Ok(())
        });
    }

    pub(crate) fn remove_lock_thread(&self, thread: ThreadId, node: &LockNode) {
        self.with_detector("lock_released", |d| {
            d.lock_released(thread, node);
            Ok(())
        });
    }

    pub(crate) fn add_rule_thread(&self, thread: ThreadId, rule: &Rule) {
        self.add_lock_thread(thread, &LockNode::rule(rule));
    }

    pub(crate) fn remove_rule_thread(&self, thread: ThreadId, rule: &Rule) {
        self.remove_lock_thread(thread, &LockNode::rule(rule));
    }

    /// A job finished; drop whatever rules its thread still holds.
    pub(crate) fn remove_lock_completely(&self, thread: ThreadId, rule: &Rule) {
        self.with_detector("lock_released_completely", |d| {
            d.lock_released_completely(thread, &LockNode::rule(rule));
            Ok(())
        });
    }

    /// `thread` is about to block on `node`. Breaks any deadlock this causes
    /// before returning.
    pub(crate) fn add_lock_wait_thread(&self, thread: ThreadId, node: &LockNode) {
        let Some(Some(deadlock)) = self.with_detector("lock_wait_start", |d| d.lock_wait_start(thread, node))
        else {
            return;
        };

        warn!(
            threads = ?deadlock.threads,
            candidate = ?deadlock.candidate,
            waiting_for = ?node,
            suspended = deadlock.locks.len(),
            "deadlock detected, suspending locks of one thread"
        );
        // Released outside the detector lock: releasing reports back into it.
        let frame: Vec<SuspendedLock> = deadlock
            .locks
            .into_iter()
            .map(|inner| {
                let depth = inner.force_release();
                SuspendedLock {
                    lock: OrderedLock::from_inner(inner),
                    depth,
                }
            })
            .collect();
        self.suspended
            .lock()
            .entry(deadlock.candidate)
            .or_default()
            .push(frame);
        self.deadlocks_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_rule_wait_thread(&self, thread: ThreadId, rule: &Rule) {
        self.add_lock_wait_thread(thread, &LockNode::rule(rule));
    }

    pub(crate) fn remove_lock_wait_thread(&self, thread: ThreadId, node: &LockNode) {
        self.with_detector("lock_wait_stop", |d| {
            d.lock_wait_stop(thread, node);
            Ok(())
        });
    }

    pub(crate) fn remove_rule_wait_thread(&self, thread: ThreadId, rule: &Rule) {
        self.remove_lock_wait_thread(thread, &LockNode::rule(rule));
    }

    /// Give `thread` back the locks taken from it by the latest deadlock
    /// resolution. Must be called on `thread` itself.
    pub(crate) fn resume_suspended_locks(&self, thread: ThreadId) {
        let frame = {
            let mut suspended = self.suspended.lock();
            let Some(stack) = suspended.get_mut(&thread) else {
                return;
            };
            let frame = stack.pop();
            if stack.is_empty() {
                suspended.remove(&thread);
            }
            frame
        };
        for SuspendedLock { lock, depth } in frame.into_iter().flatten() {
            lock.acquire();
            lock.set_depth(depth);
        }
    }

    /// Run `op` against the detector. Errors and panics switch detection
    /// off; the caller then proceeds as if nothing was detected.
    fn with_detector<T>(&self, op: &str, f: impl FnOnce(&mut DeadlockDetector) -> Result<T>) -> Option<T> {
        let mut guard = self.detector.lock();
        let detector = guard.as_mut()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(detector)));
        let reason = match outcome {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };
        error!(op, graph = ?guard.as_ref(), reason = %reason, "deadlock detection disabled after internal error");
        *guard = None;
        None
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("enabled", &self.is_enabled())
            .field("deadlocks_resolved", &self.deadlocks_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::rule::ExclusiveRule;

    #[test]
    fn disabled_manager_tracks_nothing() {
        let manager = LockManager::new(false);
        manager.add_rule_thread(thread::current().id(), &ExclusiveRule::shared("r"));
        assert!(!manager.is_enabled());
        assert!(!manager.is_lock_owner());
        assert!(manager.is_empty());
    }

    #[test]
    fn rule_ownership_is_tracked() {
        let manager = LockManager::new(true);
        let rule = ExclusiveRule::shared("r");
        let me = thread::current().id();
        manager.add_rule_thread(me, &rule);
        assert!(manager.is_lock_owner());
        manager.remove_lock_completely(me, &rule);
        assert!(!manager.is_lock_owner());
        assert!(manager.is_empty());
    }

    #[test]
    fn rule_only_cycle_disables_detection() {
        let manager = Arc::new(LockManager::new(true));
        let r1 = ExclusiveRule::shared("r1");
        let r2 = ExclusiveRule::shared("r2");
        let other = thread::spawn(|| thread::current().id()).join().unwrap();
        let me = thread::current().id();

        manager.add_rule_thread(me, &r1);
        manager.add_rule_thread(other, &r2);
        manager.add_rule_wait_thread(me, &r2);
        assert!(manager.is_enabled());
        manager.add_rule_wait_thread(other, &r1);
        assert!(!manager.is_enabled());
        assert_eq!(manager.deadlocks_resolved(), 0);
    }

    #[test]
    fn lock_cycle_is_broken_and_locks_resumed() {
        let manager = Arc::new(LockManager::new(true));
        let a = OrderedLock::new(Arc::clone(&manager));
        let b = OrderedLock::new(Arc::clone(&manager));
        let barrier = Arc::new(Barrier::new(2));

        let spawn = |first: OrderedLock, second: OrderedLock, barrier: Arc<Barrier>| {
            thread::spawn(move || {
                first.acquire();
                barrier.wait();
                second.acquire();
                assert_eq!(first.depth(), 1);
                second.release();
                first.release();
            })
        };
        let t1 = spawn(a.clone(), b.clone(), barrier.clone());
        let t2 = spawn(b.clone(), a.clone(), barrier);
        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(manager.deadlocks_resolved(), 1);
        assert!(manager.is_enabled());
        assert!(manager.is_empty());
        assert!(a.owner().is_none());
        assert!(b.owner().is_none());
    }

    #[test]
    fn resume_without_suspension_is_noop() {
        let manager = LockManager::new(true);
        manager.resume_suspended_locks(thread::current().id());
        assert!(manager.is_empty());
    }
}
