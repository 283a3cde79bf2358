use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::detector::LockNode;
use super::LockManager;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
    /// Tickets of waiting threads, granted strictly in arrival order.
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

pub(crate) struct LockInner {
    id: u64,
    manager: Arc<LockManager>,
    state: Mutex<LockState>,
    granted: Condvar,
}

impl LockInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Release every level held by the current owner. Returns the depth
    /// that was held so it can be restored later.
    pub(crate) fn force_release(self: &Arc<Self>) -> u32 {
        let (owner, depth) = {
            let mut st = self.state.lock();
            let held = (st.owner.take(), st.depth);
            st.depth = 0;
            self.granted.notify_all();
            held
        };
        if let Some(owner) = owner {
            let node = LockNode::Lock(Arc::clone(self));
            for _ in 0..depth {
                self.manager.remove_lock_thread(owner, &node);
            }
        }
        depth
    }
}

/// A reentrant, FIFO-fair lock that takes part in deadlock detection.
///
/// Obtain one from [`JobManager::new_lock`](crate::JobManager::new_lock). If
/// waiting for the lock (or for a scheduling rule) would close a cycle, the
/// engine temporarily releases the locks of one thread in the cycle and
/// gives them back before that thread continues.
#[derive(Clone)]
pub struct OrderedLock {
    inner: Arc<LockInner>,
}

impl OrderedLock {
    pub(crate) fn new(manager: Arc<LockManager>) -> Self {
        Self {
            inner: Arc::new(LockInner {
                id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
                manager,
                state: Mutex::new(LockState {
                    owner: None,
                    depth: 0,
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                }),
                granted: Condvar::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<LockInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn node(&self) -> LockNode {
        LockNode::Lock(Arc::clone(&self.inner))
    }

    /// Block until the lock is held by the current thread.
    pub fn acquire(&self) {
        self.acquire_inner(None);
    }

    /// Wait at most `timeout`. Returns whether the lock was obtained.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return self.try_acquire();
        }
        self.acquire_inner(Some(timeout))
    }

    /// Take the lock only if that needs no waiting.
    pub fn try_acquire(&self) -> bool {
        let me = thread::current().id();
        let acquired = {
            let mut st = self.inner.state.lock();
            Self::attempt(&mut st, me)
        };
        if acquired {
            self.inner.manager.add_lock_thread(me, &self.node());
        }
        acquired
    }

    /// Release one level. The lock becomes free when the depth reaches zero.
    pub fn release(&self) {
        let me = thread::current().id();
        {
            let mut st = self.inner.state.lock();
            if st.depth == 0 || st.owner != Some(me) {
                tracing::warn!(lock = self.inner.id, "release of a lock the current thread does not hold");
                return;
            }
            st.depth -= 1;
            if st.depth == 0 {
                st.owner = None;
                self.inner.granted.notify_all();
            }
        }
        self.inner.manager.remove_lock_thread(me, &self.node());
    }

    /// Nesting depth held by the owner, zero if free.
    pub fn depth(&self) -> u32 {
        self.inner.state.lock().depth
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.inner.state.lock().owner
    }

    /// Restore a depth saved by a forced release. Called by the owner right
    /// after re-acquiring the lock.
    pub(crate) fn set_depth(&self, depth: u32) {
        let me = thread::current().id();
        let current = self.inner.state.lock().depth;
        for _ in current..depth {
            self.inner.manager.add_lock_thread(me, &self.node());
        }
        self.inner.state.lock().depth = depth;
    }

    fn attempt(st: &mut LockState, me: ThreadId) -> bool {
        if st.owner == Some(me) {
            st.depth += 1;
            return true;
        }
        if st.owner.is_none() && st.waiters.is_empty() {
            st.owner = Some(me);
            st.depth = 1;
            return true;
        }
        false
    }

    fn acquire_inner(&self, timeout: Option<Duration>) -> bool {
        let me = thread::current().id();
        let ticket = {
            let mut st = self.inner.state.lock();
            if Self::attempt(&mut st, me) {
                drop(st);
                self.inner.manager.add_lock_thread(me, &self.node());
                return true;
            }
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.waiters.push_back(ticket);
            ticket
        };

        // May force-release locks of another thread, possibly this very lock.
        self.inner.manager.add_lock_wait_thread(me, &self.node());

        let deadline = timeout.map(|t| Instant::now() + t);
        let acquired = {
            let mut st = self.inner.state.lock();
            loop {
                if st.owner.is_none() && st.waiters.front() == Some(&ticket) {
                    st.waiters.pop_front();
                    st.owner = Some(me);
                    st.depth = 1;
                    break true;
                }
                match deadline {
                    None => self.inner.granted.wait(&mut st),
                    Some(deadline) => {
                        if self.inner.granted.wait_until(&mut st, deadline).timed_out()
                            && !(st.owner.is_none() && st.waiters.front() == Some(&ticket))
                        {
                            st.waiters.retain(|&t| t != ticket);
                            self.inner.granted.notify_all();
                            break false;
                        }
                    }
                }
            }
        };

        if acquired {
            self.inner.manager.add_lock_thread(me, &self.node());
        } else {
            self.inner.manager.remove_lock_wait_thread(me, &self.node());
        }
        self.inner.manager.resume_suspended_locks(me);
        acquired
    }
}

impl PartialEq for OrderedLock {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for OrderedLock {}

impl fmt::Debug for OrderedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("OrderedLock")
            .field("id", &self.inner.id)
            .field("owner", &st.owner)
            .field("depth", &st.depth)
            .field("waiters", &st.waiters.len())
            .finish()
    }
}
