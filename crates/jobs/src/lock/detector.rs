//! Thread × lock ownership matrix with cycle detection.
//!
//! Each cell holds how many times a thread acquired a lock (`> 0`),
//! [`WAITING_FOR_LOCK`] if the thread is blocked on it, or [`NO_STATE`].
//! Scheduling rules and [`OrderedLock`](super::OrderedLock)s share the matrix;
//! only ordered locks can be suspended to break a cycle.

use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::error::{JobsError, Result};
use crate::rule::Rule;

use super::ordered::LockInner;

pub(crate) const NO_STATE: i32 = 0;
pub(crate) const WAITING_FOR_LOCK: i32 = -1;

/// Rounds of transitive conflict expansion when a rule is acquired.
const CONFLICT_PASSES: usize = 2;

/// A column of the matrix.
#[derive(Clone)]
pub(crate) enum LockNode {
    Rule(Rule),
    Lock(Arc<LockInner>),
}

impl LockNode {
    pub(crate) fn rule(rule: &Rule) -> Self {
        LockNode::Rule(Arc::clone(rule))
    }

    fn is_lock(&self) -> bool {
        matches!(self, LockNode::Lock(_))
    }

    fn same(&self, other: &LockNode) -> bool {
        match (self, other) {
            (LockNode::Rule(a), LockNode::Rule(b)) => Arc::ptr_eq(a, b),
            (LockNode::Lock(a), LockNode::Lock(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn is_conflicting(&self, other: &LockNode) -> bool {
        match (self, other) {
            (LockNode::Rule(a), LockNode::Rule(b)) => a.is_conflicting(b.as_ref()),
            (LockNode::Lock(a), LockNode::Lock(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for LockNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockNode::Rule(rule) => write!(f, "rule {rule:?}"),
            LockNode::Lock(lock) => write!(f, "lock #{}", lock.id()),
        }
    }
}

/// A detected cycle and how to break it.
pub(crate) struct Deadlock {
    pub(crate) threads: Vec<ThreadId>,
    pub(crate) candidate: ThreadId,
    pub(crate) locks: Vec<Arc<LockInner>>,
}

#[derive(Default)]
pub(crate) struct DeadlockDetector {
    threads: Vec<ThreadId>,
    locks: Vec<LockNode>,
    graph: Vec<Vec<i32>>,
}

impl DeadlockDetector {
    pub(crate) fn is_empty(&self) -> bool {
        self.threads.is_empty() && self.locks.is_empty()
    }

    /// True if `thread` holds at least one lock or rule.
    pub(crate) fn owns_locks(&self, thread: ThreadId) -> bool {
        self.thread_index(thread)
            .is_some_and(|t| self.graph[t].iter().any(|&v| v > NO_STATE))
    }

    /// `owner` now holds `lock`, and implicitly every rule conflicting with it.
    pub(crate) fn lock_acquired(&mut self, owner: ThreadId, lock: &LockNode) {
        let l = self.add_lock(lock);
        let t = self.add_thread(owner);
        if self.graph[t][l] == WAITING_FOR_LOCK {
            self.graph[t][l] = NO_STATE;
        }
        self.graph[t][l] += 1;

        let mut conflicting = vec![l];
        for _ in 0..CONFLICT_PASSES {
            let mut k = 0;
            while k < conflicting.len() {
                let current = conflicting[k];
                for j in 0..self.locks.len() {
                    if !conflicting.contains(&j) && self.locks[current].is_conflicting(&self.locks[j]) {
                        conflicting.push(j);
                        self.graph[t][j] += 1;
                    }
                }
                k += 1;
            }
        }
    }

    /// `owner` released one level of `lock`.
    pub(crate) fn lock_released(&mut self, owner: ThreadId, lock: &LockNode) {
        let (Some(t), Some(l)) = (self.thread_index(owner), self.lock_index(lock)) else {
            return;
        };
        // A suspended lock is marked as waited-for; the forced release clears it.
        if self.graph[t][l] == WAITING_FOR_LOCK {
            self.graph[t][l] = NO_STATE;
            return;
        }
        for j in 0..self.locks.len() {
            let other = &self.locks[j];
            let releases = lock.is_conflicting(other)
                || (!lock.is_lock() && !other.is_lock() && self.graph[t][j] > NO_STATE);
            if releases && self.graph[t][j] > NO_STATE {
                self.graph[t][j] -= 1;
            }
        }
        if self.graph[t][l] == NO_STATE {
            self.reduce_graph(t, lock);
        }
    }

    /// Drop every rule `owner` holds, whatever its depth.
    pub(crate) fn lock_released_completely(&mut self, owner: ThreadId, rule: &LockNode) {
        let (Some(t), Some(_)) = (self.thread_index(owner), self.lock_index(rule)) else {
            return;
        };
        for j in 0..self.locks.len() {
            if !self.locks[j].is_lock() && self.graph[t][j] > NO_STATE {
                self.graph[t][j] = NO_STATE;
            }
        }
        self.reduce_graph(t, rule);
    }

    /// `client` starts waiting for `lock`. Returns the deadlock this creates,
    /// with the chosen candidate's locks already marked as suspended.
    pub(crate) fn lock_wait_start(&mut self, client: ThreadId, lock: &LockNode) -> Result<Option<Deadlock>> {
        self.set_to_wait(client, lock, false)?;
        let l = self
            .lock_index(lock)
            .ok_or_else(|| corrupted(format!("{lock:?} vanished after wait start")))?;
        let mut visited = vec![0u32; self.threads.len()];
        if !self.check_wait_cycles(&mut visited, l) {
            return Ok(None);
        }

        let threads = self.threads_in_deadlock(client);
        let candidate = self.resolution_candidate(&threads)?;
        let locks = self.real_locks_for_thread(candidate)?;
        for lock in &locks {
            self.set_to_wait(candidate, &LockNode::Lock(Arc::clone(lock)), true)?;
        }
        Ok(Some(Deadlock {
            threads,
            candidate,
            locks,
        }))
    }

    /// `owner` stopped waiting for `lock` without getting it.
    pub(crate) fn lock_wait_stop(&mut self, owner: ThreadId, lock: &LockNode) {
        let (Some(t), Some(l)) = (self.thread_index(owner), self.lock_index(lock)) else {
            return;
        };
        if self.graph[t][l] != WAITING_FOR_LOCK {
            return;
        }
        self.graph[t][l] = NO_STATE;
        self.reduce_graph(t, lock);
    }

    // ── Matrix maintenance ──────────────────────────────────────────

    fn thread_index(&self, thread: ThreadId) -> Option<usize> {
        self.threads.iter().position(|&t| t == thread)
    }

    fn lock_index(&self, lock: &LockNode) -> Option<usize> {
        self.locks.iter().position(|l| l.same(lock))
    }

    fn add_thread(&mut self, thread: ThreadId) -> usize {
        if let Some(t) = self.thread_index(thread) {
            return t;
        }
        self.threads.push(thread);
        self.graph.push(vec![NO_STATE; self.locks.len()]);
        self.threads.len() - 1
    }

    fn add_lock(&mut self, lock: &LockNode) -> usize {
        if let Some(l) = self.lock_index(lock) {
            return l;
        }
        self.locks.push(lock.clone());
        for row in &mut self.graph {
            row.push(NO_STATE);
        }
        self.locks.len() - 1
    }

    fn set_to_wait(&mut self, owner: ThreadId, lock: &LockNode, suspend: bool) -> Result<()> {
        let (t, l) = if suspend {
            match (self.thread_index(owner), self.lock_index(lock)) {
                (Some(t), Some(l)) => (t, l),
                _ => return Err(corrupted(format!("suspending {lock:?} that is not in the graph"))),
            }
        } else {
            (self.add_thread(owner), self.add_lock(lock))
        };
        self.graph[t][l] = WAITING_FOR_LOCK;
        // A thread waiting on a new rule must see the owners of every rule
        // it conflicts with as owners of the new rule too.
        if !suspend && !lock.is_lock() {
            self.fill_present_entries(lock, l);
        }
        Ok(())
    }

    fn fill_present_entries(&mut self, lock: &LockNode, l: usize) {
        for j in 0..self.locks.len() {
            if j != l && lock.is_conflicting(&self.locks[j]) {
                for row in &mut self.graph {
                    if row[j] > NO_STATE && row[l] == NO_STATE {
                        row[l] = row[j];
                    }
                }
            }
        }
        for j in 0..self.locks.len() {
            if j != l && lock.is_conflicting(&self.locks[j]) {
                for row in &mut self.graph {
                    if row[l] > NO_STATE && row[j] == NO_STATE {
                        row[j] = row[l];
                    }
                }
            }
        }
    }

    /// Remove columns nobody references any more, and the row of a thread
    /// that holds and waits for nothing.
    fn reduce_graph(&mut self, row: usize, lock: &LockNode) {
        let mut empty_columns: Vec<bool> = self
            .locks
            .iter()
            .map(|l| lock.is_conflicting(l) || !l.is_lock())
            .collect();
        for (j, empty) in empty_columns.iter_mut().enumerate() {
            if *empty && self.graph.iter().any(|r| r[j] != NO_STATE) {
                *empty = false;
            }
        }
        let row_empty = self.graph[row].iter().all(|&v| v == NO_STATE);
        let any_empty = empty_columns.iter().any(|&e| e);
        if !any_empty && !row_empty {
            return;
        }

        for j in (0..empty_columns.len()).rev() {
            if empty_columns[j] {
                self.locks.remove(j);
                for r in &mut self.graph {
                    r.remove(j);
                }
            }
        }
        if row_empty {
            self.threads.remove(row);
            self.graph.remove(row);
        }
    }

    // ── Cycle search ────────────────────────────────────────────────

    /// Depth-first walk from the owners of lock `l` along waits-for edges.
    fn check_wait_cycles(&self, visited: &mut [u32], l: usize) -> bool {
        for i in 0..self.graph.len() {
            if self.graph[i][l] > NO_STATE {
                if visited[i] > 0 {
                    return true;
                }
                visited[i] += 1;
                for j in 0..self.graph[i].len() {
                    if self.graph[i][j] == WAITING_FOR_LOCK && self.check_wait_cycles(visited, j) {
                        return true;
                    }
                }
                visited[i] -= 1;
            }
        }
        false
    }

    fn threads_in_deadlock(&self, cause: ThreadId) -> Vec<ThreadId> {
        let mut threads = Vec::new();
        if self.owns_locks(cause) {
            threads.push(cause);
        }
        self.add_cycle_threads(&mut threads, cause);
        threads
    }

    fn add_cycle_threads(&self, threads: &mut Vec<ThreadId>, next: ThreadId) -> bool {
        let blocking = self.blocking_threads(next);
        let mut in_cycle = false;
        for thread in blocking {
            if threads.contains(&thread) {
                in_cycle = true;
            } else {
                threads.push(thread);
                if self.add_cycle_threads(threads, thread) {
                    in_cycle = true;
                } else {
                    threads.retain(|&t| t != thread);
                }
            }
        }
        in_cycle
    }

    /// Owners of the lock `current` waits for.
    fn blocking_threads(&self, current: ThreadId) -> Vec<ThreadId> {
        let Some(t) = self.thread_index(current) else {
            return Vec::new();
        };
        let Some(l) = self.graph[t].iter().position(|&v| v == WAITING_FOR_LOCK) else {
            return Vec::new();
        };
        self.graph
            .iter()
            .zip(&self.threads)
            .filter(|(row, _)| row[l] > NO_STATE)
            .map(|(_, &thread)| thread)
            .collect()
    }

    fn held(&self, thread: ThreadId, rules: bool) -> usize {
        let Some(t) = self.thread_index(thread) else {
            return 0;
        };
        self.graph[t]
            .iter()
            .zip(&self.locks)
            .filter(|(&v, lock)| v > NO_STATE && lock.is_lock() != rules)
            .count()
    }

    /// Prefer a thread holding no rules, then any thread holding ordered
    /// locks; within each tier the fewest held locks wins, then discovery
    /// order.
    fn resolution_candidate(&self, candidates: &[ThreadId]) -> Result<ThreadId> {
        let fewest = |pool: Vec<ThreadId>| {
            pool.into_iter()
                .enumerate()
                .min_by_key(|&(i, t)| (self.held(t, false), i))
                .map(|(_, t)| t)
        };
        let rule_free: Vec<ThreadId> = candidates
            .iter()
            .copied()
            .filter(|&t| self.held(t, true) == 0 && self.held(t, false) > 0)
            .collect();
        if let Some(t) = fewest(rule_free) {
            return Ok(t);
        }
        let with_locks: Vec<ThreadId> = candidates
            .iter()
            .copied()
            .filter(|&t| self.held(t, false) > 0)
            .collect();
        fewest(with_locks).ok_or_else(|| corrupted("deadlock between scheduling rules only".into()))
    }

    fn real_locks_for_thread(&self, owner: ThreadId) -> Result<Vec<Arc<LockInner>>> {
        let t = self
            .thread_index(owner)
            .ok_or_else(|| corrupted("deadlock candidate is not in the graph".into()))?;
        let locks: Vec<Arc<LockInner>> = self.graph[t]
            .iter()
            .zip(&self.locks)
            .filter(|(&v, _)| v > NO_STATE)
            .filter_map(|(_, lock)| match lock {
                LockNode::Lock(inner) => Some(Arc::clone(inner)),
                LockNode::Rule(_) => None,
            })
            .collect();
        if locks.is_empty() {
            return Err(corrupted("deadlock candidate holds no suspendable locks".into()));
        }
        Ok(locks)
    }
}

fn corrupted(msg: String) -> JobsError {
    JobsError::GraphCorrupted(msg)
}

impl fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("threads", &self.threads)
            .field("locks", &self.locks)
            .field("graph", &self.graph)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::lock::{LockManager, OrderedLock};
    use crate::rule::{ExclusiveRule, PathRule};

    fn thread_ids(n: usize) -> Vec<ThreadId> {
        (0..n)
            .map(|_| thread::spawn(|| thread::current().id()).join().unwrap())
            .collect()
    }

    fn lock_node(manager: &Arc<LockManager>) -> LockNode {
        OrderedLock::new(Arc::clone(manager)).node()
    }

    #[test]
    fn acquire_release_leaves_graph_empty() {
        let t = thread_ids(1)[0];
        let rule = LockNode::rule(&ExclusiveRule::shared("r"));
        let mut d = DeadlockDetector::default();
        d.lock_acquired(t, &rule);
        assert!(d.owns_locks(t));
        d.lock_released(t, &rule);
        assert!(d.is_empty());
    }

    #[test]
    fn nested_acquire_needs_matching_releases() {
        let t = thread_ids(1)[0];
        let manager = Arc::new(LockManager::new(true));
        let lock = lock_node(&manager);
        let mut d = DeadlockDetector::default();
        d.lock_acquired(t, &lock);
        d.lock_acquired(t, &lock);
        d.lock_released(t, &lock);
        assert!(d.owns_locks(t));
        d.lock_released(t, &lock);
        assert!(d.is_empty());
    }

    #[test]
    fn wait_without_cycle_is_not_deadlock() {
        let ids = thread_ids(2);
        let rule = LockNode::rule(&ExclusiveRule::shared("r"));
        let mut d = DeadlockDetector::default();
        d.lock_acquired(ids[0], &rule);
        assert!(d.lock_wait_start(ids[1], &rule).unwrap().is_none());
        d.lock_wait_stop(ids[1], &rule);
        d.lock_released(ids[0], &rule);
        assert!(d.is_empty());
    }

    #[test]
    fn two_lock_cycle_suspends_detecting_thread() {
        let ids = thread_ids(2);
        let manager = Arc::new(LockManager::new(true));
        let a = lock_node(&manager);
        let b = lock_node(&manager);
        let mut d = DeadlockDetector::default();
        d.lock_acquired(ids[0], &a);
        d.lock_acquired(ids[1], &b);
        assert!(d.lock_wait_start(ids[0], &b).unwrap().is_none());

        let deadlock = d.lock_wait_start(ids[1], &a).unwrap().unwrap();
        assert_eq!(deadlock.threads, vec![ids[1], ids[0]]);
        // Both hold one lock and no rules; discovery order breaks the tie.
        assert_eq!(deadlock.candidate, ids[1]);
        assert_eq!(deadlock.locks.len(), 1);
        assert!(LockNode::Lock(Arc::clone(&deadlock.locks[0])).same(&b));
    }

    #[test]
    fn rule_holder_is_not_chosen() {
        let ids = thread_ids(2);
        let manager = Arc::new(LockManager::new(true));
        let lock = lock_node(&manager);
        let rule = LockNode::rule(&ExclusiveRule::shared("r"));
        let mut d = DeadlockDetector::default();

        d.lock_acquired(ids[0], &lock);
        d.lock_acquired(ids[1], &rule);
        assert!(d.lock_wait_start(ids[0], &rule).unwrap().is_none());
        let deadlock = d.lock_wait_start(ids[1], &lock).unwrap().unwrap();
        assert_eq!(deadlock.candidate, ids[0]);
        assert!(LockNode::Lock(Arc::clone(&deadlock.locks[0])).same(&lock));
    }

    #[test]
    fn rule_only_cycle_is_reported_as_corruption() {
        let ids = thread_ids(2);
        let r1 = LockNode::rule(&ExclusiveRule::shared("r1"));
        let r2 = LockNode::rule(&ExclusiveRule::shared("r2"));
        let mut d = DeadlockDetector::default();
        d.lock_acquired(ids[0], &r1);
        d.lock_acquired(ids[1], &r2);
        assert!(d.lock_wait_start(ids[0], &r2).unwrap().is_none());
        let err = d.lock_wait_start(ids[1], &r1).err().unwrap();
        assert!(matches!(err, JobsError::GraphCorrupted(_)));
    }

    #[test]
    fn waiting_on_child_rule_inherits_parent_owner() {
        let ids = thread_ids(2);
        let manager = Arc::new(LockManager::new(true));
        let lock = lock_node(&manager);
        let parent = LockNode::rule(&PathRule::shared("/a"));
        let child = LockNode::rule(&PathRule::shared("/a/b"));
        let mut d = DeadlockDetector::default();

        d.lock_acquired(ids[0], &parent);
        d.lock_acquired(ids[1], &lock);
        assert!(d.lock_wait_start(ids[1], &child).unwrap().is_none());
        let deadlock = d.lock_wait_start(ids[0], &lock).unwrap().unwrap();
        assert_eq!(deadlock.candidate, ids[1]);
    }

    #[test]
    fn releasing_rule_releases_conflicting_entries() {
        let t = thread_ids(1)[0];
        let parent = LockNode::rule(&PathRule::shared("/a"));
        let child = LockNode::rule(&PathRule::shared("/a/b"));
        let mut d = DeadlockDetector::default();
        d.lock_acquired(t, &child);
        d.lock_acquired(t, &parent);
        d.lock_released_completely(t, &parent);
        assert!(d.is_empty());
    }
}
