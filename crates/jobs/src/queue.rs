//! Handle-based job queues and blocked chains.
//!
//! Queues hold [`QueueEntry`] snapshots keyed by [`JobId`]; the doubly linked
//! order lives in the queue's own node map rather than on the jobs, so a job
//! is linked iff the queue has a node for it.

use std::collections::HashMap;

use tracing::error;

use crate::job::JobId;
use crate::rule::{rules_conflict, Rule};

/// What a queue needs to know about a job to order it.
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    pub(crate) id: JobId,
    /// Earlier start time means higher priority.
    pub(crate) start_time: i64,
    pub(crate) wait_stamp: Option<u64>,
    pub(crate) rule: Option<Rule>,
}

#[derive(Debug)]
struct Node {
    entry: QueueEntry,
    /// Neighbor closer to the head (dequeued sooner).
    ahead: Option<JobId>,
    /// Neighbor closer to the tail.
    behind: Option<JobId>,
}

/// Priority queue with FIFO tie-break. The head is the next job to run.
#[derive(Debug)]
pub(crate) struct JobQueue {
    nodes: HashMap<JobId, Node>,
    head: Option<JobId>,
    tail: Option<JobId>,
    allow_conflict_overtaking: bool,
    allow_priority_overtaking: bool,
}

impl JobQueue {
    pub(crate) fn new(allow_conflict_overtaking: bool, allow_priority_overtaking: bool) -> Self {
        Self {
            nodes: HashMap::new(),
            head: None,
            tail: None,
            allow_conflict_overtaking,
            allow_priority_overtaking,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn contains(&self, id: JobId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub(crate) fn peek(&self) -> Option<&QueueEntry> {
        let id = self.head?;
        let node = self.nodes.get(&id);
        if node.is_none() {
            error!(job = id, "queue head points at a missing node");
        }
        node.map(|n| &n.entry)
    }

    pub(crate) fn dequeue(&mut self) -> Option<QueueEntry> {
        let id = self.head?;
        self.remove(id)
    }

    /// Insert behind every entry the new one may not overtake.
    pub(crate) fn enqueue(&mut self, entry: QueueEntry) {
        if self.contains(entry.id) {
            error!(job = entry.id, "job enqueued twice, relinking");
            self.remove(entry.id);
        }

        let mut ahead = self.tail;
        while let Some(id) = ahead {
            let Some(node) = self.nodes.get(&id) else {
                error!(job = id, "queue link points at a missing node, appending at tail");
                ahead = self.tail;
                break;
            };
            if !self.can_overtake(&entry, &node.entry) {
                break;
            }
            ahead = node.ahead;
        }

        let behind = match ahead {
            Some(id) => self.nodes.get(&id).and_then(|n| n.behind),
            None => self.head,
        };
        let id = entry.id;
        self.nodes.insert(id, Node { entry, ahead, behind });

        match ahead {
            Some(a) => self.link(a, |n| n.behind = Some(id)),
            None => self.head = Some(id),
        }
        match behind {
            Some(b) => self.link(b, |n| n.ahead = Some(id)),
            None => self.tail = Some(id),
        }
    }

    pub(crate) fn remove(&mut self, id: JobId) -> Option<QueueEntry> {
        let node = self.nodes.remove(&id)?;
        match node.ahead {
            Some(a) => self.link(a, |n| n.behind = node.behind),
            None => self.head = node.behind,
        }
        match node.behind {
            Some(b) => self.link(b, |n| n.ahead = node.ahead),
            None => self.tail = node.ahead,
        }
        Some(node.entry)
    }

    /// Re-position an entry after its ordering key changed.
    pub(crate) fn resort(&mut self, entry: QueueEntry) {
        self.remove(entry.id);
        self.enqueue(entry);
    }

    /// Entries from head to tail.
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    pub(crate) fn ids(&self) -> Vec<JobId> {
        self.iter().map(|e| e.id).collect()
    }

    pub(crate) fn clear(&mut self) -> Vec<JobId> {
        let ids = self.ids();
        self.nodes.clear();
        self.head = None;
        self.tail = None;
        ids
    }

    fn link(&mut self, id: JobId, f: impl FnOnce(&mut Node)) {
        match self.nodes.get_mut(&id) {
            Some(node) => f(node),
            None => error!(job = id, "queue link points at a missing node"),
        }
    }

    fn can_overtake(&self, new: &QueueEntry, existing: &QueueEntry) -> bool {
        // A re-queued job goes back to where it originally stood.
        if let (Some(n), Some(e)) = (new.wait_stamp, existing.wait_stamp) {
            if n < e {
                return true;
            }
        }
        if !self.allow_priority_overtaking || new.start_time >= existing.start_time {
            return false;
        }
        self.allow_conflict_overtaking || !rules_conflict(new.rule.as_ref(), existing.rule.as_ref())
    }
}

pub(crate) struct Iter<'a> {
    queue: &'a JobQueue,
    cursor: Option<JobId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a QueueEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let Some(node) = self.queue.nodes.get(&id) else {
            error!(job = id, "queue link points at a missing node, truncating walk");
            self.cursor = None;
            return None;
        };
        self.cursor = node.behind;
        Some(&node.entry)
    }
}

// ── Blocked chains ──────────────────────────────────────────────────

/// Jobs parked behind a running unit, in the order they were blocked.
///
/// A job blocked behind an already-blocked job joins the chain of that job's
/// root, so one chain is released when its root leaves RUNNING.
#[derive(Debug, Default)]
pub(crate) struct BlockedChains {
    chains: HashMap<JobId, Vec<JobId>>,
    root_of: HashMap<JobId, JobId>,
}

impl BlockedChains {
    pub(crate) fn add_last(&mut self, blocker: JobId, job: JobId) {
        let root = self.root_of.get(&blocker).copied().unwrap_or(blocker);
        self.chains.entry(root).or_default().push(job);
        self.root_of.insert(job, root);
    }

    /// Unlink a blocked job from whatever chain holds it.
    pub(crate) fn remove(&mut self, job: JobId) -> bool {
        let Some(root) = self.root_of.remove(&job) else {
            return false;
        };
        if let Some(chain) = self.chains.get_mut(&root) {
            chain.retain(|&id| id != job);
            if chain.is_empty() {
                self.chains.remove(&root);
            }
        }
        true
    }

    /// Detach and return everything blocked behind `root`.
    pub(crate) fn take_chain(&mut self, root: JobId) -> Vec<JobId> {
        let chain = self.chains.remove(&root).unwrap_or_default();
        for id in &chain {
            self.root_of.remove(id);
        }
        chain
    }

    pub(crate) fn chain(&self, root: JobId) -> &[JobId] {
        self.chains.get(&root).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn first_behind(&self, root: JobId) -> Option<JobId> {
        self.chain(root).first().copied()
    }

    pub(crate) fn is_blocked(&self, job: JobId) -> bool {
        self.root_of.contains_key(&job)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::ExclusiveRule;

    fn entry(id: JobId, start_time: i64, wait_stamp: Option<u64>) -> QueueEntry {
        QueueEntry {
            id,
            start_time,
            wait_stamp,
            rule: None,
        }
    }

    #[test]
    fn earlier_start_dequeues_first() {
        let mut q = JobQueue::new(false, true);
        q.enqueue(entry(1, 100, Some(1)));
        q.enqueue(entry(2, 50, Some(2)));
        q.enqueue(entry(3, 0, Some(3)));
        assert_eq!(q.ids(), vec![3, 2, 1]);
        assert_eq!(q.dequeue().unwrap().id, 3);
        assert_eq!(q.peek().unwrap().id, 2);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut q = JobQueue::new(false, true);
        for id in 1..=4 {
            q.enqueue(entry(id, 10, Some(id)));
        }
        assert_eq!(q.ids(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn conflicting_job_does_not_overtake_without_permission() {
        let rule = ExclusiveRule::shared("r");
        let mut q = JobQueue::new(false, true);
        q.enqueue(QueueEntry {
            rule: Some(rule.clone()),
            ..entry(1, 100, Some(1))
        });
        q.enqueue(QueueEntry {
            rule: Some(rule.clone()),
            ..entry(2, 0, Some(2))
        });
        assert_eq!(q.ids(), vec![1, 2]);

        let mut overtaking = JobQueue::new(true, true);
        overtaking.enqueue(QueueEntry {
            rule: Some(rule.clone()),
            ..entry(1, 100, Some(1))
        });
        overtaking.enqueue(QueueEntry {
            rule: Some(rule),
            ..entry(2, 0, Some(2))
        });
        assert_eq!(overtaking.ids(), vec![2, 1]);
    }

    #[test]
    fn requeued_job_keeps_original_position() {
        let mut q = JobQueue::new(false, true);
        q.enqueue(entry(2, 10, Some(2)));
        q.enqueue(entry(3, 10, Some(3)));
        // Job 1 was queued first, then blocked, and is now coming back with a
        // later start time than its peers.
        q.enqueue(entry(1, 500, Some(1)));
        assert_eq!(q.ids(), vec![1, 2, 3]);
    }

    #[test]
    fn fifo_queue_ignores_priority() {
        let mut q = JobQueue::new(false, false);
        q.enqueue(entry(1, 100, None));
        q.enqueue(entry(2, 0, None));
        assert_eq!(q.ids(), vec![1, 2]);
    }

    #[test]
    fn remove_and_resort_relink() {
        let mut q = JobQueue::new(false, true);
        q.enqueue(entry(1, 10, Some(1)));
        q.enqueue(entry(2, 20, Some(2)));
        q.enqueue(entry(3, 30, Some(3)));

        assert!(q.remove(2).is_some());
        assert!(q.remove(2).is_none());
        assert_eq!(q.ids(), vec![1, 3]);

        q.resort(entry(3, 0, None));
        assert_eq!(q.ids(), vec![3, 1]);

        assert_eq!(q.clear(), vec![3, 1]);
        assert!(q.is_empty());
        assert!(q.peek().is_none());
    }

    #[test]
    fn duplicate_enqueue_relinks() {
        let mut q = JobQueue::new(false, true);
        q.enqueue(entry(1, 10, Some(1)));
        q.enqueue(entry(2, 20, Some(2)));
        q.enqueue(entry(1, 30, None));
        assert_eq!(q.ids(), vec![2, 1]);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn dangling_links_are_logged_not_fatal() {
        let mut q = JobQueue::new(false, true);
        q.enqueue(entry(1, 10, Some(1)));
        q.enqueue(entry(2, 20, Some(2)));
        q.enqueue(entry(3, 30, Some(3)));
        q.nodes.remove(&2);

        assert_eq!(q.ids(), vec![1]);
        // Walking back from the tail runs into the missing node.
        q.enqueue(entry(4, 0, Some(4)));
        assert!(q.contains(4));
        assert_eq!(q.len(), 3);
        assert_eq!(q.tail, Some(4));

        q.nodes.remove(&1);
        assert!(q.peek().is_none());
        assert!(q.ids().is_empty());
    }

    #[test]
    fn blocked_chain_joins_root() {
        let mut chains = BlockedChains::default();
        chains.add_last(10, 1);
        // Blocked behind job 1, which is itself blocked behind 10.
        chains.add_last(1, 2);
        assert_eq!(chains.chain(10), &[1, 2]);
        assert_eq!(chains.first_behind(10), Some(1));
        assert!(chains.is_blocked(2));

        assert!(chains.remove(1));
        assert_eq!(chains.chain(10), &[2]);

        assert_eq!(chains.take_chain(10), vec![2]);
        assert!(!chains.is_blocked(2));
        assert!(chains.is_empty());
    }
}
