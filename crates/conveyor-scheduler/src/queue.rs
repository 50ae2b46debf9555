//! Ready queue for jobs whose requirements have succeeded.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// A job waiting for a free slot.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub name: String,
    /// Position in the workflow's job list.
    pub order: usize,
    pub queued_at: DateTime<Utc>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earlier declared first; BinaryHeap is a max-heap.
        other
            .order
            .cmp(&self.order)
            .then_with(|| other.queued_at.cmp(&self.queued_at))
    }
}

/// Ready jobs plus the set currently running, bounded by `max_parallel`.
#[derive(Debug)]
pub struct ReadyQueue {
    ready: BinaryHeap<QueuedJob>,
    running: HashSet<String>,
    max_parallel: usize,
}

impl ReadyQueue {
    /// A `max_parallel` of zero is treated as one.
    pub fn new(max_parallel: usize) -> Self {
        Self {
            ready: BinaryHeap::new(),
            running: HashSet::new(),
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, order: usize) {
        self.ready.push(QueuedJob {
            name: name.into(),
            order,
            queued_at: Utc::now(),
        });
    }

    /// Take the earliest declared ready job if a slot is free.
    pub fn next(&mut self) -> Option<QueuedJob> {
        if self.running.len() >= self.max_parallel {
            return None;
        }
        let job = self.ready.pop()?;
        self.running.insert(job.name.clone());
        Some(job)
    }

    /// Free the slot held by `name`.
    pub fn complete(&mut self, name: &str) -> bool {
        self.running.remove(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.contains(name)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.ready.len()
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.running.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declaration_order() {
        let mut queue = ReadyQueue::new(4);
        queue.push("test-alpine", 7);
        queue.push("lint-git", 0);
        queue.push("build", 1);

        let order: Vec<String> = std::iter::from_fn(|| queue.next().map(|j| j.name)).collect();
        assert_eq!(order, vec!["lint-git", "build", "test-alpine"]);
    }

    #[test]
    fn test_concurrency_cap() {
        let mut queue = ReadyQueue::new(2);
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            queue.push(*name, i);
        }

        assert_eq!(queue.next().unwrap().name, "a");
        assert_eq!(queue.next().unwrap().name, "b");
        assert!(queue.next().is_none());
        assert_eq!(queue.running_count(), 2);
        assert_eq!(queue.pending_count(), 1);

        assert!(queue.complete("a"));
        assert!(!queue.is_running("a"));
        assert_eq!(queue.next().unwrap().name, "c");
        assert!(!queue.is_idle());

        queue.complete("b");
        queue.complete("c");
        assert!(queue.is_idle());
    }

    #[test]
    fn test_zero_parallelism_is_one() {
        let mut queue = ReadyQueue::new(0);
        assert_eq!(queue.max_parallel(), 1);
        queue.push("a", 0);
        queue.push("b", 1);
        assert!(queue.next().is_some());
        assert!(queue.next().is_none());
    }

    #[test]
    fn test_complete_unknown_job() {
        let mut queue = ReadyQueue::new(1);
        assert!(!queue.complete("ghost"));
    }
}
