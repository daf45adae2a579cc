//! Dispatch queue for queued tasks.
//!
//! Tasks dispatch in priority order (urgent > high > medium > low), FIFO
//! within a band. Entries carry an optional eligibility time so tasks in
//! retry backoff are passed over without losing their place in the band.

use crate::task::{TaskId, TaskPriority};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

/// One queued task reference.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedEntry {
    priority: TaskPriority,
    /// Monotonic submission sequence for FIFO within a priority band.
    seq: u64,
    task_id: TaskId,
    /// Earliest dispatch time, if the task is backing off.
    not_before: Option<Instant>,
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: higher priority wins, then lower seq
        // (earlier submission) within a band.
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority dispatch queue.
pub struct TaskQueue {
    /// Pending entries.
    heap: Mutex<BinaryHeap<QueuedEntry>>,
    /// Submission sequence counter.
    seq: AtomicU64,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.heap.try_lock().map(|h| h.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self { heap: Mutex::new(BinaryHeap::new()), seq: AtomicU64::new(0) }
    }

    /// Enqueues a task for immediate dispatch.
    pub async fn push(&self, task_id: TaskId, priority: TaskPriority) {
        self.push_after(task_id, priority, None).await;
    }

    /// Enqueues a task that may not dispatch before the given time.
    pub async fn push_after(
        &self,
        task_id: TaskId,
        priority: TaskPriority,
        not_before: Option<Instant>,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = %task_id, priority = %priority, seq = seq, "Enqueueing task");

        let mut heap = self.heap.lock().await;
        heap.push(QueuedEntry { priority, seq, task_id, not_before });
    }

    /// Pops the highest-priority task that is eligible at `now`.
    ///
    /// Entries still in backoff are skipped and retained; eligibility never
    /// reorders a band, it only defers entries.
    pub async fn pop_eligible(&self, now: Instant) -> Option<TaskId> {
        let mut heap = self.heap.lock().await;
        let mut deferred = Vec::new();
        let mut found = None;

        while let Some(entry) = heap.pop() {
            match entry.not_before {
                Some(at) if at > now => deferred.push(entry),
                _ => {
                    found = Some(entry.task_id);
                    break;
                }
            }
        }

        for entry in deferred {
            heap.push(entry);
        }
        found
    }

    /// Returns the number of pending entries.
    pub async fn len(&self) -> usize {
        let heap = self.heap.lock().await;
        heap.len()
    }

    /// Returns `true` if no entries are pending.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_priority_ordering() {
        let queue = TaskQueue::new();
        let low = TaskId::new();
        let urgent = TaskId::new();
        let medium = TaskId::new();

        queue.push(low, TaskPriority::Low).await;
        queue.push(urgent, TaskPriority::Urgent).await;
        queue.push(medium, TaskPriority::Medium).await;

        let now = Instant::now();
        assert_eq!(queue.pop_eligible(now).await, Some(urgent));
        assert_eq!(queue.pop_eligible(now).await, Some(medium));
        assert_eq!(queue.pop_eligible(now).await, Some(low));
        assert_eq!(queue.pop_eligible(now).await, None);
    }

    #[tokio::test]
    async fn test_fifo_within_band() {
        let queue = TaskQueue::new();
        let first = TaskId::new();
        let second = TaskId::new();
        let third = TaskId::new();

        queue.push(first, TaskPriority::High).await;
        queue.push(second, TaskPriority::High).await;
        queue.push(third, TaskPriority::High).await;

        let now = Instant::now();
        assert_eq!(queue.pop_eligible(now).await, Some(first));
        assert_eq!(queue.pop_eligible(now).await, Some(second));
        assert_eq!(queue.pop_eligible(now).await, Some(third));
    }

    #[tokio::test]
    async fn test_backoff_defers_without_blocking_band() {
        let queue = TaskQueue::new();
        let backing_off = TaskId::new();
        let ready = TaskId::new();

        let now = Instant::now();
        queue
            .push_after(backing_off, TaskPriority::Urgent, Some(now + Duration::from_secs(5)))
            .await;
        queue.push(ready, TaskPriority::Low).await;

        // The urgent entry is deferred; the low one dispatches.
        assert_eq!(queue.pop_eligible(now).await, Some(ready));
        assert_eq!(queue.pop_eligible(now).await, None);
        assert_eq!(queue.len().await, 1);

        // Once eligible, the deferred entry dispatches.
        assert_eq!(
            queue.pop_eligible(now + Duration::from_secs(6)).await,
            Some(backing_off)
        );
    }

    #[tokio::test]
    async fn test_len_and_empty() {
        let queue = TaskQueue::new();
        assert!(queue.is_empty().await);
        queue.push(TaskId::new(), TaskPriority::Medium).await;
        assert_eq!(queue.len().await, 1);
    }
}
