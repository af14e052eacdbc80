//! Shared priority queue of running tasks.
//!
//! Launchers push freshly spawned processes, the progress poller pops the one with
//! the lowest priority value, services it and pushes it back with an adjusted
//! priority. Ties are broken by command so the order is deterministic.
//!
//! A task may carry a semaphore permit. It is released only when the task is
//! dropped, so a bounded launcher cannot start more processes than permits.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit};
use tokio::time::{timeout_at, Instant};

use super::process::{CommandSpec, ProcessHandle};

/// Priority given to a task when it is first queued.
pub const BASE_PRIORITY: i64 = 10_000;

/// A running process waiting to be serviced.
#[derive(Debug)]
pub struct PendingTask {
    pub priority: i64,
    pub spec: CommandSpec,
    pub handle: ProcessHandle,
    pub permit: Option<OwnedSemaphorePermit>,
}

impl PendingTask {
    pub fn new(priority: i64, handle: ProcessHandle) -> Self {
        Self {
            priority,
            spec: handle.spec().clone(),
            handle,
            permit: None,
        }
    }

    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.spec.cmp(&other.spec))
    }
}

/// Min-priority queue of [`PendingTask`]s shared between producers and the poller.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: Mutex<BinaryHeap<Reverse<PendingTask>>>,
    pushed: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, task: PendingTask) {
        self.heap.lock().await.push(Reverse(task));
        self.pushed.notify_one();
    }

    /// Removes the lowest-priority task, waiting up to `wait` for one to appear.
    pub async fn pop(&self, wait: Duration) -> Option<PendingTask> {
        let deadline = Instant::now() + wait;
        loop {
            let pushed = self.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(Reverse(task)) = self.heap.lock().await.pop() {
                return Some(task);
            }
            if timeout_at(deadline, pushed).await.is_err() {
                return None;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.heap.lock().await.is_empty()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::exec::process::ProcessTracker;
    use std::sync::Arc;

    fn spawn(tag: &str, tracker: &Arc<ProcessTracker>) -> ProcessHandle {
        let spec = CommandSpec::new("sh").args(["-c", "exit 0", tag]);
        ProcessHandle::spawn(&spec, tracker).unwrap()
    }

    #[tokio::test]
    async fn test_pop_returns_lowest_priority_first() {
        let tracker = ProcessTracker::new();
        let queue = TaskQueue::new();
        queue.push(PendingTask::new(BASE_PRIORITY + 10, spawn("late", &tracker))).await;
        queue.push(PendingTask::new(BASE_PRIORITY, spawn("early", &tracker))).await;
        queue.push(PendingTask::new(BASE_PRIORITY + 5, spawn("middle", &tracker))).await;
        assert_eq!(queue.len().await, 3);

        let wait = Duration::from_millis(10);
        let order: Vec<String> = vec![
            queue.pop(wait).await.unwrap().spec.target().to_string(),
            queue.pop(wait).await.unwrap().spec.target().to_string(),
            queue.pop(wait).await.unwrap().spec.target().to_string(),
        ];
        assert_eq!(order, ["early", "middle", "late"]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_ties_break_on_command() {
        let tracker = ProcessTracker::new();
        let queue = TaskQueue::new();
        queue.push(PendingTask::new(BASE_PRIORITY, spawn("b", &tracker))).await;
        queue.push(PendingTask::new(BASE_PRIORITY, spawn("a", &tracker))).await;

        let first = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.spec.target(), "a");
    }

    #[tokio::test]
    async fn test_permit_returns_when_task_is_dropped() {
        let tracker = ProcessTracker::new();
        let queue = TaskQueue::new();
        let permits = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = Arc::clone(&permits).acquire_owned().await.unwrap();
        queue
            .push(PendingTask::new(BASE_PRIORITY, spawn("held", &tracker)).with_permit(permit))
            .await;
        assert_eq!(permits.available_permits(), 0);

        let PendingTask { handle, permit, .. } = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert!(permit.is_some());
        handle.finish().await.unwrap();
        assert_eq!(permits.available_permits(), 0);
        drop(permit);
        assert_eq!(permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let queue = TaskQueue::new();
        let started = std::time::Instant::now();
        assert!(queue.pop(Duration::from_millis(50)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let tracker = ProcessTracker::new();
        let queue = Arc::new(TaskQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(PendingTask::new(BASE_PRIORITY, spawn("x", &tracker))).await;

        let popped = waiter.await.unwrap();
        assert_eq!(popped.map(|t| t.spec.target().to_string()).as_deref(), Some("x"));
    }
}
