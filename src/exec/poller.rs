//! Cooperative polling of queued processes.
//!
//! The poller pops the most urgent task, lets an output handler read whatever the
//! process wrote since the last visit, and either finalizes the task (process exited)
//! or puts it back with an adjusted priority. Between cycles it reports progress and
//! yields for a short pacing interval.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::ProcessError;
use super::queue::{PendingTask, TaskQueue};
use super::runner::{CompletionHandler, OutputHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Polling,
    /// Cancelled; terminating everything left in the queue.
    Draining,
    /// The queue stayed empty for the idle timeout. Normal end of a batch.
    IdleTimeout,
    /// As many tasks as expected have been finalized.
    Done,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// How long an empty queue is waited on before the batch counts as finished.
    pub idle_timeout: Duration,
    /// Pause between polling cycles.
    pub pace: Duration,
    /// How long the drain waits for stragglers once the queue looks empty.
    pub drain_wait: Duration,
    /// Number of tasks published for this batch, if known.
    pub expected: Option<usize>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            pace: Duration::from_millis(500),
            drain_wait: Duration::from_secs(1),
            expected: None,
        }
    }
}

impl PollerConfig {
    pub fn expecting(mut self, expected: usize) -> Self {
        self.expected = Some(expected);
        self
    }
}

/// How a polling pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub state: PollerState,
    pub finalized: usize,
}

type Tick<'a> = &'a (dyn Fn() + Send + Sync);

/// How often an idle poller rechecks the expected count while launches are still
/// being abandoned.
const RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Services every task in a [`TaskQueue`] until the batch is finished.
pub struct ProgressPoller<'a> {
    queue: &'a TaskQueue,
    cancel: CancellationToken,
    config: PollerConfig,
    output: Option<&'a dyn OutputHandler>,
    completion: Option<&'a dyn CompletionHandler>,
    on_tick: Option<Tick<'a>>,
    abandoned: Option<&'a AtomicUsize>,
}

impl<'a> ProgressPoller<'a> {
    pub fn new(queue: &'a TaskQueue, cancel: CancellationToken, config: PollerConfig) -> Self {
        Self {
            queue,
            cancel,
            config,
            output: None,
            completion: None,
            on_tick: None,
            abandoned: None,
        }
    }

    pub fn with_output(mut self, handler: &'a dyn OutputHandler) -> Self {
        self.output = Some(handler);
        self
    }

    pub fn with_completion(mut self, handler: &'a dyn CompletionHandler) -> Self {
        self.completion = Some(handler);
        self
    }

    /// Called after every polling cycle, typically to refresh a progress display.
    pub fn on_tick(mut self, tick: Tick<'a>) -> Self {
        self.on_tick = Some(tick);
        self
    }

    /// Counts tasks that were expected but never reached the queue.
    ///
    /// Launchers feeding the queue while the poller runs bump `abandoned` for every
    /// process that failed to start, so the batch still ends once the rest is done.
    pub fn discounting(mut self, abandoned: &'a AtomicUsize) -> Self {
        self.abandoned = Some(abandoned);
        self
    }

    fn is_done(&self, finalized: usize) -> bool {
        let abandoned = self.abandoned.map_or(0, |n| n.load(Ordering::SeqCst));
        self.config
            .expected
            .is_some_and(|n| finalized + abandoned >= n)
    }

    /// Pops the next task, giving up after the idle timeout or once the batch is done.
    async fn next_task(&self, finalized: usize) -> Option<PendingTask> {
        if self.abandoned.is_none() {
            return self.queue.pop(self.config.idle_timeout).await;
        }
        let deadline = Instant::now() + self.config.idle_timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || self.is_done(finalized) {
                return None;
            }
            if let Some(task) = self.queue.pop(left.min(RECHECK_INTERVAL)).await {
                return Some(task);
            }
        }
    }

    /// Runs until the queue idles out or the expected number of tasks is finalized.
    ///
    /// On cancellation every queued process is terminated before
    /// [`ProcessError::Cancelled`] is returned. Output handler failures other than read
    /// timeouts terminate the offending process and are returned as-is; the rest of the
    /// queue is left to the caller.
    pub async fn run(&self) -> Result<PollOutcome, ProcessError> {
        let mut finalized = 0;
        let mut state = PollerState::Polling;

        while state == PollerState::Polling {
            if self.is_done(finalized) {
                state = PollerState::Done;
                break;
            }

            let popped = tokio::select! {
                popped = self.next_task(finalized) => popped,
                _ = self.cancel.cancelled() => None,
            };
            if self.cancel.is_cancelled() {
                if let Some(task) = popped {
                    self.queue.push(task).await;
                }
                state = PollerState::Draining;
                break;
            }
            let Some(mut task) = popped else {
                if self.is_done(finalized) {
                    state = PollerState::Done;
                } else {
                    warn!("Queue is empty (received timeout)");
                    state = PollerState::IdleTimeout;
                }
                break;
            };

            if let Some(output) = self.output {
                let polled = tokio::select! {
                    polled = output.on_output(&mut task.handle, &task.spec) => Some(polled),
                    _ = self.cancel.cancelled() => None,
                };
                match polled {
                    None => {
                        self.queue.push(task).await;
                        state = PollerState::Draining;
                        break;
                    }
                    Some(Ok(delta)) => task.priority += delta,
                    Some(Err(ProcessError::OutputTimeout(_))) => {}
                    Some(Err(e)) => {
                        let _ = task.handle.terminate().await;
                        return Err(e);
                    }
                }
            }

            match task.handle.try_status() {
                Ok(Some(_)) => {
                    self.finalize(task).await;
                    finalized += 1;
                }
                Ok(None) => {
                    debug!("{} requeued with priority {}", task.spec, task.priority);
                    self.queue.push(task).await;
                }
                Err(e) => {
                    let _ = task.handle.terminate().await;
                    return Err(e);
                }
            }

            if let Some(tick) = self.on_tick {
                tick();
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.pace) => {}
                _ = self.cancel.cancelled() => state = PollerState::Draining,
            }
        }

        if state == PollerState::Draining {
            let terminated = drain_queue(self.queue, self.config.drain_wait).await;
            warn!("Cancelled: terminated {} queued processes", terminated);
            return Err(ProcessError::Cancelled);
        }
        Ok(PollOutcome { state, finalized })
    }

    async fn finalize(&self, task: PendingTask) {
        let PendingTask { spec, handle, .. } = task;
        match handle.finish().await {
            Ok(output) => {
                debug!("{} terminated", spec);
                if let Some(completion) = self.completion {
                    completion.on_complete(&spec, &output).await;
                }
            }
            Err(e) => warn!("Failed to collect output of {}: {}", spec, e),
        }
    }
}

/// Terminates and discards every task in `queue`.
///
/// Stops once no task has shown up for `wait`. Returns the number of processes
/// terminated.
pub async fn drain_queue(queue: &TaskQueue, wait: Duration) -> usize {
    let mut terminated = 0;
    while let Some(task) = queue.pop(wait).await {
        if let Err(e) = task.handle.terminate().await {
            warn!("Failed to terminate {}: {}", task.spec, e);
        }
        terminated += 1;
    }
    terminated
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::exec::process::{CommandSpec, ProcessHandle, ProcessOutput, ProcessTracker};
    use crate::exec::queue::BASE_PRIORITY;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn fast() -> PollerConfig {
        PollerConfig {
            idle_timeout: Duration::from_millis(200),
            pace: Duration::from_millis(5),
            drain_wait: Duration::from_millis(50),
            expected: None,
        }
    }

    async fn publish(queue: &TaskQueue, tracker: &Arc<ProcessTracker>, script: &str) {
        let spec = CommandSpec::new("sh").arg("-c").arg(script);
        let handle = ProcessHandle::spawn(&spec, tracker).unwrap();
        queue.push(PendingTask::new(BASE_PRIORITY, handle)).await;
    }

    #[derive(Default)]
    struct Completed {
        targets: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionHandler for Completed {
        async fn on_complete(&self, spec: &CommandSpec, _output: &ProcessOutput) {
            self.targets.lock().unwrap().push(spec.target().to_string());
        }
    }

    struct Reader;

    #[async_trait]
    impl OutputHandler for Reader {
        async fn on_output(
            &self,
            handle: &mut ProcessHandle,
            _spec: &CommandSpec,
        ) -> Result<i64, ProcessError> {
            handle.read_output(Duration::from_millis(20)).await?;
            Ok(0)
        }
    }

    struct Broken;

    #[async_trait]
    impl OutputHandler for Broken {
        async fn on_output(
            &self,
            _handle: &mut ProcessHandle,
            spec: &CommandSpec,
        ) -> Result<i64, ProcessError> {
            Err(ProcessError::handler(spec.to_string(), "unparseable"))
        }
    }

    #[tokio::test]
    async fn test_finalizes_every_task_then_idles_out() {
        let tracker = ProcessTracker::new();
        let queue = TaskQueue::new();
        publish(&queue, &tracker, "exit 0").await;
        publish(&queue, &tracker, "sleep 0.1").await;
        publish(&queue, &tracker, "exit 1").await;

        let completed = Completed::default();
        let outcome = ProgressPoller::new(&queue, CancellationToken::new(), fast())
            .with_output(&Reader)
            .with_completion(&completed)
            .run()
            .await
            .unwrap();

        assert_eq!(outcome.state, PollerState::IdleTimeout);
        assert_eq!(outcome.finalized, 3);
        assert_eq!(completed.targets.lock().unwrap().len(), 3);
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn test_stops_once_expected_tasks_finalized() {
        let tracker = ProcessTracker::new();
        let queue = TaskQueue::new();
        publish(&queue, &tracker, "exit 0").await;
        publish(&queue, &tracker, "exit 0").await;

        let config = PollerConfig {
            idle_timeout: Duration::from_secs(30),
            ..fast()
        }
        .expecting(2);
        let started = std::time::Instant::now();
        let outcome = ProgressPoller::new(&queue, CancellationToken::new(), config)
            .run()
            .await
            .unwrap();

        assert_eq!(outcome.state, PollerState::Done);
        assert_eq!(outcome.finalized, 2);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_abandoned_launches_count_towards_expected() {
        let tracker = ProcessTracker::new();
        let queue = TaskQueue::new();
        publish(&queue, &tracker, "sleep 0.1").await;
        let abandoned = AtomicUsize::new(0);

        let config = PollerConfig {
            idle_timeout: Duration::from_secs(30),
            ..fast()
        }
        .expecting(3);
        let started = std::time::Instant::now();
        let poller = ProgressPoller::new(&queue, CancellationToken::new(), config)
            .with_output(&Reader)
            .discounting(&abandoned);
        let give_up = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            abandoned.fetch_add(2, Ordering::SeqCst);
        };
        let (outcome, _) = tokio::join!(poller.run(), give_up);
        let outcome = outcome.unwrap();

        assert_eq!(outcome.state, PollerState::Done);
        assert_eq!(outcome.finalized, 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_read_timeouts_are_not_failures() {
        let tracker = ProcessTracker::new();
        let queue = TaskQueue::new();
        publish(&queue, &tracker, "sleep 0.2").await;

        let outcome = ProgressPoller::new(&queue, CancellationToken::new(), fast().expecting(1))
            .with_output(&Reader)
            .run()
            .await
            .unwrap();
        assert_eq!(outcome.state, PollerState::Done);
    }

    #[tokio::test]
    async fn test_handler_failure_propagates() {
        let tracker = ProcessTracker::new();
        let queue = TaskQueue::new();
        publish(&queue, &tracker, "sleep 30").await;

        let err = ProgressPoller::new(&queue, CancellationToken::new(), fast())
            .with_output(&Broken)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Handler { .. }));
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_drains_and_terminates_queue() {
        let tracker = ProcessTracker::new();
        let queue = TaskQueue::new();
        for _ in 0..4 {
            publish(&queue, &tracker, "sleep 30").await;
        }
        let cancel = CancellationToken::new();
        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };

        let err = ProgressPoller::new(&queue, cancel, fast())
            .with_output(&Reader)
            .run()
            .await
            .unwrap_err();
        trigger.await.unwrap();

        assert!(err.is_cancelled());
        assert!(queue.is_empty().await);
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn test_tick_runs_after_every_cycle() {
        let tracker = ProcessTracker::new();
        let queue = TaskQueue::new();
        publish(&queue, &tracker, "exit 0").await;
        publish(&queue, &tracker, "exit 0").await;

        let ticks = AtomicUsize::new(0);
        let tick = || {
            ticks.fetch_add(1, Ordering::SeqCst);
        };
        ProgressPoller::new(&queue, CancellationToken::new(), fast().expecting(2))
            .on_tick(&tick)
            .run()
            .await
            .unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_drain_queue_counts_terminated() {
        let tracker = ProcessTracker::new();
        let queue = TaskQueue::new();
        publish(&queue, &tracker, "sleep 30").await;
        publish(&queue, &tracker, "sleep 30").await;

        assert_eq!(drain_queue(&queue, Duration::from_millis(20)).await, 2);
        assert_eq!(tracker.live(), 0);
    }
}
