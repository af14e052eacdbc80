//! Running batches of processes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::error::ProcessError;
use super::process::{CommandSpec, ProcessOutput};
use super::queue::PendingTask;
use super::runner::{CompletionHandler, ProcessRunner, QueueSink};

/// Half the available parallelism, at least one.
pub fn default_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / 2).max(1)
}

/// Drives batches of [`CommandSpec`]s through a [`ProcessRunner`].
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    runner: ProcessRunner,
    max_concurrency: usize,
}

impl ConcurrencyLimiter {
    pub fn new(runner: ProcessRunner) -> Self {
        Self {
            runner,
            max_concurrency: default_concurrency(),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Runs every spec to completion with at most `max_concurrency` alive at once.
    ///
    /// A new spec is admitted as soon as any running one finishes. Returns the stdout
    /// of every task that wrote something, in completion order. Tasks that fail to
    /// launch are logged and skipped; only cancellation is returned as an error.
    pub async fn run_bounded(&self, specs: Vec<CommandSpec>) -> Result<Vec<Vec<u8>>, ProcessError> {
        let collector = StdoutCollector::default();
        let total = specs.len();

        let results: Vec<Result<_, ProcessError>> = stream::iter(specs)
            .map(|spec| {
                let collector = &collector;
                async move {
                    self.runner
                        .run(&spec, None, Some(collector), None)
                        .await
                        .map_err(|e| (spec, e))
                }
            })
            .buffer_unordered(self.max_concurrency)
            .map(|result| match result {
                Ok(_) => Ok(()),
                Err((_, ProcessError::Cancelled)) => Err(ProcessError::Cancelled),
                Err((spec, e)) => {
                    error!("Failed to run {}: {}", spec, e);
                    Ok(())
                }
            })
            .collect()
            .await;

        if results.iter().any(|r| matches!(r, Err(ProcessError::Cancelled))) {
            return Err(ProcessError::Cancelled);
        }
        let outputs = collector.into_inner();
        debug!("Bounded batch done: {} tasks, {} with output", total, outputs.len());
        Ok(outputs)
    }

    /// Launches specs into `sink`, keeping at most `max_concurrency` of them alive.
    ///
    /// Every published task holds a permit until whoever pops it drops it, so the
    /// next spec starts only once a queued one has been finalized. This runs
    /// alongside the poller that consumes the queue. Specs that fail to launch are
    /// collected and counted in `abandoned`. Feeding stops early when `stop` fires;
    /// cancellation of the runner is returned as an error, leaving already published
    /// processes in the queue for the caller to drain.
    pub async fn launch_bounded(
        &self,
        specs: &[CommandSpec],
        sink: QueueSink<'_>,
        abandoned: &AtomicUsize,
        stop: &CancellationToken,
    ) -> Result<LaunchOutcome, ProcessError> {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut outcome = LaunchOutcome::default();

        for spec in specs {
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => permit,
                _ = stop.cancelled() => break,
            };
            let Ok(permit) = permit else { break };
            match self.runner.spawn(spec) {
                Ok(handle) => {
                    let task = PendingTask::new(sink.priority, handle).with_permit(permit);
                    sink.queue.push(task).await;
                    outcome.launched += 1;
                }
                Err(ProcessError::Cancelled) => return Err(ProcessError::Cancelled),
                Err(e) => {
                    abandoned.fetch_add(1, Ordering::SeqCst);
                    outcome.failed.push((spec.clone(), e));
                }
            }
        }

        if self.runner.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }
        if outcome.launched + outcome.failed.len() < specs.len() {
            debug!(
                "Stopped feeding after {} of {} specs",
                outcome.launched + outcome.failed.len(),
                specs.len()
            );
        }
        Ok(outcome)
    }
}

/// Result of publishing a batch into a queue.
#[derive(Debug, Default)]
pub struct LaunchOutcome {
    pub launched: usize,
    pub failed: Vec<(CommandSpec, ProcessError)>,
}

#[derive(Default)]
struct StdoutCollector {
    outputs: Mutex<Vec<Vec<u8>>>,
}

impl StdoutCollector {
    fn into_inner(self) -> Vec<Vec<u8>> {
        self.outputs.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CompletionHandler for StdoutCollector {
    async fn on_complete(&self, spec: &CommandSpec, output: &ProcessOutput) {
        if !output.success() {
            debug!("{} exited with {}", spec, output.status);
        }
        if !output.stdout.is_empty() {
            self.outputs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(output.stdout.clone());
        }
    }
}
