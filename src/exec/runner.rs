//! Launching single external processes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::error::ProcessError;
use super::process::{CommandSpec, ProcessHandle, ProcessOutput, ProcessTracker};
use super::queue::{PendingTask, TaskQueue};

/// Reads incremental output from a live process.
///
/// Implementations must bound their own reads (see [`ProcessHandle::read_output`]) and
/// return a priority delta: positive values push the task further back in the queue.
#[async_trait]
pub trait OutputHandler: Send + Sync {
    async fn on_output(
        &self,
        handle: &mut ProcessHandle,
        spec: &CommandSpec,
    ) -> Result<i64, ProcessError>;
}

/// Called once a process has exited and its streams are drained.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn on_complete(&self, spec: &CommandSpec, output: &ProcessOutput);
}

/// Where a launched process goes when nobody waits for it directly.
#[derive(Clone, Copy)]
pub struct QueueSink<'a> {
    pub queue: &'a TaskQueue,
    pub priority: i64,
}

impl<'a> QueueSink<'a> {
    pub fn new(queue: &'a TaskQueue, priority: i64) -> Self {
        Self { queue, priority }
    }
}

/// Launches processes and ties them to a cancellation token.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    tracker: Arc<ProcessTracker>,
    cancel: CancellationToken,
}

impl ProcessRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_tracker(ProcessTracker::new(), cancel)
    }

    pub fn with_tracker(tracker: Arc<ProcessTracker>, cancel: CancellationToken) -> Self {
        Self { tracker, cancel }
    }

    pub fn tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawns `spec` unless the run has already been cancelled.
    pub fn spawn(&self, spec: &CommandSpec) -> Result<ProcessHandle, ProcessError> {
        if self.cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }
        ProcessHandle::spawn(spec, &self.tracker)
    }

    /// Runs one process.
    ///
    /// While the process is alive, `output` is called repeatedly. After that the
    /// process is either reaped and passed to `completion`, or, without a completion
    /// handler, published into `sink`. Returns the drained output whenever the process
    /// was reaped here, `None` when it went to the queue.
    ///
    /// On cancellation the process is terminated before [`ProcessError::Cancelled`]
    /// is returned.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        output: Option<&dyn OutputHandler>,
        completion: Option<&dyn CompletionHandler>,
        sink: Option<QueueSink<'_>>,
    ) -> Result<Option<ProcessOutput>, ProcessError> {
        let mut handle = self.spawn(spec)?;

        if let Some(output) = output {
            loop {
                let polled = tokio::select! {
                    polled = output.on_output(&mut handle, spec) => polled,
                    _ = self.cancel.cancelled() => return Err(abort(handle).await),
                };
                match polled {
                    Ok(_) | Err(ProcessError::OutputTimeout(_)) => {}
                    Err(e) => {
                        let _ = handle.terminate().await;
                        return Err(e);
                    }
                }
                if handle.output_closed() || handle.try_status()?.is_some() {
                    break;
                }
            }
        }

        if completion.is_none() {
            if let Some(sink) = sink {
                sink.queue.push(PendingTask::new(sink.priority, handle)).await;
                return Ok(None);
            }
        }

        let finished = self.reap(handle).await?;
        if let Some(completion) = completion {
            completion.on_complete(spec, &finished).await;
        }
        Ok(Some(finished))
    }

    /// Runs `spec` to completion and returns everything it wrote.
    pub async fn sync_run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        let handle = self.spawn(spec)?;
        self.reap(handle).await
    }

    async fn reap(&self, mut handle: ProcessHandle) -> Result<ProcessOutput, ProcessError> {
        tokio::select! {
            status = handle.wait() => { status?; }
            _ = self.cancel.cancelled() => return Err(abort(handle).await),
        }
        handle.finish().await
    }
}

/// Terminates `handle` and yields the cancellation error to propagate.
pub(crate) async fn abort(handle: ProcessHandle) -> ProcessError {
    let spec = handle.spec().to_string();
    if let Err(e) = handle.terminate().await {
        warn!("Failed to terminate {}: {}", spec, e);
    }
    ProcessError::Cancelled
}

/// Logs how a finished process went.
pub fn log_result(spec: &CommandSpec, output: &ProcessOutput) {
    let stderr = output.stderr_text();
    let stderr = stderr.trim();
    match (output.success(), stderr.is_empty()) {
        (true, true) => info!("Completed: {}", spec),
        (true, false) => {
            warn!("{}", stderr);
            info!("Completed with warnings: {}", spec);
        }
        (false, false) => error!("Failed ({}): {}\n{}", output.status, spec, stderr),
        (false, true) => error!("Failed ({}): {}", output.status, spec),
    }
}
