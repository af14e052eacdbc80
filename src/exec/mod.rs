//! External process execution.
//!
//! - [`ProcessRunner`] launches a single process and ties it to a cancellation token
//! - [`ConcurrencyLimiter`] drives batches, either bounded or published into a queue
//! - [`TaskQueue`] holds running processes ordered by priority
//! - [`ProgressPoller`] services the queue until a batch is finished

pub mod error;
pub mod limiter;
pub mod poller;
pub mod process;
pub mod queue;
pub mod runner;

pub use error::{is_cancelled, ProcessError};
pub use limiter::{default_concurrency, ConcurrencyLimiter, LaunchOutcome};
pub use poller::{drain_queue, PollOutcome, PollerConfig, PollerState, ProgressPoller};
pub use process::{abbreviate, CommandSpec, ProcessHandle, ProcessOutput, ProcessTracker};
pub use queue::{PendingTask, TaskQueue, BASE_PRIORITY};
pub use runner::{log_result, CompletionHandler, OutputHandler, ProcessRunner, QueueSink};
