//! Output and completion handlers for the pipeline stages.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::state::{PipelineState, Stage};
use crate::exec::{
    abbreviate, log_result, CommandSpec, CompletionHandler, OutputHandler, ProcessError, ProcessHandle,
    ProcessOutput,
};
use crate::progress::ProgressParser;

/// How long the import handler waits for loader output per visit.
pub const IMPORT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Priority penalty for an import that produced no output during a visit.
pub const STALL_PENALTY: i64 = 10;

fn failure_detail(output: &ProcessOutput) -> String {
    let stderr = output.stderr_text();
    let stderr = stderr.trim();
    if stderr.is_empty() {
        output.status.to_string()
    } else {
        format!("{}: {}", output.status, stderr)
    }
}

/// Records the result of any task whose last argument identifies its target.
fn settle(state: &PipelineState, stage: Stage, spec: &CommandSpec, output: &ProcessOutput) {
    log_result(spec, output);
    if !output.success() {
        state.record_failure(stage, abbreviate(spec.target()), failure_detail(output));
    }
}

/// Counts finished extractions.
pub struct ExtractionCompletion<'a> {
    pub state: &'a PipelineState,
}

#[async_trait]
impl CompletionHandler for ExtractionCompletion<'_> {
    async fn on_complete(&self, spec: &CommandSpec, output: &ProcessOutput) {
        self.state.extraction_completed();
        settle(self.state, Stage::Extraction, spec, output);
    }
}

/// Reads loader output and folds parsed progress into the pipeline state.
///
/// Every visit consumes all output buffered since the last one, so the latest
/// reported progress wins.
pub struct ImportOutput<'a> {
    pub state: &'a PipelineState,
    pub parser: &'a dyn ProgressParser,
    pub read_timeout: Duration,
}

impl<'a> ImportOutput<'a> {
    pub fn new(state: &'a PipelineState, parser: &'a dyn ProgressParser) -> Self {
        Self {
            state,
            parser,
            read_timeout: IMPORT_READ_TIMEOUT,
        }
    }
}

#[async_trait]
impl OutputHandler for ImportOutput<'_> {
    async fn on_output(
        &self,
        handle: &mut ProcessHandle,
        spec: &CommandSpec,
    ) -> Result<i64, ProcessError> {
        let chunk = match handle.read_available(self.read_timeout).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(0),
            Err(ProcessError::OutputTimeout(_)) => {
                debug!("No progress update from {} (Timeout)", spec.target());
                return Ok(STALL_PENALTY);
            }
            Err(e) => return Err(e),
        };

        let text = String::from_utf8_lossy(&chunk);
        debug!("{}", text.trim_end());
        if let Some(update) = self.parser.parse(&text) {
            self.state.apply_import_update(spec.target(), &update);
            self.state.publish();
        }
        Ok(0)
    }
}

/// Marks imports as finished.
pub struct ImportCompletion<'a> {
    pub state: &'a PipelineState,
}

#[async_trait]
impl CompletionHandler for ImportCompletion<'_> {
    async fn on_complete(&self, spec: &CommandSpec, output: &ProcessOutput) {
        self.state.complete_import(spec.target());
        self.state.publish();
        settle(self.state, Stage::Import, spec, output);
    }
}

/// Logs SQL execution results.
pub struct SqlCompletion<'a> {
    pub state: &'a PipelineState,
    pub stage: Stage,
}

#[async_trait]
impl CompletionHandler for SqlCompletion<'_> {
    async fn on_complete(&self, spec: &CommandSpec, output: &ProcessOutput) {
        let stdout = output.stdout_text();
        if !stdout.trim().is_empty() {
            debug!("{}", stdout.trim_end());
        }
        settle(self.state, self.stage, spec, output);
    }
}
