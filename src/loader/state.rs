//! Pipeline state shared between the stages and the progress display.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::progress::{ProgressReporter, ProgressUpdate};

/// One pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    PreLoad,
    Extraction,
    Import,
    Setup,
    Combine,
    PostLoad,
    Count,
    Verification,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::PreLoad => "Pre-load",
            Stage::Extraction => "Extraction",
            Stage::Import => "Import",
            Stage::Setup => "Setup",
            Stage::Combine => "Combine",
            Stage::PostLoad => "Post-load",
            Stage::Count => "Row count",
            Stage::Verification => "Verification",
        };
        f.write_str(name)
    }
}

/// Import progress of one file.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FileProgress {
    /// Fraction done, in `[0, 1]`
    pub percent: f64,
    pub bytes_done: Option<f64>,
    pub bytes_total: Option<f64>,
}

/// A task that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub stage: Stage,
    /// The file, directory or script the task worked on
    pub target: String,
    pub detail: String,
}

#[derive(Debug, Default)]
struct Counters {
    extraction_total: usize,
    extraction_done: usize,
    import_total: usize,
    import_progress: BTreeMap<String, FileProgress>,
    failures: Vec<TaskFailure>,
}

impl Counters {
    fn progress(&self) -> (f64, f64) {
        let max = (self.extraction_total + self.import_total) as f64;
        let done = self.extraction_done as f64
            + self.import_progress.values().map(|p| p.percent).sum::<f64>();
        (done.clamp(0.0, max), max)
    }
}

/// Counters, per-file import progress and the failure ledger of one run.
///
/// Percentages only ever grow and completed extractions never exceed the total, so
/// the aggregate progress is non-decreasing within a run.
pub struct PipelineState {
    counters: Mutex<Counters>,
    reporter: Arc<dyn ProgressReporter>,
}

impl PipelineState {
    pub fn new(reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            reporter,
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears everything for a new run.
    pub fn reset(&self) {
        *self.counters() = Counters::default();
    }

    pub fn set_extraction_total(&self, total: usize) {
        let mut counters = self.counters();
        counters.extraction_total = total;
        counters.extraction_done = counters.extraction_done.min(total);
    }

    /// Counts one finished extraction.
    pub fn extraction_completed(&self) {
        let mut counters = self.counters();
        counters.extraction_done = (counters.extraction_done + 1).min(counters.extraction_total);
    }

    pub fn extraction(&self) -> (usize, usize) {
        let counters = self.counters();
        (counters.extraction_done, counters.extraction_total)
    }

    pub fn set_import_total(&self, total: usize) {
        self.counters().import_total = total;
    }

    /// Folds a parsed update into the progress of `file`.
    pub fn apply_import_update(&self, file: &str, update: &ProgressUpdate) {
        let mut counters = self.counters();
        let entry = counters.import_progress.entry(file.to_string()).or_default();
        if let Some(percent) = update.percent {
            entry.percent = entry.percent.max(percent.clamp(0.0, 1.0));
        }
        if update.bytes_done.is_some() {
            entry.bytes_done = update.bytes_done;
        }
        if update.bytes_total.is_some() {
            entry.bytes_total = update.bytes_total;
        }
    }

    /// Marks the import of `file` as finished.
    pub fn complete_import(&self, file: &str) {
        let mut counters = self.counters();
        counters
            .import_progress
            .entry(file.to_string())
            .or_default()
            .percent = 1.0;
    }

    pub fn import_progress(&self, file: &str) -> Option<FileProgress> {
        self.counters().import_progress.get(file).copied()
    }

    pub fn record_failure(&self, stage: Stage, target: impl Into<String>, detail: impl Into<String>) {
        self.counters().failures.push(TaskFailure {
            stage,
            target: target.into(),
            detail: detail.into(),
        });
    }

    pub fn failures(&self) -> Vec<TaskFailure> {
        self.counters().failures.clone()
    }

    pub fn failure_count(&self, stage: Stage) -> usize {
        self.counters()
            .failures
            .iter()
            .filter(|f| f.stage == stage)
            .count()
    }

    /// Aggregate progress as `(value, max)`, with `value` clamped to `[0, max]`.
    pub fn progress(&self) -> (f64, f64) {
        self.counters().progress()
    }

    /// Pushes the current aggregate progress to the reporter.
    pub fn publish(&self) {
        let (value, max) = self.progress();
        self.reporter.update(value, max);
    }

    pub fn set_stage(&self, stage: Stage) {
        self.reporter.set_stage(&stage.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopReporter;

    fn state() -> PipelineState {
        PipelineState::new(Arc::new(NoopReporter))
    }

    fn percent(p: f64) -> ProgressUpdate {
        ProgressUpdate {
            percent: Some(p),
            ..ProgressUpdate::default()
        }
    }

    #[test]
    fn test_extraction_done_never_exceeds_total() {
        let state = state();
        state.set_extraction_total(2);
        for _ in 0..5 {
            state.extraction_completed();
        }
        assert_eq!(state.extraction(), (2, 2));
    }

    #[test]
    fn test_progress_is_monotonic_and_bounded() {
        let state = state();
        state.set_extraction_total(1);
        state.set_import_total(2);

        let updates = [
            ("a", 0.2),
            ("b", 0.5),
            ("a", 0.1),
            ("a", 1.7),
            ("b", -3.0),
            ("b", 0.9),
        ];
        let mut last = 0.0;
        for (file, p) in updates {
            state.apply_import_update(file, &percent(p));
            let (value, max) = state.progress();
            assert!(value >= last, "{} dropped below {}", value, last);
            assert!(value <= max);
            last = value;
        }
        state.extraction_completed();
        state.complete_import("b");
        assert_eq!(state.progress(), (3.0, 3.0));
    }

    #[test]
    fn test_byte_counts_are_overwritten() {
        let state = state();
        state.apply_import_update(
            "a",
            &ProgressUpdate {
                percent: None,
                bytes_done: Some(1.0),
                bytes_total: Some(4.0),
            },
        );
        state.apply_import_update(
            "a",
            &ProgressUpdate {
                percent: Some(0.5),
                bytes_done: Some(2.0),
                bytes_total: None,
            },
        );
        let progress = state.import_progress("a").unwrap();
        assert_eq!(progress.percent, 0.5);
        assert_eq!(progress.bytes_done, Some(2.0));
        assert_eq!(progress.bytes_total, Some(4.0));
    }

    #[test]
    fn test_reset_clears_everything() {
        let state = state();
        state.set_import_total(3);
        state.complete_import("a");
        state.record_failure(Stage::Import, "a", "exit status 1");
        state.reset();

        assert_eq!(state.progress(), (0.0, 0.0));
        assert!(state.import_progress("a").is_none());
        assert!(state.failures().is_empty());
    }

    #[test]
    fn test_failure_count_per_stage() {
        let state = state();
        state.record_failure(Stage::Import, "a.csv", "boom");
        state.record_failure(Stage::Import, "b.csv", "boom");
        state.record_failure(Stage::Combine, "a", "boom");
        assert_eq!(state.failure_count(Stage::Import), 2);
        assert_eq!(state.failure_count(Stage::Combine), 1);
        assert_eq!(state.failure_count(Stage::Setup), 0);
    }
}
