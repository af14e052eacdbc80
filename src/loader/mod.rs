//! Loading pipeline
//!
//! Runs the stages of one load in strict order:
//! 1. Pre-load     : user SQL scripts, one source at a time
//! 2. Extraction   : archives into sibling directories
//! 3. Import       : one loader process per data file
//! 4. Setup        : packaged helper functions
//! 5. Combine      : per-file tables into one table per derived name (optional)
//! 6. Post-load    : user SQL scripts, concurrently with row counting
//! 7. Verification : source rows against store rows (optional)
//!
//! Failures of single tasks are logged and collected; they never stop the pipeline.
//! Cancellation ends the run early but is not an error.

pub mod handlers;
pub mod state;

pub use state::{FileProgress, PipelineState, Stage, TaskFailure};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::join_all;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LoaderConfig;
use crate::count::{count_lines, count_records_all, precise_workers, RowCounts};
use crate::exec::{
    abbreviate, drain_queue, is_cancelled, CommandSpec, CompletionHandler, ConcurrencyLimiter,
    OutputHandler, ProcessError, ProcessRunner, ProgressPoller, QueueSink, TaskQueue,
    BASE_PRIORITY,
};
use crate::paths::{
    discover_files, exclude_matching, extraction_dir, file_table_name, files_in, group_by_table,
    TableGrouping,
};
use crate::progress::{NoopReporter, PgfutterProgress, ProgressParser, ProgressReporter};
use crate::sql::Psql;
use crate::verify::{VerificationReport, VerificationReporter};
use handlers::{ExtractionCompletion, ImportCompletion, ImportOutput, SqlCompletion};

/// Idempotent helper functions installed after every import.
const FUNCTIONS_SQL: &str = include_str!("../../hooks/functions.sql");

fn current_rss_kb() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if line.starts_with("VmRSS:") {
            return line
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok());
        }
    }
    None
}

fn log_stage_metrics(stage: Stage, started: Instant) {
    let elapsed_ms = started.elapsed().as_millis();
    let rss_kb = current_rss_kb().unwrap_or(0);
    info!(
        "Stage done: stage='{}' elapsed_ms={} rss_kb={}",
        stage, elapsed_ms, rss_kb
    );
}

/// Builds the statement that merges per-file tables into `table`.
///
/// The combined table copies the layout of the first file table.
pub fn combine_statement(schema: &str, table: &str, file_tables: &[String]) -> String {
    let first = file_tables.first().map(String::as_str).unwrap_or(table);
    let union = file_tables
        .iter()
        .map(|t| format!("SELECT * FROM {}.{}", schema, t))
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    format!(
        "DROP TABLE IF EXISTS {schema}.{table} CASCADE;\
         CREATE TABLE {schema}.{table} (LIKE {schema}.{first} INCLUDING ALL);\
         INSERT INTO {schema}.{table} SELECT * FROM ({union}) AS combined",
    )
}

/// What a load did.
#[derive(Debug, Default, Clone)]
pub struct LoadSummary {
    pub archives_found: usize,
    pub archives_extracted: usize,
    /// Already extracted, or extraction disabled
    pub archives_skipped: usize,
    pub files_found: usize,
    pub files_excluded: usize,
    pub files_imported: usize,
    /// Not imported because import is disabled
    pub files_skipped: usize,
    pub scripts_run: usize,
    pub tables_combined: usize,
    /// Not combined because a file table has the combined name
    pub tables_skipped: usize,
    pub rows_counted: usize,
    pub verification: Option<VerificationReport>,
    pub failures: Vec<TaskFailure>,
    pub cancelled: bool,
}

impl LoadSummary {
    /// Failed tasks of one stage.
    pub fn failed(&self, stage: Stage) -> usize {
        self.failures.iter().filter(|f| f.stage == stage).count()
    }
}

/// Main loader orchestrator
pub struct Loader {
    config: LoaderConfig,
    runner: ProcessRunner,
    limiter: ConcurrencyLimiter,
    psql: Psql,
    queue: TaskQueue,
    state: PipelineState,
    reporter: Arc<dyn ProgressReporter>,
    parser: Box<dyn ProgressParser>,
}

impl Loader {
    pub fn new(config: LoaderConfig, cancel: CancellationToken) -> Self {
        Self::with_runner(config, ProcessRunner::new(cancel), Arc::new(NoopReporter))
    }

    pub fn with_runner(
        config: LoaderConfig,
        runner: ProcessRunner,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        let limiter =
            ConcurrencyLimiter::new(runner.clone()).with_max_concurrency(config.max_concurrency);
        let psql = Psql::new(config.tools.psql.clone(), config.db.clone());
        Self {
            limiter,
            psql,
            queue: TaskQueue::new(),
            state: PipelineState::new(Arc::clone(&reporter)),
            reporter,
            parser: Box::new(PgfutterProgress),
            runner,
            config,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Runs every stage.
    ///
    /// Only configuration problems are errors. Task failures end up in
    /// [`LoadSummary::failures`]; a cancelled run returns with
    /// [`LoadSummary::cancelled`] set after every process has been terminated.
    pub async fn load(&self) -> Result<LoadSummary> {
        self.config.validate()?;
        let exclude = self.config.exclude_pattern()?;

        self.state.reset();
        let mut summary = LoadSummary::default();
        let outcome = self.run_stages(exclude.as_ref(), &mut summary).await;

        let leftover = drain_queue(&self.queue, Duration::ZERO).await;
        if leftover > 0 {
            warn!("Terminated {} unfinished processes", leftover);
        }
        self.reporter.finish();
        summary.failures = self.state.failures();

        match outcome {
            Ok(()) => {
                info!("Completed.");
                Ok(summary)
            }
            Err(e) if is_cancelled(&e) => {
                warn!("Load cancelled");
                summary.cancelled = true;
                Ok(summary)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_stages(&self, exclude: Option<&Regex>, summary: &mut LoadSummary) -> Result<()> {
        let started = self.begin(Stage::PreLoad);
        self.pre_load(summary).await?;
        log_stage_metrics(Stage::PreLoad, started);

        let started = self.begin(Stage::Extraction);
        self.extract(summary).await?;
        log_stage_metrics(Stage::Extraction, started);

        let started = self.begin(Stage::Import);
        let (files, grouping) = self.import(exclude, summary).await?;
        log_stage_metrics(Stage::Import, started);

        let started = self.begin(Stage::Setup);
        summary.scripts_run += self
            .run_sql_batch(Stage::Setup, vec![self.psql.statement(FUNCTIONS_SQL)])
            .await?;
        log_stage_metrics(Stage::Setup, started);

        if self.config.combine_tables {
            let started = self.begin(Stage::Combine);
            self.combine(&grouping, summary).await?;
            log_stage_metrics(Stage::Combine, started);
        }

        let started = self.begin(Stage::PostLoad);
        let counts = self.post_load(&files, summary).await?;
        log_stage_metrics(Stage::PostLoad, started);

        if !self.config.disable_check {
            let started = self.begin(Stage::Verification);
            let reporter = VerificationReporter::new(
                &self.runner,
                &self.psql,
                &self.config.check_schema,
                self.config.max_discrepancy,
            );
            summary.verification = Some(reporter.verify(&grouping, &counts).await?);
            log_stage_metrics(Stage::Verification, started);
        }
        Ok(())
    }

    fn begin(&self, stage: Stage) -> Instant {
        info!("=== {} ===", stage);
        self.state.set_stage(stage);
        Instant::now()
    }

    /// Runs the scripts of each source concurrently, one source after another.
    ///
    /// A source is a script or a directory of scripts. Returns how many ran.
    async fn run_scripts(&self, stage: Stage, sources: &[PathBuf]) -> Result<usize> {
        let label = match stage {
            Stage::PreLoad => "pre",
            _ => "post",
        };
        let mut ran = 0;
        for source in sources {
            let mut scripts = files_in(source, "sql");
            scripts.sort();
            for script in &scripts {
                info!("Executing {} load routine: {}", label, script.display());
            }
            let specs = scripts.iter().map(|s| self.psql.script(s)).collect();
            ran += self.run_sql_batch(stage, specs).await?;
        }
        Ok(ran)
    }

    async fn pre_load(&self, summary: &mut LoadSummary) -> Result<()> {
        summary.scripts_run += self.run_scripts(Stage::PreLoad, &self.config.pre_load).await?;
        Ok(())
    }

    /// Runs SQL commands concurrently and returns how many ran.
    async fn run_sql_batch(&self, stage: Stage, specs: Vec<CommandSpec>) -> Result<usize> {
        let completion = SqlCompletion {
            state: &self.state,
            stage,
        };
        let completion: &dyn CompletionHandler = &completion;
        let runs = specs.iter().map(|spec| async move {
            (spec, self.runner.run(spec, None, Some(completion), None).await)
        });

        let mut ran = 0;
        for (spec, result) in join_all(runs).await {
            match result {
                Ok(_) => ran += 1,
                Err(ProcessError::Cancelled) => return Err(ProcessError::Cancelled.into()),
                Err(e) => {
                    error!("Failed to run {}: {}", spec, e);
                    self.state
                        .record_failure(stage, abbreviate(spec.target()), e.to_string());
                }
            }
        }
        Ok(ran)
    }

    /// Feeds `specs` into the queue and polls them until all are finalized.
    ///
    /// At most `max_concurrency` processes are alive at once; the next one starts
    /// as soon as the poller finalizes a running one.
    async fn publish_and_poll(
        &self,
        stage: Stage,
        specs: &[CommandSpec],
        output: Option<&dyn OutputHandler>,
        completion: &dyn CompletionHandler,
    ) -> Result<()> {
        let abandoned = AtomicUsize::new(0);
        let stop = self.runner.cancel_token().child_token();

        let state = &self.state;
        let tick = move || state.publish();
        let config = self.config.poller.clone().expecting(specs.len());
        let mut poller = ProgressPoller::new(&self.queue, self.runner.cancel_token().clone(), config)
            .with_completion(completion)
            .discounting(&abandoned)
            .on_tick(&tick);
        if let Some(output) = output {
            poller = poller.with_output(output);
        }

        let feed = self.limiter.launch_bounded(
            specs,
            QueueSink::new(&self.queue, BASE_PRIORITY),
            &abandoned,
            &stop,
        );
        let poll = async {
            let polled = poller.run().await;
            stop.cancel();
            polled
        };
        let (launched, polled) = tokio::join!(feed, poll);

        let outcome = launched?;
        for (spec, e) in &outcome.failed {
            error!("Failed to launch {}: {}", spec, e);
            self.state.record_failure(stage, spec.target(), e.to_string());
            match stage {
                Stage::Extraction => self.state.extraction_completed(),
                Stage::Import => self.state.complete_import(spec.target()),
                _ => {}
            }
        }
        self.state.publish();

        let polled = polled?;
        debug!(
            "{} polling ended in {:?} after {} of {} launched tasks",
            stage, polled.state, polled.finalized, outcome.launched
        );
        Ok(())
    }

    async fn extract(&self, summary: &mut LoadSummary) -> Result<()> {
        let archives = discover_files(&self.config.sources, "zip");
        summary.archives_found = archives.len();
        let targets: Vec<(PathBuf, PathBuf)> = archives
            .into_iter()
            .map(|archive| {
                let dir = extraction_dir(&archive);
                (archive, dir)
            })
            .collect();

        if self.config.disable_unzip && !self.config.all {
            let pending = targets.iter().filter(|(_, dir)| !dir.exists()).count();
            info!(
                "Skipping unzipping of {} not yet unzipped files ({} total)",
                pending,
                targets.len()
            );
            summary.archives_skipped = targets.len();
            return Ok(());
        }

        let batch: Vec<(PathBuf, PathBuf)> = targets
            .into_iter()
            .filter(|(_, dir)| self.config.all || !dir.exists())
            .collect();
        summary.archives_skipped = summary.archives_found - batch.len();
        if batch.is_empty() {
            info!("No files to unzip");
            return Ok(());
        }

        self.state.set_extraction_total(batch.len());
        let mut specs = Vec::with_capacity(batch.len());
        for (archive, dir) in &batch {
            if let Err(e) = fs::create_dir_all(dir) {
                error!("Failed to create {}: {}", dir.display(), e);
                self.state
                    .record_failure(Stage::Extraction, dir.to_string_lossy(), e.to_string());
                self.state.extraction_completed();
                continue;
            }
            info!("Unzipping {}", archive.display());
            specs.push(
                self.config
                    .tools
                    .unzip
                    .command()
                    .arg("-o")
                    .arg(archive.to_string_lossy())
                    .arg("-d")
                    .arg(dir.to_string_lossy()),
            );
        }

        let completion = ExtractionCompletion { state: &self.state };
        self.publish_and_poll(Stage::Extraction, &specs, None, &completion)
            .await?;
        summary.archives_extracted = batch.len() - self.state.failure_count(Stage::Extraction);
        Ok(())
    }

    fn import_command(&self, file: &Path, table: &str) -> CommandSpec {
        self.config
            .tools
            .loader
            .command()
            .args(self.config.db.loader_flags())
            .arg("-table")
            .arg(table)
            .arg("csv")
            .arg(file.to_string_lossy())
    }

    async fn import(
        &self,
        exclude: Option<&Regex>,
        summary: &mut LoadSummary,
    ) -> Result<(Vec<PathBuf>, TableGrouping)> {
        let found = discover_files(&self.config.sources, "csv");
        summary.files_found = found.len();
        let files = exclude_matching(found, exclude);
        summary.files_excluded = summary.files_found - files.len();
        let grouping = group_by_table(&files);

        if self.config.disable_import && !self.config.all {
            info!("Skipping importing of {} csv files", files.len());
            summary.files_skipped = files.len();
            return Ok((files, grouping));
        }
        if files.is_empty() {
            info!("No csv files to import");
            return Ok((files, grouping));
        }

        self.state.set_import_total(files.len());
        let mut specs = Vec::with_capacity(files.len());
        for (table, table_files) in &grouping {
            debug!("Table {} has {} files", table, table_files.len());
            for file in table_files {
                let file_table = file_table_name(file);
                info!("Importing {} into {}", file.display(), file_table);
                specs.push(self.import_command(file, &file_table));
            }
        }

        let output = ImportOutput::new(&self.state, self.parser.as_ref());
        let completion = ImportCompletion { state: &self.state };
        if self.config.sequential_import {
            for spec in &specs {
                match self
                    .runner
                    .run(spec, Some(&output), Some(&completion), None)
                    .await
                {
                    Ok(_) => {}
                    Err(ProcessError::Cancelled) => return Err(ProcessError::Cancelled.into()),
                    Err(e) => {
                        error!("Failed to import {}: {}", spec, e);
                        self.state
                            .record_failure(Stage::Import, spec.target(), e.to_string());
                        self.state.complete_import(spec.target());
                    }
                }
            }
        } else {
            self.publish_and_poll(Stage::Import, &specs, Some(&output), &completion)
                .await?;
        }

        summary.files_imported = files.len() - self.state.failure_count(Stage::Import);
        Ok((files, grouping))
    }

    async fn combine(&self, grouping: &TableGrouping, summary: &mut LoadSummary) -> Result<()> {
        let schema = &self.config.import_schema;
        let mut specs = Vec::new();
        for (table, files) in grouping {
            if files.len() < 2 {
                continue;
            }
            let file_tables: Vec<String> = files.iter().map(|f| file_table_name(f)).collect();
            if file_tables.contains(table) {
                warn!(
                    "Cannot combine tables {:?} into {} because they have the same name",
                    file_tables, table
                );
                summary.tables_skipped += 1;
                continue;
            }
            info!("Combining tables {:?} into {}", file_tables, table);
            let statement = combine_statement(schema, table, &file_tables);
            debug!("{}", statement);
            specs.push(self.psql.statement(&statement));
        }

        let total = specs.len();
        self.run_sql_batch(Stage::Combine, specs).await?;
        summary.tables_combined = total - self.state.failure_count(Stage::Combine);
        Ok(())
    }

    async fn post_load(&self, files: &[PathBuf], summary: &mut LoadSummary) -> Result<RowCounts> {
        info!("Counting csv file rows");
        let (ran, counts) = tokio::join!(
            self.run_scripts(Stage::PostLoad, &self.config.post_load),
            self.count_rows(files)
        );
        summary.scripts_run += ran?;
        let counts = counts?;
        summary.rows_counted = counts.len();
        Ok(counts)
    }

    async fn count_rows(&self, files: &[PathBuf]) -> Result<RowCounts> {
        let counted = if self.config.precise_count {
            tokio::select! {
                counted = count_records_all(files.to_vec(), precise_workers()) => counted,
                _ = self.runner.cancel_token().cancelled() => return Err(ProcessError::Cancelled.into()),
            }
        } else {
            count_lines(&self.limiter, &self.config.tools.line_count, files).await
        };
        match counted {
            Ok(counts) => Ok(counts),
            Err(e) if is_cancelled(&e) => Err(e),
            Err(e) => {
                error!("Failed to count rows: {:#}", e);
                self.state
                    .record_failure(Stage::Count, "row count", format!("{:#}", e));
                Ok(RowCounts::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_statement() {
        let statement = combine_statement(
            "import",
            "train",
            &["train_jan19".to_string(), "train_feb19".to_string()],
        );
        assert_eq!(
            statement,
            "DROP TABLE IF EXISTS import.train CASCADE;\
             CREATE TABLE import.train (LIKE import.train_jan19 INCLUDING ALL);\
             INSERT INTO import.train SELECT * FROM \
             (SELECT * FROM import.train_jan19 UNION ALL SELECT * FROM import.train_feb19) AS combined"
        );
    }

    #[test]
    fn test_summary_counts_failures_per_stage() {
        let summary = LoadSummary {
            failures: vec![
                TaskFailure {
                    stage: Stage::Import,
                    target: "a.csv".into(),
                    detail: "exit status: 1".into(),
                },
                TaskFailure {
                    stage: Stage::Combine,
                    target: "a".into(),
                    detail: "exit status: 1".into(),
                },
            ],
            ..LoadSummary::default()
        };
        assert_eq!(summary.failed(Stage::Import), 1);
        assert_eq!(summary.failed(Stage::Extraction), 0);
    }

    #[tokio::test]
    async fn test_no_sources_is_an_error() {
        let loader = Loader::new(LoaderConfig::new(Vec::new()), CancellationToken::new());
        let err = loader.load().await.unwrap_err();
        assert!(err.to_string().contains("No input sources"));
    }
}
