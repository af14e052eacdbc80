//! Row-count verification after loading.
//!
//! For every derived table the store is asked for its row count, which is compared
//! against the summed row counts of the table's source files.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{error, info};

use crate::count::RowCounts;
use crate::exec::{ProcessError, ProcessRunner};
use crate::paths::{file_stem, TableGrouping};
use crate::sql::Psql;

/// Tables with more source files than this list none of them in the report.
const MAX_LISTED_FILES: usize = 5;

/// One line of the verification report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscrepancyRow {
    pub table: String,
    /// Source file stems, `None` when there are too many to list
    pub source_files: Option<Vec<String>>,
    pub source_file_count: usize,
    pub source_rows: u64,
    pub store_rows: u64,
    pub difference: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub rows: Vec<DiscrepancyRow>,
    pub total_delta: u64,
    pub threshold: u64,
}

impl VerificationReport {
    /// Compares source counts with store counts for every table in `grouping`.
    ///
    /// Missing counts on either side count as zero.
    pub fn build(
        grouping: &TableGrouping,
        source_counts: &RowCounts,
        store_counts: &BTreeMap<String, u64>,
        threshold: u64,
    ) -> Self {
        let rows: Vec<DiscrepancyRow> = grouping
            .iter()
            .map(|(table, files)| {
                let source_rows = files
                    .iter()
                    .map(|f| source_counts.get(f).copied().unwrap_or(0))
                    .sum::<u64>();
                let store_rows = store_counts.get(table).copied().unwrap_or(0);
                DiscrepancyRow {
                    table: table.clone(),
                    source_files: (files.len() <= MAX_LISTED_FILES)
                        .then(|| files.iter().map(|f| file_stem(f)).collect()),
                    source_file_count: files.len(),
                    source_rows,
                    store_rows,
                    difference: source_rows.abs_diff(store_rows),
                }
            })
            .collect();
        let total_delta = rows.iter().map(|r| r.difference).sum();
        Self {
            rows,
            total_delta,
            threshold,
        }
    }

    pub fn threshold_exceeded(&self) -> bool {
        self.total_delta > self.threshold
    }

    /// Renders the report as a table.
    pub fn render(&self) -> String {
        use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                "table",
                "csv files",
                "total rows (csv files)",
                "total rows (database)",
                "difference",
            ]);
        for row in &self.rows {
            let files = match &row.source_files {
                Some(stems) => stems.join(", "),
                None => format!("omitted ({} files)", row.source_file_count),
            };
            table.add_row(vec![
                row.table.clone(),
                files,
                row.source_rows.to_string(),
                row.store_rows.to_string(),
                row.difference.to_string(),
            ]);
        }
        table.to_string()
    }
}

#[derive(Deserialize)]
struct CountRow {
    count: u64,
}

/// Reads the count out of `[{"count": N}]` as produced by a JSON-wrapped query.
pub fn parse_count(stdout: &str) -> Option<u64> {
    let rows: Vec<CountRow> = serde_json::from_str(stdout.trim()).ok()?;
    rows.first().map(|row| row.count)
}

/// Queries row counts and reports discrepancies.
pub struct VerificationReporter<'a> {
    runner: &'a ProcessRunner,
    psql: &'a Psql,
    schema: &'a str,
    threshold: u64,
}

impl<'a> VerificationReporter<'a> {
    pub fn new(runner: &'a ProcessRunner, psql: &'a Psql, schema: &'a str, threshold: u64) -> Self {
        Self {
            runner,
            psql,
            schema,
            threshold,
        }
    }

    /// Current row count of `table`, zero if the query fails or cannot be parsed.
    async fn store_count(&self, table: &str) -> Result<u64, ProcessError> {
        let spec = self
            .psql
            .json_query(&format!("SELECT count(*) FROM {}.{}", self.schema, table));
        let output = match self.runner.sync_run(&spec).await {
            Ok(output) => output,
            Err(ProcessError::Cancelled) => return Err(ProcessError::Cancelled),
            Err(e) => {
                error!("Failed to query row count of {}: {}", table, e);
                return Ok(0);
            }
        };
        let stdout = output.stdout_text();
        match parse_count(&stdout) {
            Some(count) => Ok(count),
            None => {
                error!("Could not parse row count of {}: {:?}", table, stdout.trim());
                let stderr = output.stderr_text();
                if !stderr.trim().is_empty() {
                    error!("{}", stderr.trim());
                }
                Ok(0)
            }
        }
    }

    /// Builds the report, logs it and flags a fatal condition above the threshold.
    pub async fn verify(
        &self,
        grouping: &TableGrouping,
        source_counts: &RowCounts,
    ) -> Result<VerificationReport, ProcessError> {
        info!("Running post load check");
        let mut store_counts = BTreeMap::new();
        for table in grouping.keys() {
            store_counts.insert(table.clone(), self.store_count(table).await?);
        }

        let report = VerificationReport::build(grouping, source_counts, &store_counts, self.threshold);
        info!("\n{}", report.render());
        if report.threshold_exceeded() {
            error!(
                "FATAL: {} entries were not loaded into the database!",
                report.total_delta
            );
        }
        Ok(report)
    }
}
