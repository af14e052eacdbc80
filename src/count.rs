//! Counting rows of data files.
//!
//! Two modes:
//! - fast: `wc -l` per file, run as a bounded process batch
//! - precise: every file is parsed as space delimited, `|` quoted CSV on a
//!   dedicated rayon pool

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::Tool;
use crate::exec::{CommandSpec, ConcurrencyLimiter};

/// Rows per data file.
pub type RowCounts = BTreeMap<PathBuf, u64>;

/// Workers for precise counting: all cores but one.
pub fn precise_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .saturating_sub(1)
        .max(1)
}

/// Counts lines of every file with the line-count tool.
///
/// Files whose count cannot be read are missing from the result.
pub async fn count_lines(
    limiter: &ConcurrencyLimiter,
    tool: &Tool,
    files: &[PathBuf],
) -> Result<RowCounts> {
    if files.is_empty() {
        info!("No csv files to count entries for");
        return Ok(RowCounts::new());
    }
    let specs: Vec<CommandSpec> = files
        .iter()
        .map(|file| tool.command().arg("-l").arg(file.to_string_lossy()))
        .collect();
    let outputs = limiter.run_bounded(specs).await?;

    let mut counts = RowCounts::new();
    for output in outputs {
        let text = String::from_utf8_lossy(&output);
        for line in text.lines() {
            match parse_line_count(line) {
                Some((path, count)) => {
                    counts.insert(path, count);
                }
                None => debug!("Unexpected line count output: {}", line),
            }
        }
    }
    Ok(counts)
}

/// Parses one `wc -l` output line, `<count> <path>`.
pub fn parse_line_count(line: &str) -> Option<(PathBuf, u64)> {
    static LINE_RE: OnceLock<Regex> = OnceLock::new();
    let line_re = LINE_RE.get_or_init(|| Regex::new(r"^\s*(\d+) (.*)$").unwrap());

    let caps = line_re.captures(line)?;
    let count = caps[1].parse().ok()?;
    let path = caps[2].trim();
    if path == "total" {
        return None;
    }
    Some((PathBuf::from(path), count))
}

/// Counts records of every file on a pool of `workers` threads.
///
/// Runs on a blocking task; the pool is torn down only after every file is done.
/// Files that cannot be read are logged and missing from the result.
pub async fn count_records_all(files: Vec<PathBuf>, workers: usize) -> Result<RowCounts> {
    if files.is_empty() {
        info!("No csv files to count entries for");
        return Ok(RowCounts::new());
    }
    tokio::task::spawn_blocking(move || {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("row-count-{}", i))
            .build()
            .context("Failed to build row counting pool")?;
        let counted: Vec<(PathBuf, Result<u64>)> = pool.install(|| {
            files
                .into_par_iter()
                .map(|file| {
                    let count = count_records(&file);
                    (file, count)
                })
                .collect()
        });

        let mut counts = RowCounts::new();
        for (file, count) in counted {
            match count {
                Ok(count) => {
                    counts.insert(file, count);
                }
                Err(e) => warn!("Could not count rows of {}: {:#}", file.display(), e),
            }
        }
        Ok(counts)
    })
    .await
    .context("Row counting task failed")?
}

/// Counts the CSV rows in one file.
///
/// Every blank line is a row of its own, so the count matches a line count for files
/// without quoted line breaks. A record spanning several lines is one row.
pub fn count_records(path: &Path) -> Result<u64> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let text = decode(&bytes)?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b' ')
        .quote(b'|')
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = 0u64;
    let mut record_lines = 0u64;
    for record in reader.byte_records() {
        let record =
            record.with_context(|| format!("Malformed record in {}", path.display()))?;
        records += 1;
        record_lines += 1 + record.as_slice().iter().filter(|&&b| b == b'\n').count() as u64;
    }

    // The reader skips blank lines; every line not covered by a record is one.
    let blank_lines = physical_lines(&text).saturating_sub(record_lines);
    Ok(records + blank_lines)
}

fn physical_lines(text: &str) -> u64 {
    let newlines = text.bytes().filter(|&b| b == b'\n').count() as u64;
    if text.is_empty() || text.ends_with('\n') {
        newlines
    } else {
        newlines + 1
    }
}

/// Decodes file contents, honouring a byte-order mark.
///
/// Without a BOM the bytes are taken as UTF-8, falling back to Windows-1252.
fn decode(bytes: &[u8]) -> Result<Cow<'_, str>> {
    if let Some((encoding, bom_len)) = encoding_rs::Encoding::for_bom(bytes) {
        let (text, had_errors) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        if had_errors {
            bail!("{} decoding error", encoding.name());
        }
        return Ok(text);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Ok(Cow::Borrowed(text)),
        Err(_) => {
            let (text, _) = encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes);
            Ok(text)
        }
    }
}
