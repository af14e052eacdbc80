//! Progress parsing and display.

use std::sync::OnceLock;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use regex::Regex;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Progress reported by a loader process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressUpdate {
    /// Fraction done, in `[0, 1]`
    pub percent: Option<f64>,
    pub bytes_done: Option<f64>,
    pub bytes_total: Option<f64>,
}

impl ProgressUpdate {
    pub fn is_empty(&self) -> bool {
        self.percent.is_none() && self.bytes_done.is_none() && self.bytes_total.is_none()
    }
}

/// Extracts progress from a chunk of process output.
pub trait ProgressParser: Send + Sync {
    fn parse(&self, text: &str) -> Option<ProgressUpdate>;
}

/// Parses pgfutter's `12.34%` and `1.23 GiB / 4.56 GiB` output.
///
/// A chunk may hold several updates; the last one wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgfutterProgress;

impl ProgressParser for PgfutterProgress {
    fn parse(&self, text: &str) -> Option<ProgressUpdate> {
        static PERCENT_RE: OnceLock<Regex> = OnceLock::new();
        static SIZE_RE: OnceLock<Regex> = OnceLock::new();

        let percent_re = PERCENT_RE.get_or_init(|| Regex::new(r"(\d{1,3}\.\d{2})%").unwrap());
        let size_re = SIZE_RE
            .get_or_init(|| Regex::new(r"(\d+\.\d{2})\sGiB\s/\s(\d+\.\d{2})\sGiB").unwrap());

        let mut update = ProgressUpdate::default();
        if let Some(caps) = percent_re.captures_iter(text).last() {
            update.percent = caps[1]
                .parse::<f64>()
                .ok()
                .map(|p| (p / 100.0).clamp(0.0, 1.0));
        }
        if let Some(caps) = size_re.captures_iter(text).last() {
            update.bytes_done = caps[1].parse::<f64>().ok().map(|g| g * GIB);
            update.bytes_total = caps[2].parse::<f64>().ok().map(|g| g * GIB);
        }
        (!update.is_empty()).then_some(update)
    }
}

/// Receives the aggregate pipeline progress.
pub trait ProgressReporter: Send + Sync {
    fn set_stage(&self, stage: &str);
    fn update(&self, value: f64, max: f64);
    fn finish(&self);
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn set_stage(&self, _stage: &str) {}
    fn update(&self, _value: f64, _max: f64) {}
    fn finish(&self) {}
}

/// Draws a terminal progress bar on stderr.
pub struct IndicatifReporter {
    bar: ProgressBar,
}

/// Bar positions are kept in hundredths so partial imports move the bar.
const SCALE: f64 = 100.0;

impl IndicatifReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {msg:<12} [{bar:40.cyan/blue}] {percent:>3}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }
}

impl Default for IndicatifReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for IndicatifReporter {
    fn set_stage(&self, stage: &str) {
        self.bar.set_message(stage.to_string());
    }

    fn update(&self, value: f64, max: f64) {
        self.bar.set_length((max * SCALE).round() as u64);
        self.bar.set_position((value * SCALE).round() as u64);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
