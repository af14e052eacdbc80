//! pgimport - bulk PostgreSQL loader

use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use pgimport::config::{
    log_level_directive, DbOptions, LoaderConfig, Tool, Tools, DEFAULT_MAX_DISCREPANCY,
};
use pgimport::exec::{default_concurrency, ProcessRunner};
use pgimport::loader::{LoadSummary, Loader, Stage};
use pgimport::progress::{IndicatifReporter, NoopReporter, ProgressReporter};

#[derive(Parser, Debug)]
#[command(name = "pgimport")]
#[command(version)]
#[command(about = "Extracts, imports and verifies csv data dumps in PostgreSQL")]
struct Cli {
    /// Zip archives, csv files or directories containing them
    sources: Vec<PathBuf>,

    /// Extract and import everything again, even if already done or disabled
    #[arg(long)]
    all: bool,

    /// Do not extract archives
    #[arg(long)]
    disable_unzip: bool,

    /// Do not import csv files
    #[arg(long)]
    disable_import: bool,

    /// Combine the per-file tables of each derived table name
    #[arg(long)]
    combine_tables: bool,

    /// Skip the row count check after loading
    #[arg(long)]
    disable_check: bool,

    /// Do not import files whose name (without extension) matches this pattern
    #[arg(long)]
    exclude_regex: Option<String>,

    /// SQL scripts or directories of scripts to run before extraction
    #[arg(long, num_args = 1..)]
    pre_load: Vec<PathBuf>,

    /// SQL scripts or directories of scripts to run after import
    #[arg(long, num_args = 1..)]
    post_load: Vec<PathBuf>,

    #[arg(long, env = "DB_NAME", default_value = "postgres")]
    db_name: String,

    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    db_host: String,

    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    db_port: u16,

    #[arg(long, env = "DB_USER", default_value = "postgres")]
    db_user: String,

    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    db_password: Option<String>,

    /// One of DEBUG, INFO, WARNING, ERROR, FATAL (RUST_LOG directives apply on top)
    #[arg(long, default_value = "INFO", value_parser = log_level_directive)]
    log_level: &'static str,

    /// Do not draw a progress bar
    #[arg(long)]
    no_progress: bool,

    /// Import one file at a time
    #[arg(long)]
    sequential_import: bool,

    /// Count rows by parsing the csv files instead of counting lines
    #[arg(long)]
    precise_count: bool,

    /// Total row discrepancy reported as fatal
    #[arg(long, default_value_t = DEFAULT_MAX_DISCREPANCY)]
    max_discrepancy: u64,

    /// Processes run at once per batch (defaults to half the CPU threads)
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Schema the loader creates per-file tables in
    #[arg(long, default_value = "import")]
    import_schema: String,

    /// Schema whose tables the row count check queries
    #[arg(long, default_value = "public")]
    check_schema: String,

    /// Archive extraction command
    #[arg(long)]
    unzip_bin: Option<String>,

    /// Loader command
    #[arg(long)]
    loader_bin: Option<String>,

    /// psql command
    #[arg(long)]
    psql_bin: Option<String>,
}

impl Cli {
    fn into_config(self) -> LoaderConfig {
        let defaults = Tools::default();
        let tool = |command: Option<String>, default: Tool| {
            command.as_deref().and_then(Tool::parse).unwrap_or(default)
        };
        let tools = Tools {
            unzip: tool(self.unzip_bin, defaults.unzip),
            loader: tool(self.loader_bin, defaults.loader),
            psql: tool(self.psql_bin, defaults.psql),
            line_count: defaults.line_count,
        };

        let mut config = LoaderConfig::new(self.sources);
        config.all = self.all;
        config.disable_unzip = self.disable_unzip;
        config.disable_import = self.disable_import;
        config.combine_tables = self.combine_tables;
        config.disable_check = self.disable_check;
        config.exclude_regex = self.exclude_regex;
        config.pre_load = self.pre_load;
        config.post_load = self.post_load;
        config.db = DbOptions {
            name: self.db_name,
            host: self.db_host,
            port: self.db_port,
            user: self.db_user,
            password: self.db_password,
        };
        config.tools = tools;
        config.sequential_import = self.sequential_import;
        config.precise_count = self.precise_count;
        config.max_discrepancy = self.max_discrepancy;
        config.max_concurrency = self.max_concurrency.unwrap_or_else(default_concurrency);
        config.import_schema = self.import_schema;
        config.check_schema = self.check_schema;
        config
    }
}

/// Parses the command line, dropping every argument clap does not know.
fn parse_lenient(mut args: Vec<OsString>) -> (Cli, Vec<String>) {
    let mut ignored = Vec::new();
    loop {
        let err = match Cli::try_parse_from(&args) {
            Ok(cli) => return (cli, ignored),
            Err(err) => err,
        };
        if err.kind() != ErrorKind::UnknownArgument {
            err.exit();
        }
        let Some(ContextValue::String(unknown)) = err.get(ContextKind::InvalidArg) else {
            err.exit();
        };
        let unknown = unknown.clone();
        let with_value = format!("{}=", unknown);
        let before = args.len();
        args.retain(|arg| {
            let arg = arg.to_string_lossy();
            arg != unknown && !arg.starts_with(&with_value)
        });
        if args.len() == before {
            err.exit();
        }
        ignored.push(unknown);
    }
}

fn warn_missing_tools(config: &LoaderConfig) {
    let tools = &config.tools;
    for tool in [&tools.unzip, &tools.loader, &tools.psql, &tools.line_count] {
        if which::which(&tool.program).is_err() {
            warn!("{} was not found in PATH", tool.program);
        }
    }
}

/// Cancels `cancel` on SIGINT, SIGTERM or SIGHUP.
fn cancel_on_signal(cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => {},
                _ = terminate.recv() => {},
                _ = hangup.recv() => {},
            }
            warn!("Received signal, shutting down");
            cancel.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received Ctrl+C, shutting down");
                cancel.cancel();
            }
        });
    }

    Ok(())
}

fn print_summary(summary: &LoadSummary) {
    let scripts_failed = summary.failed(Stage::PreLoad)
        + summary.failed(Stage::Setup)
        + summary.failed(Stage::PostLoad);

    println!("\n=== Summary ===");
    println!(
        "Archives:   {} found, {} extracted, {} skipped, {} failed",
        summary.archives_found,
        summary.archives_extracted,
        summary.archives_skipped,
        summary.failed(Stage::Extraction)
    );
    println!(
        "Files:      {} found, {} imported, {} excluded, {} skipped, {} failed",
        summary.files_found,
        summary.files_imported,
        summary.files_excluded,
        summary.files_skipped,
        summary.failed(Stage::Import)
    );
    println!("Scripts:    {} run, {} failed", summary.scripts_run, scripts_failed);
    if summary.tables_combined + summary.tables_skipped + summary.failed(Stage::Combine) > 0 {
        println!(
            "Tables:     {} combined, {} skipped, {} failed",
            summary.tables_combined,
            summary.tables_skipped,
            summary.failed(Stage::Combine)
        );
    }
    if let Some(report) = &summary.verification {
        println!(
            "Rows:       {} counted files, {} rows differ (threshold {})",
            summary.rows_counted, report.total_delta, report.threshold
        );
    }

    if summary.cancelled {
        println!("\nLoad was cancelled. Run again to continue.");
    } else if !summary.failures.is_empty() {
        println!("\nSome tasks failed:");
        for failure in &summary.failures {
            println!("  [{}] {}: {}", failure.stage, failure.target, failure.detail);
        }
    } else if summary
        .verification
        .as_ref()
        .is_some_and(|report| report.threshold_exceeded())
    {
        println!("\nLoad complete, but the row counts do not match.");
    } else {
        println!("\nLoad complete!");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let (cli, ignored) = parse_lenient(std::env::args_os().collect());

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("pgimport={}", cli.log_level).parse()?),
        )
        .init();
    for arg in &ignored {
        warn!("Ignoring unknown argument {}", arg);
    }

    let show_progress = !cli.no_progress && std::io::stderr().is_terminal();
    let config = cli.into_config();
    config.validate()?;
    warn_missing_tools(&config);

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;

    let reporter: Arc<dyn ProgressReporter> = if show_progress {
        Arc::new(IndicatifReporter::new())
    } else {
        Arc::new(NoopReporter)
    };
    let loader = Loader::with_runner(config, ProcessRunner::new(cancel), reporter);
    let summary = loader.load().await?;

    print_summary(&summary);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<OsString> {
        std::iter::once("pgimport")
            .chain(args.iter().copied())
            .map(OsString::from)
            .collect()
    }

    #[test]
    fn test_cli_defaults() {
        let (cli, ignored) = parse_lenient(args(&["data/"]));
        assert!(ignored.is_empty());
        assert_eq!(cli.log_level, "info");

        let config = cli.into_config();
        assert_eq!(config.sources, [PathBuf::from("data/")]);
        assert_eq!(config.max_discrepancy, DEFAULT_MAX_DISCREPANCY);
        assert_eq!(config.tools.loader, Tool::new("pgfutter"));
        assert_eq!(config.import_schema, "import");
        assert!(!config.combine_tables);
    }

    #[test]
    fn test_unknown_arguments_are_ignored() {
        let (cli, ignored) = parse_lenient(args(&[
            "--combine-tables",
            "--frobnicate",
            "a.zip",
            "--shiny=yes",
        ]));
        assert_eq!(ignored.len(), 2);
        assert_eq!(ignored[0], "--frobnicate");
        assert!(ignored[1].starts_with("--shiny"));
        assert!(cli.combine_tables);
        assert_eq!(cli.sources, [PathBuf::from("a.zip")]);
    }

    #[test]
    fn test_script_lists_and_tool_overrides() {
        let (cli, _) = parse_lenient(args(&[
            "--pre-load",
            "a.sql",
            "b.sql",
            "--loader-bin",
            "sh /opt/loader.sh",
            "--log-level",
            "FATAL",
            "data",
        ]));
        assert_eq!(cli.log_level, "error");
        assert_eq!(cli.pre_load, [PathBuf::from("a.sql"), PathBuf::from("b.sql")]);
        assert_eq!(cli.sources, [PathBuf::from("data")]);

        let config = cli.into_config();
        assert_eq!(config.tools.loader.program, "sh");
        assert_eq!(config.tools.loader.args, ["/opt/loader.sh"]);
    }
}
