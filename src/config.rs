//! Loader configuration

use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::exec::{default_concurrency, CommandSpec, PollerConfig};

/// File extensions accepted as input sources.
pub const SOURCE_EXTENSIONS: &[&str] = &["zip", "csv"];

/// Default row-count discrepancy above which the check reports a fatal condition.
pub const DEFAULT_MAX_DISCREPANCY: u64 = 100;

/// An external program, optionally with leading arguments.
///
/// `sh /opt/loader.sh` is a valid tool: every command built from it starts with
/// `sh /opt/loader.sh` and continues with the stage-specific arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    pub program: String,
    pub args: Vec<String>,
}

impl Tool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Splits a command line on whitespace into program and leading arguments.
    pub fn parse(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next()?;
        Some(Self {
            program: program.to_string(),
            args: parts.map(str::to_string).collect(),
        })
    }

    /// Starts a command line for this tool.
    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(self.program.clone()).args(self.args.iter().cloned())
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// External programs the pipeline drives.
#[derive(Debug, Clone)]
pub struct Tools {
    /// Archive extraction, invoked as `<tool> -o <archive> -d <dir>`
    pub unzip: Tool,
    /// Data loader, invoked as `<tool> <connection flags> -table <name> csv <file>`
    pub loader: Tool,
    /// SQL client
    pub psql: Tool,
    /// Fast line counter, invoked as `<tool> -l <file>`
    pub line_count: Tool,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            unzip: Tool::new("unzip"),
            loader: Tool::new("pgfutter"),
            psql: Tool::new("psql"),
            line_count: Tool::new("wc"),
        }
    }
}

/// Store connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbOptions {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            name: "postgres".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
        }
    }
}

impl DbOptions {
    /// Connection flags in the loader's command-line form.
    pub fn loader_flags(&self) -> Vec<String> {
        let mut flags = vec![
            "--dbname".to_string(),
            self.name.clone(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--username".to_string(),
            self.user.clone(),
        ];
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            flags.push("--pass".to_string());
            flags.push(password.to_string());
        }
        flags
    }

    /// A libpq `key=value` connection string.
    pub fn conninfo(&self) -> String {
        let mut pairs = vec![
            format!("dbname={}", conninfo_value(&self.name)),
            format!("host={}", conninfo_value(&self.host)),
            format!("port={}", self.port),
            format!("user={}", conninfo_value(&self.user)),
        ];
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            pairs.push(format!("password={}", conninfo_value(password)));
        }
        pairs.join(" ")
    }
}

/// Quotes a conninfo value when it contains spaces, quotes or backslashes.
fn conninfo_value(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Configuration for one loader run
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Archive and data files or directories to scan
    pub sources: Vec<PathBuf>,

    /// Extract and import everything again, ignoring previous results and disable flags
    pub all: bool,

    pub disable_unzip: bool,
    pub disable_import: bool,

    /// Combine per-file tables into one table per derived name
    pub combine_tables: bool,

    /// Skip the row-count check after loading
    pub disable_check: bool,

    /// Files whose stem matches this pattern (anchored at the start) are not imported
    pub exclude_regex: Option<String>,

    /// SQL scripts or directories of scripts run before extraction
    pub pre_load: Vec<PathBuf>,

    /// SQL scripts or directories of scripts run after import
    pub post_load: Vec<PathBuf>,

    pub db: DbOptions,
    pub tools: Tools,

    /// Import files one at a time instead of `max_concurrency` at once
    pub sequential_import: bool,

    /// Count rows by parsing each file instead of counting lines
    pub precise_count: bool,

    /// Total row discrepancy above which the check reports a fatal condition
    pub max_discrepancy: u64,

    /// Maximum concurrent processes for bounded batches
    pub max_concurrency: usize,

    /// Schema the loader writes per-file tables into, and where combined tables go
    pub import_schema: String,

    /// Schema whose tables the row-count check queries
    pub check_schema: String,

    /// Polling behaviour for queued batches
    pub poller: PollerConfig,
}

impl LoaderConfig {
    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self {
            sources,
            all: false,
            disable_unzip: false,
            disable_import: false,
            combine_tables: false,
            disable_check: false,
            exclude_regex: None,
            pre_load: Vec::new(),
            post_load: Vec::new(),
            db: DbOptions::default(),
            tools: Tools::default(),
            sequential_import: false,
            precise_count: false,
            max_discrepancy: DEFAULT_MAX_DISCREPANCY,
            max_concurrency: default_concurrency(),
            import_schema: "import".to_string(),
            check_schema: "public".to_string(),
            poller: PollerConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        for source in &self.sources {
            validate_source(source, SOURCE_EXTENSIONS)?;
        }
        for script in self.pre_load.iter().chain(&self.post_load) {
            validate_source(script, &["sql"])?;
        }
        for schema in [&self.import_schema, &self.check_schema] {
            if !is_identifier(schema) {
                return Err(ConfigError::InvalidIdentifier(schema.clone()));
            }
        }
        self.exclude_pattern()?;
        Ok(())
    }

    /// The compiled exclusion filter, anchored at the start of the file stem.
    pub fn exclude_pattern(&self) -> Result<Option<Regex>, ConfigError> {
        let Some(pattern) = self.exclude_regex.as_deref() else {
            return Ok(None);
        };
        Regex::new(&format!("^(?:{})", pattern))
            .map(Some)
            .map_err(|source| ConfigError::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })
    }
}

/// Checks that `path` is a directory or a file with one of `extensions`.
pub fn validate_source(path: &Path, extensions: &[&str]) -> Result<(), ConfigError> {
    if path.is_dir() {
        return Ok(());
    }
    if !path.is_file() {
        return Err(ConfigError::SourceNotFound(path.to_path_buf()));
    }
    let matches = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|want| e.eq_ignore_ascii_case(want)))
        .unwrap_or(false);
    if matches {
        Ok(())
    } else {
        Err(ConfigError::InvalidSource {
            path: path.to_path_buf(),
            expected: extensions.join(", "),
        })
    }
}

/// Maps a `--log-level` name to a tracing level directive.
///
/// There is no fatal level in tracing, so `FATAL` logs at error.
pub fn log_level_directive(level: &str) -> Result<&'static str, ConfigError> {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => Ok("debug"),
        "INFO" => Ok("info"),
        "WARNING" | "WARN" => Ok("warn"),
        "ERROR" | "FATAL" => Ok("error"),
        _ => Err(ConfigError::InvalidLogLevel(level.to_string())),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No input sources given")]
    NoSources,

    #[error("{0} is not a directory or existing file")]
    SourceNotFound(PathBuf),

    #[error("{path} must be a directory or a file of type {expected}")]
    InvalidSource { path: PathBuf, expected: String },

    #[error("Invalid exclude regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid schema name: {0}")]
    InvalidIdentifier(String),

    #[error("{0} is not a valid log level. Must be one of DEBUG, INFO, WARNING, ERROR, FATAL")]
    InvalidLogLevel(String),
}
