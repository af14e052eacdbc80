//! Commands for the `psql` client.

use std::path::Path;

use crate::config::{DbOptions, Tool};
use crate::exec::CommandSpec;

const FORMATTING: [&str; 2] = ["--tuples-only", "--no-align"];

/// Builds `psql` invocations against one database.
#[derive(Debug, Clone)]
pub struct Psql {
    tool: Tool,
    db: DbOptions,
}

impl Psql {
    pub fn new(tool: Tool, db: DbOptions) -> Self {
        Self { tool, db }
    }

    fn base(&self) -> CommandSpec {
        self.tool
            .command()
            .arg(self.db.conninfo())
            .args(FORMATTING)
    }

    /// Runs a script file.
    pub fn script(&self, path: &Path) -> CommandSpec {
        self.base().arg("-f").arg(path.to_string_lossy())
    }

    /// Runs a statement as is.
    pub fn statement(&self, sql: &str) -> CommandSpec {
        self.base().arg("-c").arg(sql)
    }

    /// Runs a query and returns its rows as a single JSON array.
    pub fn json_query(&self, query: &str) -> CommandSpec {
        self.statement(&wrap_json(query))
    }
}

/// Wraps `query` so its result comes back as one JSON array.
pub fn wrap_json(query: &str) -> String {
    format!("SELECT json_agg(query) FROM ({}) query;", query.trim_end_matches(';'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn psql() -> Psql {
        Psql::new(Tool::new("psql"), DbOptions::default())
    }

    #[test]
    fn test_script_command() {
        let spec = psql().script(&PathBuf::from("/hooks/post.sql"));
        assert_eq!(spec.executable, "psql");
        assert_eq!(
            spec.args,
            [
                "dbname=postgres host=localhost port=5432 user=postgres",
                "--tuples-only",
                "--no-align",
                "-f",
                "/hooks/post.sql"
            ]
        );
    }

    #[test]
    fn test_json_query_wraps_statement() {
        let spec = psql().json_query("SELECT count(*) FROM public.train");
        assert_eq!(spec.args[3], "-c");
        assert_eq!(
            spec.target(),
            "SELECT json_agg(query) FROM (SELECT count(*) FROM public.train) query;"
        );
    }

    #[test]
    fn test_statement_is_passed_verbatim() {
        let spec = psql().statement("DROP TABLE x;");
        assert_eq!(spec.target(), "DROP TABLE x;");
    }
}
