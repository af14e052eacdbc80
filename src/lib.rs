//! pgimport - bulk PostgreSQL loader
//!
//! Extracts archived data dumps, imports every delimited file through an external
//! loader process, runs SQL hooks around the load and checks the row counts that
//! ended up in the database against the source files.

pub mod config;
pub mod count;
pub mod exec;
pub mod loader;
pub mod paths;
pub mod progress;
pub mod sql;
pub mod verify;
