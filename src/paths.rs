//! Input discovery and table naming
//!
//! Data files are named `<table>_<suffix>.csv`, e.g. `train_jan19.csv`. Every file is
//! imported into its own table named after the file stem, and files sharing the
//! prefix before the first underscore belong to the same derived table.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;
use walkdir::WalkDir;

/// Derived table name to the absolute paths of its source files (sorted).
pub type TableGrouping = BTreeMap<String, Vec<PathBuf>>;

/// Turns an arbitrary title into a filesystem and SQL safe name.
///
/// German umlauts are transliterated, dots become underscores, remaining accents
/// are stripped and runs of whitespace or dashes collapse into one underscore.
pub fn to_filename(title: &str) -> String {
    static UNSAFE_RE: OnceLock<Regex> = OnceLock::new();
    static SEPARATOR_RE: OnceLock<Regex> = OnceLock::new();

    let title = title
        .replace('ß', "ss")
        .replace('ä', "ae")
        .replace('ö', "oe")
        .replace('ü', "ue")
        .replace('.', "_");
    let ascii: String = title.nfkd().filter(char::is_ascii).collect();

    let unsafe_re = UNSAFE_RE.get_or_init(|| Regex::new(r"[^\w\s-]").unwrap());
    let separator_re = SEPARATOR_RE.get_or_init(|| Regex::new(r"[-\s]+").unwrap());
    let cleaned = unsafe_re.replace_all(&ascii, "");
    separator_re.replace_all(cleaned.trim(), "_").into_owned()
}

/// The file stem as a string.
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Table a single file is loaded into: its normalized stem.
pub fn file_table_name(path: &Path) -> String {
    to_filename(&file_stem(path))
}

/// Derived table name: the normalized stem up to its first underscore.
///
/// `train_jan19.csv` -> `train`, `example.test.csv` -> `example`
pub fn table_name_for_path(path: &Path) -> String {
    let name = file_table_name(path);
    match name.split_once('_') {
        Some((head, _)) => head.to_string(),
        None => name,
    }
}

/// Where an archive gets extracted to: a sibling directory named after its stem.
pub fn extraction_dir(archive: &Path) -> PathBuf {
    archive.with_file_name(file_stem(archive))
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// Finds files with `extension` at `source`.
///
/// A file source yields itself if the extension matches, a directory yields every
/// matching file below it.
pub fn files_in(source: &Path, extension: &str) -> Vec<PathBuf> {
    if source.is_file() {
        return if has_extension(source, extension) {
            vec![source.to_path_buf()]
        } else {
            Vec::new()
        };
    }
    WalkDir::new(source)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", source.display(), e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && has_extension(entry.path(), extension))
        .map(|entry| entry.into_path())
        .collect()
}

/// Finds files with `extension` across all sources, as sorted unique absolute paths.
pub fn discover_files(sources: &[PathBuf], extension: &str) -> Vec<PathBuf> {
    let unique: BTreeSet<PathBuf> = sources
        .iter()
        .flat_map(|source| files_in(source, extension))
        .map(|path| std::path::absolute(&path).unwrap_or(path))
        .collect();
    unique.into_iter().collect()
}

/// Drops files whose stem matches `pattern`.
pub fn exclude_matching(files: Vec<PathBuf>, pattern: Option<&Regex>) -> Vec<PathBuf> {
    match pattern {
        Some(pattern) => files
            .into_iter()
            .filter(|file| !pattern.is_match(&file_stem(file)))
            .collect(),
        None => files,
    }
}

/// Partitions files by derived table name.
pub fn group_by_table(files: &[PathBuf]) -> TableGrouping {
    let mut grouping = TableGrouping::new();
    for file in files {
        grouping
            .entry(table_name_for_path(file))
            .or_default()
            .push(file.clone());
    }
    for files in grouping.values_mut() {
        files.sort();
    }
    grouping
}
