//! Reduction of raw per-run telemetry files into subject and experiment reports.
//!
//! Layout walked by [`aggregate_final`]:
//! `<data>/<device>/<subject>/[<browser>/]<profiler>/Aggregated.csv`. Native subjects have the
//! profiler directory directly below the subject, web subjects have one level per browser.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, WriterBuilder};
use tracing::debug;

use crate::app::error::HarnessError;

pub const AGGREGATED_FILE: &str = "Aggregated.csv";

/// Mean of every metric column over one subject, keyed by output column name.
pub type SubjectRow = BTreeMap<String, f64>;

/// Which raw columns are metrics and how they are named in the subject row.
#[derive(Debug, Clone, Copy)]
pub struct ColumnPolicy {
    pub skip: fn(&str) -> bool,
    pub prefix: &'static str,
}

/// One line of the final report. Column sets may differ between rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalRow {
    fields: Vec<(String, String)>,
}

impl FinalRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, column: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| name == column) {
            Some(field) => field.1 = value,
            None => self.fields.push((column.to_string(), value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }
}

fn read_error(path: &Path, err: impl std::fmt::Display) -> HarnessError {
    HarnessError::aggregation(format!("Failed to read {}: {err}", path.display()), "")
}

fn write_error(path: &Path, err: impl std::fmt::Display) -> HarnessError {
    HarnessError::aggregation(format!("Failed to write {}: {err}", path.display()), "")
}

fn sorted_entries(dir: &Path, want_dirs: bool) -> Result<Vec<PathBuf>, HarnessError> {
    let entries = fs::read_dir(dir).map_err(|err| read_error(dir, err))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| read_error(dir, err))?.path();
        if path.is_dir() == want_dirs {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Raw telemetry files of a subject: every CSV except a previous aggregate.
pub fn raw_files(dir: &Path) -> Result<Vec<PathBuf>, HarnessError> {
    Ok(sorted_entries(dir, false)?
        .into_iter()
        .filter(|path| {
            path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
                && file_name(path) != AGGREGATED_FILE
        })
        .collect())
}

/// Arithmetic mean of each metric column across all rows of all raw files in `dir`.
/// Empty cells are not samples and are skipped.
pub fn aggregate_subject_dir(dir: &Path, policy: &ColumnPolicy) -> Result<SubjectRow, HarnessError> {
    let files = raw_files(dir)?;
    if files.is_empty() {
        return Err(HarnessError::aggregation(
            format!("No raw telemetry files in {}", dir.display()),
            "",
        ));
    }

    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for path in &files {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|err| read_error(path, err))?;
        let headers = reader.headers().map_err(|err| read_error(path, err))?.clone();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|err| read_error(path, err))?;
            for (column, name) in headers.iter().enumerate() {
                if (policy.skip)(name) {
                    continue;
                }
                let cell = record.get(column).unwrap_or("").trim();
                if cell.is_empty() {
                    continue;
                }
                let value: f64 = cell.parse().map_err(|_| {
                    HarnessError::aggregation(
                        format!(
                            "Malformed value {cell:?} in column {name:?} at line {} of {}",
                            index + 2,
                            path.display()
                        ),
                        "",
                    )
                })?;
                let entry = sums.entry(name.to_string()).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }
    }
    debug!(dir = %dir.display(), files = files.len(), columns = sums.len(), "aggregated subject");

    Ok(sums
        .into_iter()
        .map(|(name, (sum, count))| (format!("{}{name}", policy.prefix), sum / count as f64))
        .collect())
}

/// Writes `Aggregated.csv` holding the subject row; a list of one row.
pub fn write_subject_row(dir: &Path, row: &SubjectRow) -> Result<PathBuf, HarnessError> {
    let mut final_row = FinalRow::new();
    for (name, value) in row {
        final_row.set(name, value.to_string());
    }
    let path = dir.join(AGGREGATED_FILE);
    write_rows(&path, &[final_row])?;
    Ok(path)
}

/// Reads the last data row of `<dir>/Aggregated.csv`, values kept as written.
pub fn read_aggregated(dir: &Path) -> Result<FinalRow, HarnessError> {
    let path = dir.join(AGGREGATED_FILE);
    if !path.is_file() {
        return Err(HarnessError::aggregation(
            format!("Missing aggregated file {}", path.display()),
            "",
        ));
    }
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(&path)
        .map_err(|err| read_error(&path, err))?;
    let headers = reader.headers().map_err(|err| read_error(&path, err))?.clone();
    let mut row = FinalRow::new();
    for record in reader.records() {
        let record = record.map_err(|err| read_error(&path, err))?;
        for (column, name) in headers.iter().enumerate() {
            row.set(name, record.get(column).unwrap_or(""));
        }
    }
    Ok(row)
}

/// Collects one row per subject (and browser, for web subjects) that has `profiler` output.
pub fn aggregate_final(data_dir: &Path, profiler: &str) -> Result<Vec<FinalRow>, HarnessError> {
    let mut rows = Vec::new();
    for device_dir in sorted_entries(data_dir, true)? {
        for subject_dir in sorted_entries(&device_dir, true)? {
            let mut row = FinalRow::new();
            row.set("device", file_name(&device_dir));
            row.set("subject", file_name(&subject_dir));

            let native_dir = subject_dir.join(profiler);
            if native_dir.is_dir() {
                rows.push(merge(row, read_aggregated(&native_dir)?));
                continue;
            }
            for browser_dir in sorted_entries(&subject_dir, true)? {
                let web_dir = browser_dir.join(profiler);
                if web_dir.is_dir() {
                    let mut browser_row = row.clone();
                    browser_row.set("browser", file_name(&browser_dir));
                    rows.push(merge(browser_row, read_aggregated(&web_dir)?));
                }
            }
        }
    }
    debug!(data_dir = %data_dir.display(), profiler, rows = rows.len(), "aggregated experiment");
    Ok(rows)
}

fn merge(mut row: FinalRow, aggregated: FinalRow) -> FinalRow {
    for (name, value) in aggregated.fields {
        row.set(&name, value);
    }
    row
}

/// Writes rows under the union of their columns (first-seen order); absent cells stay blank.
pub fn write_rows(path: &Path, rows: &[FinalRow]) -> Result<(), HarnessError> {
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        for column in row.columns() {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
    }

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| write_error(path, err))?;
    }
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .map_err(|err| write_error(path, err))?;
    writer
        .write_record(&columns)
        .map_err(|err| write_error(path, err))?;
    for row in rows {
        let record: Vec<&str> = columns
            .iter()
            .map(|column| row.get(column).unwrap_or(""))
            .collect();
        writer
            .write_record(&record)
            .map_err(|err| write_error(path, err))?;
    }
    writer.flush().map_err(|err| write_error(path, err))?;
    Ok(())
}

/// Writes a table whose first row is the header.
pub fn write_table(path: &Path, rows: &[Vec<String>]) -> Result<(), HarnessError> {
    let mut writer = WriterBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|err| write_error(path, err))?;
    for row in rows {
        writer
            .write_record(row)
            .map_err(|err| write_error(path, err))?;
    }
    writer.flush().map_err(|err| write_error(path, err))?;
    Ok(())
}

/// Reads every row of a CSV file, header included, without interpreting it.
pub fn read_table(path: &Path) -> Result<Vec<Vec<String>>, HarnessError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|err| read_error(path, err))?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| read_error(path, err))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}
