//! Column selection over a Trepn CSV export.
//!
//! An export holds a data block whose header alternates a `Time [ms]` column with one value
//! column (`<Stat Name> [unit]`, sometimes suffixed `(Raw)`/`(Delta)`), followed by a
//! `System Statistics:` section mapping statistic ids to names.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::app::aggregate::{read_table, write_table};
use crate::app::error::HarnessError;

pub const STATISTICS_MARKER: &str = "System Statistics:";

fn column_name(header: &str) -> &str {
    header.split('[').next().unwrap_or(header).trim()
}

/// Index pairs `(time, value)` of every header column named after one of `statistics`,
/// grouped in request order.
pub fn get_wanted_columns(statistics: &[String], header: &[String]) -> Vec<usize> {
    let mut wanted = Vec::new();
    for statistic in statistics {
        for (index, column) in header.iter().enumerate() {
            if index > 0 && column_name(column) == statistic.as_str() {
                wanted.push(index - 1);
                wanted.push(index);
            }
        }
    }
    wanted
}

/// Keeps only the `wanted` columns of every row, in `wanted` order. Short rows yield blanks.
pub fn filter_columns(wanted: &[usize], rows: &[Vec<String>]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|row| {
            wanted
                .iter()
                .map(|&index| row.get(index).cloned().unwrap_or_default())
                .collect()
        })
        .collect()
}

pub fn filter_data(statistics: &[String], rows: &[Vec<String>]) -> Vec<Vec<String>> {
    let Some(header) = rows.first() else {
        return Vec::new();
    };
    filter_columns(&get_wanted_columns(statistics, header), rows)
}

/// Splits an export into its data block and the id-to-name statistics table.
pub fn split_export(rows: Vec<Vec<String>>) -> (Vec<Vec<String>>, HashMap<String, String>) {
    let mut data = Vec::new();
    let mut names = HashMap::new();
    let mut in_statistics = false;
    for row in rows {
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        if row.first().map(|cell| cell.trim()) == Some(STATISTICS_MARKER) {
            in_statistics = true;
            continue;
        }
        if !in_statistics {
            data.push(row);
            continue;
        }
        if let (Some(id), Some(name)) = (row.first(), row.get(1)) {
            let id = id.trim();
            if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
                names.insert(id.to_string(), name.trim().to_string());
            }
        }
    }
    (data, names)
}

/// Rewrites the export at `path` in place, keeping only the statistics in `stat_ids`.
pub fn filter_results(path: &Path, stat_ids: &[String]) -> Result<(), HarnessError> {
    let (data, names) = split_export(read_table(path)?);
    let mut wanted = Vec::with_capacity(stat_ids.len());
    for id in stat_ids {
        match names.get(id) {
            Some(name) => wanted.push(name.clone()),
            None => warn!(file = %path.display(), statistic = %id, "statistic missing from export"),
        }
    }
    let filtered = filter_data(&wanted, &data);
    debug!(file = %path.display(), statistics = ?wanted, rows = filtered.len(), "filtered trepn export");
    write_table(path, &filtered)
}
