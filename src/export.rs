//! Feature table export
//!
//! Writes an engineered [`FeatureTable`] as an ML-ready CSV: one row per
//! day, filled feature values, and a `split` column marking the
//! chronological train/validation partition the factor models use.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use csv::Writer;
use thiserror::Error;
use tracing::info;

use crate::factors::chronological_split;
use crate::features::{Feature, FeatureTable};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Nothing to export: {0}")]
    Empty(String),
}

/// Which side of the chronological split a row falls on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitType {
    Train,
    Validation,
}

impl SplitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitType::Train => "train",
            SplitType::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureExportOptions {
    /// Share of the most recent rows labelled `validation`
    pub validation_fraction: f64,
    /// Emit unobserved cells empty instead of their filled value
    pub leave_unobserved_empty: bool,
    /// Skip columns constant across the window
    pub skip_degenerate: bool,
}

impl Default for FeatureExportOptions {
    fn default() -> Self {
        Self {
            validation_fraction: 0.2,
            leave_unobserved_empty: false,
            skip_degenerate: false,
        }
    }
}

/// Columns in output order: the target first when the table has one
fn export_columns(table: &FeatureTable, options: &FeatureExportOptions) -> Vec<Feature> {
    let target = table.target();
    target
        .into_iter()
        .chain(Feature::ALL.iter().copied().filter(|&f| Some(f) != target))
        .filter(|&f| !(options.skip_degenerate && table.is_degenerate(f)))
        .collect()
}

/// Split label per row, oldest rows first
pub fn split_labels(rows: usize, validation_fraction: f64) -> Vec<SplitType> {
    let training_rows = chronological_split(rows, validation_fraction);
    (0..rows)
        .map(|i| {
            if i < training_rows {
                SplitType::Train
            } else {
                SplitType::Validation
            }
        })
        .collect()
}

/// Write the table as CSV to any writer; returns the number of data rows
pub fn write_feature_table<W: Write>(
    table: &FeatureTable,
    options: &FeatureExportOptions,
    out: W,
) -> Result<usize, ExportError> {
    if table.is_empty() {
        return Err(ExportError::Empty("feature table has no rows".to_string()));
    }

    let columns = export_columns(table, options);
    let splits = split_labels(table.len(), options.validation_fraction);
    let mut writer = Writer::from_writer(out);

    let mut header = Vec::with_capacity(columns.len() + 2);
    header.push("date".to_string());
    header.extend(columns.iter().map(|f| f.name().to_string()));
    header.push("split".to_string());
    writer.write_record(&header)?;

    for (row, split) in table.rows().iter().zip(&splits) {
        let mut record = Vec::with_capacity(header.len());
        record.push(row.date.format("%Y-%m-%d").to_string());
        for &feature in &columns {
            let cell = if options.leave_unobserved_empty && !row.is_observed(feature) {
                String::new()
            } else {
                row.get(feature).to_string()
            };
            record.push(cell);
        }
        record.push(split.as_str().to_string());
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(table.len())
}

/// Write the table to a CSV file
pub fn export_feature_table<P: AsRef<Path>>(
    table: &FeatureTable,
    options: &FeatureExportOptions,
    output_path: P,
) -> Result<usize, ExportError> {
    let path = output_path.as_ref();
    let file = File::create(path)?;
    let rows = write_feature_table(table, options, file)?;
    info!(rows, path = %path.display(), "Exported feature table");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureRow;
    use crate::models::DateRange;
    use chrono::NaiveDate;

    fn table(days: usize) -> FeatureTable {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let rows: Vec<FeatureRow> = (0..days)
            .map(|i| {
                let date = start + chrono::Duration::days(i as i64);
                FeatureRow::new(date)
                    .with(Feature::RecoveryScore, 50.0 + i as f64)
                    .with(Feature::SleepHours, 7.0 + (i % 3) as f64 * 0.5)
            })
            .collect();
        let window = DateRange::new(start, start + chrono::Duration::days(days as i64 - 1));
        FeatureTable::from_rows(Some(Feature::RecoveryScore), window, rows)
    }

    #[test]
    fn test_split_labels_hold_out_most_recent_rows() {
        let labels = split_labels(10, 0.2);
        assert_eq!(labels.iter().filter(|s| **s == SplitType::Train).count(), 8);
        assert_eq!(labels[7], SplitType::Train);
        assert_eq!(labels[8], SplitType::Validation);
        assert_eq!(labels[9], SplitType::Validation);
    }

    #[test]
    fn test_split_labels_single_row_is_training() {
        assert_eq!(split_labels(1, 0.5), vec![SplitType::Train]);
    }

    #[test]
    fn test_write_feature_table_layout() {
        let table = table(5);
        let mut buffer = Vec::new();
        let rows =
            write_feature_table(&table, &FeatureExportOptions::default(), &mut buffer).unwrap();
        assert_eq!(rows, 5);

        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with("date,recovery_score,"));
        assert!(lines[0].ends_with(",split"));
        assert!(lines[1].starts_with("2024-03-01,50,"));
        assert!(lines[5].ends_with(",validation"));
    }

    #[test]
    fn test_unobserved_cells_left_empty_on_request() {
        let table = table(3);
        let options = FeatureExportOptions {
            leave_unobserved_empty: true,
            ..Default::default()
        };
        let mut buffer = Vec::new();
        write_feature_table(&table, &options, &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let header: Vec<&str> = text.lines().next().unwrap().split(',').collect();
        let first: Vec<&str> = text.lines().nth(1).unwrap().split(',').collect();
        let hrv = header.iter().position(|h| *h == Feature::HrvRmssdMilli.name()).unwrap();
        assert_eq!(first[hrv], "");
    }

    #[test]
    fn test_empty_table_is_rejected() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let empty = FeatureTable::from_rows(None, DateRange::new(start, start), Vec::new());
        let result = write_feature_table(&empty, &FeatureExportOptions::default(), Vec::new());
        assert!(matches!(result, Err(ExportError::Empty(_))));
    }

    #[test]
    fn test_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.csv");
        let rows =
            export_feature_table(&table(4), &FeatureExportOptions::default(), &path).unwrap();
        assert_eq!(rows, 4);
        assert!(std::fs::read_to_string(&path).unwrap().contains("train"));
    }
}
