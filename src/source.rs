//! Record query interface
//!
//! The analytics core never writes records; it only asks a [`RecordSource`]
//! for one category over a date range. An empty result is not an error.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SourceError;
use crate::models::{
    CycleRecord, DateRange, PhysiologicalRecord, RecordCategory, RecoveryRecord, SleepRecord,
    WorkoutRecord,
};

/// Read-only, date-filterable access to physiological records
pub trait RecordSource: Send + Sync {
    /// Return every record of `category` for `user_id` whose date falls in
    /// `range`, ordered by date.
    fn fetch(
        &self,
        category: RecordCategory,
        range: DateRange,
        user_id: &str,
    ) -> Result<Vec<PhysiologicalRecord>, SourceError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Export file layout: one array per category
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordExport {
    #[serde(default)]
    pub recovery: Vec<RecoveryRecord>,
    #[serde(default)]
    pub sleep: Vec<SleepRecord>,
    #[serde(default)]
    pub workouts: Vec<WorkoutRecord>,
    #[serde(default)]
    pub cycles: Vec<CycleRecord>,
}

impl RecordExport {
    pub fn into_records(self) -> Vec<PhysiologicalRecord> {
        let mut records = Vec::with_capacity(
            self.recovery.len() + self.sleep.len() + self.workouts.len() + self.cycles.len(),
        );
        records.extend(self.recovery.into_iter().map(PhysiologicalRecord::Recovery));
        records.extend(self.sleep.into_iter().map(PhysiologicalRecord::Sleep));
        records.extend(self.workouts.into_iter().map(PhysiologicalRecord::Workout));
        records.extend(self.cycles.into_iter().map(PhysiologicalRecord::Cycle));
        records
    }
}

/// Records held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordSource {
    records: Vec<PhysiologicalRecord>,
}

impl InMemoryRecordSource {
    pub fn new(records: Vec<PhysiologicalRecord>) -> Self {
        Self { records }
    }

    pub fn push(&mut self, record: PhysiologicalRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn query(
        &self,
        category: RecordCategory,
        range: DateRange,
        user_id: &str,
    ) -> Vec<PhysiologicalRecord> {
        let mut matching: Vec<PhysiologicalRecord> = self
            .records
            .iter()
            .filter(|r| {
                r.category() == category && r.user_id() == user_id && range.contains(r.date())
            })
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.timestamp());
        matching
    }
}

impl RecordSource for InMemoryRecordSource {
    fn fetch(
        &self,
        category: RecordCategory,
        range: DateRange,
        user_id: &str,
    ) -> Result<Vec<PhysiologicalRecord>, SourceError> {
        Ok(self.query(category, range, user_id))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Records loaded once from a JSON export file
#[derive(Debug, Clone)]
pub struct JsonRecordSource {
    path: PathBuf,
    inner: InMemoryRecordSource,
}

impl JsonRecordSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let content = fs::read_to_string(&path).map_err(|e| SourceError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let export: RecordExport =
            serde_json::from_str(&content).map_err(|e| SourceError::Malformed {
                reason: e.to_string(),
            })?;

        let records = export.into_records();
        tracing::info!(
            path = %path.display(),
            records = records.len(),
            "Loaded record export"
        );

        Ok(Self {
            path,
            inner: InMemoryRecordSource::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl RecordSource for JsonRecordSource {
    fn fetch(
        &self,
        category: RecordCategory,
        range: DateRange,
        user_id: &str,
    ) -> Result<Vec<PhysiologicalRecord>, SourceError> {
        Ok(self.inner.query(category, range, user_id))
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use tempfile::tempdir;

    fn recovery_on(day: u32, user: &str) -> RecoveryRecord {
        RecoveryRecord {
            id: format!("r{}", day),
            user_id: user.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, day, 7, 0, 0).unwrap(),
            recovery_score: Some(60.0 + day as f64),
            hrv_rmssd_milli: Some(55.0),
            resting_heart_rate: Some(52.0),
            spo2_percentage: None,
            skin_temp_celsius: None,
        }
    }

    fn range(start: u32, end: u32) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, start).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, end).unwrap(),
        )
    }

    #[test]
    fn test_fetch_filters_and_orders() {
        let source = InMemoryRecordSource::new(vec![
            PhysiologicalRecord::Recovery(recovery_on(5, "u1")),
            PhysiologicalRecord::Recovery(recovery_on(2, "u1")),
            PhysiologicalRecord::Recovery(recovery_on(3, "u2")),
            PhysiologicalRecord::Recovery(recovery_on(20, "u1")),
        ]);

        let records = source
            .fetch(RecordCategory::Recovery, range(1, 10), "u1")
            .unwrap();
        let days: Vec<u32> = records
            .iter()
            .map(|r| chrono::Datelike::day(&r.date()))
            .collect();
        assert_eq!(days, vec![2, 5]);
    }

    #[test]
    fn test_empty_category_is_not_an_error() {
        let source = InMemoryRecordSource::new(vec![PhysiologicalRecord::Recovery(
            recovery_on(2, "u1"),
        )]);
        let records = source
            .fetch(RecordCategory::Workout, range(1, 10), "u1")
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_json_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("export.json");
        let export = RecordExport {
            recovery: vec![recovery_on(2, "u1"), recovery_on(3, "u1")],
            ..Default::default()
        };
        fs::write(&path, serde_json::to_string(&export).unwrap()).unwrap();

        let source = JsonRecordSource::open(&path).unwrap();
        assert_eq!(source.len(), 2);
        let records = source
            .fetch(RecordCategory::Recovery, range(1, 31), "u1")
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_json_source_errors() {
        let dir = tempdir().unwrap();
        let missing = JsonRecordSource::open(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(SourceError::Unreadable { .. })));

        let path = dir.path().join("bad.json");
        fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(matches!(
            JsonRecordSource::open(&path),
            Err(SourceError::Malformed { .. })
        ));
    }
}
