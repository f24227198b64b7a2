//! Result store
//!
//! Keyed by (analysis type, computed_at). Consumers read the latest result
//! per analysis type; older results stay available as history. Payloads can
//! only be built from [`Sanitized`] values, so nothing non-finite is ever
//! written.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::sanitize::Sanitized;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    FactorImportance,
    SleepQualityFactors,
    Correlations,
    Regression,
    HrvRegression,
    Trends,
    Insights,
    Summary,
}

impl AnalysisType {
    pub const ALL: [AnalysisType; 8] = [
        AnalysisType::FactorImportance,
        AnalysisType::SleepQualityFactors,
        AnalysisType::Correlations,
        AnalysisType::Regression,
        AnalysisType::HrvRegression,
        AnalysisType::Trends,
        AnalysisType::Insights,
        AnalysisType::Summary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::FactorImportance => "factor_importance",
            AnalysisType::SleepQualityFactors => "sleep_quality_factors",
            AnalysisType::Correlations => "correlations",
            AnalysisType::Regression => "regression",
            AnalysisType::HrvRegression => "hrv_regression",
            AnalysisType::Trends => "trends",
            AnalysisType::Insights => "insights",
            AnalysisType::Summary => "summary",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        AnalysisType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| StoreError::UnknownAnalysisType(s.to_string()))
    }
}

/// One persisted analysis result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredResult {
    pub run_id: Uuid,
    pub analysis_type: AnalysisType,
    pub computed_at: DateTime<Utc>,
    pub lookback_days: u32,
    /// Fingerprint of the feature table the result was computed from
    pub input_fingerprint: Option<String>,
    payload: serde_json::Value,
}

impl StoredResult {
    pub fn new<T: Serialize>(
        run_id: Uuid,
        analysis_type: AnalysisType,
        computed_at: DateTime<Utc>,
        lookback_days: u32,
        input_fingerprint: Option<String>,
        result: &Sanitized<T>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            run_id,
            analysis_type,
            computed_at,
            lookback_days,
            input_fingerprint,
            payload: result.to_json()?,
        })
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Deserialize the payload back into a result type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Persistence for analysis results
pub trait ResultStore: Send + Sync {
    /// Store a result. A result with the same type, window and timestamp
    /// replaces the earlier one.
    fn save(&self, result: &StoredResult) -> Result<(), StoreError>;

    /// Most recent result of a type
    fn latest(&self, analysis_type: AnalysisType) -> Result<Option<StoredResult>, StoreError>;

    /// Up to `limit` results of a type, newest first
    fn history(
        &self,
        analysis_type: AnalysisType,
        limit: usize,
    ) -> Result<Vec<StoredResult>, StoreError>;
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|e| StoreError::Unavailable(e.to_string()))
}

/// Store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    results: Mutex<Vec<StoredResult>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.results).map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultStore for InMemoryResultStore {
    fn save(&self, result: &StoredResult) -> Result<(), StoreError> {
        let mut results = lock(&self.results)?;
        results.retain(|r| {
            !(r.analysis_type == result.analysis_type
                && r.lookback_days == result.lookback_days
                && r.computed_at == result.computed_at)
        });
        results.push(result.clone());
        Ok(())
    }

    fn latest(&self, analysis_type: AnalysisType) -> Result<Option<StoredResult>, StoreError> {
        Ok(self.history(analysis_type, 1)?.into_iter().next())
    }

    fn history(
        &self,
        analysis_type: AnalysisType,
        limit: usize,
    ) -> Result<Vec<StoredResult>, StoreError> {
        let results = lock(&self.results)?;
        // Stable sort keeps insertion order among equal timestamps; reverse
        // so the newest insert wins
        let mut matching: Vec<StoredResult> = results
            .iter()
            .filter(|r| r.analysis_type == analysis_type)
            .cloned()
            .collect();
        matching.reverse();
        matching.sort_by(|a, b| b.computed_at.cmp(&a.computed_at));
        matching.truncate(limit);
        Ok(matching)
    }
}

/// SQLite-backed store
pub struct SqliteResultStore {
    conn: Mutex<Connection>,
}

impl fmt::Debug for SqliteResultStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteResultStore").finish_non_exhaustive()
    }
}

impl SqliteResultStore {
    /// Create or open a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn)?;
        info!(path = %path.display(), "Opened result store");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS analytics_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                analysis_type TEXT NOT NULL,
                computed_at TEXT NOT NULL,
                lookback_days INTEGER NOT NULL,
                input_fingerprint TEXT,
                payload TEXT NOT NULL,
                UNIQUE(analysis_type, lookback_days, computed_at) ON CONFLICT REPLACE
            );

            CREATE INDEX IF NOT EXISTS idx_analytics_type_time
                ON analytics_results(analysis_type, computed_at DESC);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored rows across all types
    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = lock(&self.conn)?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM analytics_results", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn result_from_row(row: &Row) -> rusqlite::Result<ResultRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn decode_row(
        (run_id, analysis_type, computed_at, lookback_days, input_fingerprint, payload): ResultRow,
    ) -> Result<StoredResult, StoreError> {
        let run_id = Uuid::parse_str(&run_id)
            .map_err(|e| StoreError::Unavailable(format!("bad run id: {}", e)))?;
        let computed_at = DateTime::parse_from_rfc3339(&computed_at)
            .map_err(|e| StoreError::Unavailable(format!("bad timestamp: {}", e)))?
            .with_timezone(&Utc);
        Ok(StoredResult {
            run_id,
            analysis_type: analysis_type.parse()?,
            computed_at,
            lookback_days,
            input_fingerprint,
            payload: serde_json::from_str(&payload)?,
        })
    }
}

/// Raw `analytics_results` columns, in SELECT order
type ResultRow = (String, String, String, u32, Option<String>, String);

fn timestamp_key(at: &DateTime<Utc>) -> String {
    // Fixed width so lexical order is chronological
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl ResultStore for SqliteResultStore {
    fn save(&self, result: &StoredResult) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&result.payload)?;
        let conn = lock(&self.conn)?;
        conn.execute(
            r#"
            INSERT INTO analytics_results
                (run_id, analysis_type, computed_at, lookback_days, input_fingerprint, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                result.run_id.to_string(),
                result.analysis_type.as_str(),
                timestamp_key(&result.computed_at),
                result.lookback_days,
                result.input_fingerprint,
                payload,
            ],
        )?;
        debug!(
            analysis_type = %result.analysis_type,
            bytes = payload.len(),
            "Stored analysis result"
        );
        Ok(())
    }

    fn latest(&self, analysis_type: AnalysisType) -> Result<Option<StoredResult>, StoreError> {
        let conn = lock(&self.conn)?;
        let row = conn
            .query_row(
                r#"
                SELECT run_id, analysis_type, computed_at, lookback_days, input_fingerprint, payload
                FROM analytics_results
                WHERE analysis_type = ?1
                ORDER BY computed_at DESC, id DESC
                LIMIT 1
                "#,
                params![analysis_type.as_str()],
                Self::result_from_row,
            )
            .optional()?;
        row.map(Self::decode_row).transpose()
    }

    fn history(
        &self,
        analysis_type: AnalysisType,
        limit: usize,
    ) -> Result<Vec<StoredResult>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, analysis_type, computed_at, lookback_days, input_fingerprint, payload
            FROM analytics_results
            WHERE analysis_type = ?1
            ORDER BY computed_at DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(
            params![analysis_type.as_str(), limit as i64],
            Self::result_from_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(Self::decode_row(row?)?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::{sanitize, Sanitize, Sanitizer};
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Score {
        value: f64,
    }

    impl Sanitize for Score {
        fn sanitize(&mut self, s: &mut Sanitizer) {
            s.magnitude("value", &mut self.value);
        }
    }

    fn entry(analysis_type: AnalysisType, minutes: i64, value: f64) -> StoredResult {
        let at = Utc.with_ymd_and_hms(2024, 8, 1, 6, 0, 0).unwrap() + Duration::minutes(minutes);
        StoredResult::new(
            Uuid::new_v4(),
            analysis_type,
            at,
            365,
            Some("abc".to_string()),
            &sanitize(Score { value }),
        )
        .unwrap()
    }

    fn exercise(store: &dyn ResultStore) {
        assert!(store.latest(AnalysisType::Trends).unwrap().is_none());

        store.save(&entry(AnalysisType::Trends, 0, 1.0)).unwrap();
        store.save(&entry(AnalysisType::Trends, 10, 2.0)).unwrap();
        store.save(&entry(AnalysisType::Insights, 20, 3.0)).unwrap();

        let latest = store.latest(AnalysisType::Trends).unwrap().unwrap();
        assert_eq!(latest.decode::<Score>().unwrap(), Score { value: 2.0 });
        assert_eq!(latest.input_fingerprint.as_deref(), Some("abc"));

        // Same key replaces
        store.save(&entry(AnalysisType::Trends, 10, 5.0)).unwrap();
        let history = store.history(AnalysisType::Trends, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].decode::<Score>().unwrap().value, 5.0);
        assert_eq!(history[1].decode::<Score>().unwrap().value, 1.0);
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryResultStore::new();
        exercise(&store);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_sqlite_store_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("analytics.db");

        {
            let store = SqliteResultStore::open(&path).unwrap();
            exercise(&store);
            assert_eq!(store.count().unwrap(), 3);
        }

        let reopened = SqliteResultStore::open(&path).unwrap();
        let latest = reopened.latest(AnalysisType::Insights).unwrap().unwrap();
        assert_eq!(latest.decode::<Score>().unwrap().value, 3.0);
        assert_eq!(latest.lookback_days, 365);
    }

    #[test]
    fn test_non_finite_payload_is_stored_as_sentinel() {
        let store = SqliteResultStore::in_memory().unwrap();
        let result = StoredResult::new(
            Uuid::new_v4(),
            AnalysisType::Regression,
            Utc::now(),
            90,
            None,
            &sanitize(Score { value: f64::NAN }),
        )
        .unwrap();
        store.save(&result).unwrap();

        let latest = store.latest(AnalysisType::Regression).unwrap().unwrap();
        assert_eq!(latest.payload()["value"], 0.0);
    }

    #[test]
    fn test_analysis_type_parsing() {
        assert_eq!(
            "factor-importance".parse::<AnalysisType>().unwrap(),
            AnalysisType::FactorImportance
        );
        assert!(matches!(
            "weather".parse::<AnalysisType>(),
            Err(StoreError::UnknownAnalysisType(_))
        ));
    }
}
