use crate::telemetry::{Field, Reading, SourceId};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_RECENT_LIMIT: usize = 50;
pub const DEFAULT_EXPORT_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{field} value {value} is outside its accepted range")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("stored row {id} has invalid {column} timestamp {millis}")]
    InvalidTimestamp {
        id: i64,
        column: &'static str,
        millis: i64,
    },
    #[error("stored row {id} has unknown node id {node_id}")]
    InvalidSource { id: i64, node_id: i64 },
    #[error("existing {table} table is missing columns {missing:?}; use a fresh database file")]
    SchemaMismatch {
        table: &'static str,
        missing: Vec<&'static str>,
    },
}

/// A persisted reading plus its identity and insertion time.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredRow {
    pub id: i64,
    pub inserted_at: DateTime<Utc>,
    pub arrival_time: DateTime<Utc>,
    pub source: SourceId,
    pub source_type: String,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub eco2: Option<f64>,
    pub tvoc: Option<f64>,
    pub co: Option<f64>,
    pub no2: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoreStatistics {
    pub total_records: u64,
    pub per_source_counts: BTreeMap<SourceId, u64>,
    pub size_on_disk_bytes: u64,
    pub first_record_time: Option<DateTime<Utc>>,
    pub last_record_time: Option<DateTime<Utc>>,
}

/// Append-only persistence of readings. Only the cooperative pipeline context writes.
pub trait ReadingStore: Send {
    fn insert(&mut self, reading: &Reading, inserted_at: DateTime<Utc>) -> Result<i64, StoreError>;

    /// Newest first.
    fn recent_readings(&self, limit: usize) -> Result<Vec<StoredRow>, StoreError>;

    fn statistics(&self) -> Result<StoreStatistics, StoreError>;

    fn export_rows(&self, limit: usize) -> Result<Vec<StoredRow>, StoreError> {
        self.recent_readings(limit)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sensor_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    inserted_ms INTEGER NOT NULL,
    arrival_ms INTEGER NOT NULL,
    node_id INTEGER NOT NULL CHECK (node_id BETWEEN 1 AND 3),
    node_type TEXT NOT NULL DEFAULT 'Unknown',
    pm25 REAL CHECK (pm25 IS NULL OR pm25 BETWEEN 0 AND 10000),
    pm10 REAL CHECK (pm10 IS NULL OR pm10 BETWEEN 0 AND 10000),
    eco2 REAL CHECK (eco2 IS NULL OR eco2 BETWEEN 0 AND 10000),
    tvoc REAL CHECK (tvoc IS NULL OR tvoc BETWEEN 0 AND 10000),
    co REAL CHECK (co IS NULL OR co BETWEEN 0 AND 10000),
    no2 REAL CHECK (no2 IS NULL OR no2 BETWEEN 0 AND 10000),
    temperature REAL CHECK (temperature IS NULL OR temperature BETWEEN -50 AND 100),
    humidity REAL CHECK (humidity IS NULL OR humidity BETWEEN 0 AND 100)
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_sensor_data_inserted ON sensor_data(inserted_ms);
CREATE INDEX IF NOT EXISTS idx_sensor_data_node_id ON sensor_data(node_id);
"#;

const TABLE: &str = "sensor_data";

const REQUIRED_COLUMNS: [&str; 13] = [
    "id",
    "inserted_ms",
    "arrival_ms",
    "node_id",
    "node_type",
    "pm25",
    "pm10",
    "eco2",
    "tvoc",
    "co",
    "no2",
    "temperature",
    "humidity",
];

const SELECT_ROWS: &str = r#"
SELECT id, inserted_ms, arrival_ms, node_id, node_type,
       pm25, pm10, eco2, tvoc, co, no2, temperature, humidity
FROM sensor_data
ORDER BY inserted_ms DESC, id DESC
LIMIT ?1
"#;

pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.init_schema()?;
        tracing::info!(path = %path.display(), "opened reading store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// An existing `sensor_data` table is kept as is; its columns must match before
    /// indexes or inserts touch it.
    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA)?;

        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1)")?;
        let existing = stmt
            .query_map(params![TABLE], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let missing: Vec<&'static str> = REQUIRED_COLUMNS
            .into_iter()
            .filter(|column| !existing.iter().any(|name| name.eq_ignore_ascii_case(column)))
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::SchemaMismatch {
                table: TABLE,
                missing,
            });
        }

        self.conn.execute_batch(INDEXES)?;
        Ok(())
    }

    fn size_on_disk(&self) -> Result<u64, StoreError> {
        let page_count: i64 = self
            .conn
            .pragma_query_value(None, "page_count", |row| row.get(0))?;
        let page_size: i64 = self
            .conn
            .pragma_query_value(None, "page_size", |row| row.get(0))?;
        Ok(page_count.max(0) as u64 * page_size.max(0) as u64)
    }
}

impl ReadingStore for SqliteStore {
    fn insert(&mut self, reading: &Reading, inserted_at: DateTime<Utc>) -> Result<i64, StoreError> {
        for (field, value) in reading.present() {
            if !field.accepts(value) {
                return Err(StoreError::OutOfRange {
                    field: field.name(),
                    value,
                });
            }
        }

        self.conn.execute(
            r#"
            INSERT INTO sensor_data
                (inserted_ms, arrival_ms, node_id, node_type,
                 pm25, pm10, eco2, tvoc, co, no2, temperature, humidity)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                inserted_at.timestamp_millis(),
                reading.arrival_time().timestamp_millis(),
                i64::from(reading.source().get()),
                reading.source_type(),
                reading.value(Field::Pm25),
                reading.value(Field::Pm10),
                reading.value(Field::Eco2),
                reading.value(Field::Tvoc),
                reading.value(Field::Co),
                reading.value(Field::No2),
                reading.value(Field::Temperature),
                reading.value(Field::Humidity),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn recent_readings(&self, limit: usize) -> Result<Vec<StoredRow>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare_cached(SELECT_ROWS)?;
        let raw = stmt
            .query_map(params![limit], |row| {
                Ok(RawRow {
                    id: row.get(0)?,
                    inserted_ms: row.get(1)?,
                    arrival_ms: row.get(2)?,
                    node_id: row.get(3)?,
                    node_type: row.get(4)?,
                    values: [
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get(11)?,
                        row.get(12)?,
                    ],
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter().map(RawRow::into_stored).collect()
    }

    fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sensor_data", [], |row| row.get(0))?;

        let mut per_source_counts: BTreeMap<SourceId, u64> =
            SourceId::ALL.into_iter().map(|source| (source, 0)).collect();
        let mut stmt = self
            .conn
            .prepare_cached("SELECT node_id, COUNT(*) FROM sensor_data GROUP BY node_id")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (node_id, count) in counts {
            match SourceId::new(node_id) {
                Some(source) => {
                    per_source_counts.insert(source, count.max(0) as u64);
                }
                None => tracing::warn!(node_id, "stored rows reference an unknown node id"),
            }
        }

        let range: Option<(Option<i64>, Option<i64>)> = self
            .conn
            .query_row(
                "SELECT MIN(inserted_ms), MAX(inserted_ms) FROM sensor_data",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (first, last) = range.unwrap_or((None, None));

        Ok(StoreStatistics {
            total_records: total.max(0) as u64,
            per_source_counts,
            size_on_disk_bytes: self.size_on_disk()?,
            first_record_time: first.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            last_record_time: last.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        })
    }
}

struct RawRow {
    id: i64,
    inserted_ms: i64,
    arrival_ms: i64,
    node_id: i64,
    node_type: String,
    values: [Option<f64>; Field::COUNT],
}

impl RawRow {
    fn into_stored(self) -> Result<StoredRow, StoreError> {
        let id = self.id;
        let millis = |column: &'static str, millis: i64| {
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or(StoreError::InvalidTimestamp { id, column, millis })
        };
        let source = SourceId::new(self.node_id).ok_or(StoreError::InvalidSource {
            id,
            node_id: self.node_id,
        })?;
        let [pm25, pm10, eco2, tvoc, co, no2, temperature, humidity] = self.values;
        Ok(StoredRow {
            id,
            inserted_at: millis("inserted_ms", self.inserted_ms)?,
            arrival_time: millis("arrival_ms", self.arrival_ms)?,
            source,
            source_type: self.node_type,
            pm25,
            pm10,
            eco2,
            tvoc,
            co,
            no2,
            temperature,
            humidity,
        })
    }
}
