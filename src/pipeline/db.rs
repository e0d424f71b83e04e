//! Durable store: systems, stations and hourly measurements
//!
//! Tables (see `/sql/` directory):
//! - `system` - tracked bike-share systems
//! - `station` - station identities, plus one `free_bikes` sentinel per system
//! - `measurement` - running totals, unique on `(datetime, station_id)`
//!
//! All datetimes are stored as UTC unix seconds.

use super::error::{PipelineError, StoreError};
use super::types::{
    Measurement, MeasurementRow, MergeResult, Station, StationFilter, StationInfo, System,
    FREE_BIKES_STATION_ID,
};
use crate::sqlite_pragma::apply_optimized_pragmas;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Lookup of persisted stations
pub trait StationRepository: Send + Sync {
    /// Most recently created station matching `(system, station_id)`
    fn resolve_station(&self, system: &str, station_id: &str) -> Result<Option<Station>, StoreError>;

    /// All stations of a system (sentinel included), ordered by station_id
    fn list_stations(&self, system: &str) -> Result<Vec<Station>, StoreError>;

    fn insert_station(
        &self,
        system_id: i64,
        info: &StationInfo,
        created_date: DateTime<Utc>,
    ) -> Result<Station, StoreError>;
}

/// Persisted system registry
pub trait SystemRepository: Send + Sync {
    fn get_system(&self, name: &str) -> Result<Option<System>, StoreError>;

    fn list_systems(&self) -> Result<Vec<System>, StoreError>;

    fn insert_system(&self, name: &str, tz: &str, url: &str) -> Result<System, StoreError>;

    /// Returns false when no system has that name
    fn set_tracking(&self, name: &str, is_tracking: bool) -> Result<bool, StoreError>;

    fn set_tracking_window(
        &self,
        system_id: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}

/// Operations available inside a measurement transaction
pub trait MeasurementTx {
    fn find(&mut self, datetime: DateTime<Utc>, station: i64) -> Result<Option<Measurement>, StoreError>;

    /// Insert, or overwrite the row with the same `(datetime, station)`
    fn upsert(&mut self, measurement: &Measurement) -> Result<(), StoreError>;
}

/// Durable measurement storage
pub trait MeasurementStore: Send + Sync {
    /// Run `f` in one transaction
    ///
    /// Commits when `f` returns Ok. Any error (from `f` or the commit) rolls
    /// back every write made inside the closure.
    fn in_transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn MeasurementTx) -> Result<MergeResult, PipelineError>,
    ) -> Result<MergeResult, PipelineError>;

    /// Measurements of `system` with `start <= datetime <= end`, ordered by
    /// datetime then station_id
    fn range_query(
        &self,
        system: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &StationFilter,
    ) -> Result<Vec<MeasurementRow>, StoreError>;

    /// Earliest and latest measurement datetimes of a system
    fn time_span(&self, system: &str) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StoreError>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir` in file name order and executes them.
/// All SQL files must use "IF NOT EXISTS" clauses, so re-running is safe.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StoreError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(StoreError::InvalidData(format!(
            "Schema directory not found: {}",
            schema_dir
        )));
    }

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let filename = entry.file_name().to_string_lossy().into_owned();
        log::debug!("   ├─ Executing: {}", filename);

        let sql_content = fs::read_to_string(entry.path())?;
        conn.execute_batch(&sql_content)?;
    }

    log::info!("✅ Schema migrations completed");

    Ok(())
}

pub(crate) fn to_ts(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

pub(crate) fn from_ts(ts: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ts))
}

fn from_opt_ts(ts: Option<i64>, column: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ts.map(|ts| from_ts(ts, column)).transpose()
}

const STATION_COLUMNS: &str = "s.id, s.station_id, s.name, s.lat, s.lon, s.created_date, s.system_id";

fn station_from_row(row: &Row) -> rusqlite::Result<Station> {
    Ok(Station {
        id: row.get(0)?,
        station_id: row.get(1)?,
        name: row.get(2)?,
        lat: row.get(3)?,
        lon: row.get(4)?,
        created_date: from_ts(row.get(5)?, 5)?,
        system_id: row.get(6)?,
    })
}

const SYSTEM_COLUMNS: &str = "id, name, tz, url, is_tracking, tracking_start, tracking_end";

fn system_from_row(row: &Row) -> rusqlite::Result<System> {
    Ok(System {
        id: row.get(0)?,
        name: row.get(1)?,
        tz: row.get(2)?,
        url: row.get(3)?,
        is_tracking: row.get(4)?,
        tracking_start: from_opt_ts(row.get(5)?, 5)?,
        tracking_end: from_opt_ts(row.get(6)?, 6)?,
    })
}

/// SQLite implementation of the durable repositories
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database and apply migrations
    pub fn open(db_path: impl AsRef<Path>, schema_dir: &str) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(db_path.as_ref())?;
        apply_optimized_pragmas(&conn)?;
        run_schema_migrations(&mut conn, schema_dir)?;

        log::info!("📊 Opened measurement store: {}", db_path.as_ref().display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl StationRepository for SqliteStore {
    fn resolve_station(&self, system: &str, station_id: &str) -> Result<Option<Station>, StoreError> {
        let conn = self.conn.lock()?;
        let sql = format!(
            "SELECT {} FROM station s JOIN system y ON y.id = s.system_id
             WHERE y.name = ?1 AND s.station_id = ?2
             ORDER BY s.created_date DESC, s.id DESC
             LIMIT 1",
            STATION_COLUMNS
        );
        let station = conn
            .query_row(&sql, params![system, station_id], station_from_row)
            .optional()?;
        Ok(station)
    }

    fn list_stations(&self, system: &str) -> Result<Vec<Station>, StoreError> {
        let conn = self.conn.lock()?;
        let sql = format!(
            "SELECT {} FROM station s JOIN system y ON y.id = s.system_id
             WHERE y.name = ?1
             ORDER BY s.station_id, s.created_date",
            STATION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let stations = stmt
            .query_map([system], station_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stations)
    }

    fn insert_station(
        &self,
        system_id: i64,
        info: &StationInfo,
        created_date: DateTime<Utc>,
    ) -> Result<Station, StoreError> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO station (station_id, name, lat, lon, created_date, system_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                info.station_id,
                info.name,
                info.lat,
                info.lon,
                to_ts(created_date),
                system_id
            ],
        )?;

        Ok(Station {
            id: conn.last_insert_rowid(),
            station_id: info.station_id.clone(),
            name: info.name.clone(),
            lat: info.lat,
            lon: info.lon,
            created_date,
            system_id,
        })
    }
}

impl SystemRepository for SqliteStore {
    fn get_system(&self, name: &str) -> Result<Option<System>, StoreError> {
        let conn = self.conn.lock()?;
        let sql = format!("SELECT {} FROM system WHERE name = ?1", SYSTEM_COLUMNS);
        Ok(conn.query_row(&sql, [name], system_from_row).optional()?)
    }

    fn list_systems(&self) -> Result<Vec<System>, StoreError> {
        let conn = self.conn.lock()?;
        let sql = format!("SELECT {} FROM system ORDER BY name", SYSTEM_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let systems = stmt
            .query_map([], system_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(systems)
    }

    fn insert_system(&self, name: &str, tz: &str, url: &str) -> Result<System, StoreError> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO system (name, tz, url, is_tracking) VALUES (?1, ?2, ?3, 0)",
            params![name, tz, url],
        )?;

        Ok(System {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            tz: tz.to_string(),
            url: url.to_string(),
            is_tracking: false,
            tracking_start: None,
            tracking_end: None,
        })
    }

    fn set_tracking(&self, name: &str, is_tracking: bool) -> Result<bool, StoreError> {
        let conn = self.conn.lock()?;
        let changed = conn.execute(
            "UPDATE system SET is_tracking = ?1 WHERE name = ?2",
            params![is_tracking, name],
        )?;
        Ok(changed > 0)
    }

    fn set_tracking_window(
        &self,
        system_id: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock()?;
        conn.execute(
            "UPDATE system SET tracking_start = ?1, tracking_end = ?2 WHERE id = ?3",
            params![start.map(to_ts), end.map(to_ts), system_id],
        )?;
        Ok(())
    }
}

/// Transaction handle; `conn` is the open `rusqlite::Transaction`
struct SqliteMeasurementTx<'c> {
    conn: &'c Connection,
}

impl MeasurementTx for SqliteMeasurementTx<'_> {
    fn find(&mut self, datetime: DateTime<Utc>, station: i64) -> Result<Option<Measurement>, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT id, datetime, station_id, trips, returns, num_bikes_available, num_docks_available
                 FROM measurement WHERE datetime = ?1 AND station_id = ?2",
                params![to_ts(datetime), station],
                |row| {
                    Ok(Measurement {
                        id: row.get(0)?,
                        datetime: from_ts(row.get(1)?, 1)?,
                        station: row.get(2)?,
                        trips: row.get(3)?,
                        returns: row.get(4)?,
                        num_bikes_available: row.get(5)?,
                        num_docks_available: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    fn upsert(&mut self, m: &Measurement) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO measurement (
                datetime, trips, returns, num_bikes_available, num_docks_available, station_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(datetime, station_id) DO UPDATE SET
                trips = excluded.trips,
                returns = excluded.returns,
                num_bikes_available = excluded.num_bikes_available,
                num_docks_available = excluded.num_docks_available",
            params![
                to_ts(m.datetime),
                m.trips,
                m.returns,
                m.num_bikes_available,
                m.num_docks_available,
                m.station,
            ],
        )?;
        Ok(())
    }
}

impl MeasurementStore for SqliteStore {
    fn in_transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn MeasurementTx) -> Result<MergeResult, PipelineError>,
    ) -> Result<MergeResult, PipelineError> {
        let mut conn = self.conn.lock().map_err(StoreError::from)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // dropping `tx` on the error path rolls back
        let result = {
            let mut handle = SqliteMeasurementTx { conn: &tx };
            f(&mut handle)?
        };

        tx.commit()?;
        Ok(result)
    }

    fn range_query(
        &self,
        system: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &StationFilter,
    ) -> Result<Vec<MeasurementRow>, StoreError> {
        let mut args = vec![
            Value::Text(system.to_string()),
            Value::Integer(to_ts(start)),
            Value::Integer(to_ts(end)),
        ];
        let clause = match filter {
            StationFilter::One(station_id) => {
                args.push(Value::Text(station_id.clone()));
                "AND s.station_id = ?4"
            }
            StationFilter::AllStations => {
                args.push(Value::Text(FREE_BIKES_STATION_ID.to_string()));
                "AND s.station_id != ?4"
            }
            StationFilter::FreeBikesOnly => {
                args.push(Value::Text(FREE_BIKES_STATION_ID.to_string()));
                "AND s.station_id = ?4"
            }
            StationFilter::Everything => "",
        };

        let sql = format!(
            "SELECT m.datetime, s.station_id, s.name, m.trips, m.returns,
                    m.num_bikes_available, m.num_docks_available
             FROM measurement m
             JOIN station s ON s.id = m.station_id
             JOIN system y ON y.id = s.system_id
             WHERE y.name = ?1 AND m.datetime >= ?2 AND m.datetime <= ?3 {}
             ORDER BY m.datetime, s.station_id",
            clause
        );

        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(MeasurementRow {
                    datetime: from_ts(row.get(0)?, 0)?,
                    station_id: row.get(1)?,
                    station: row.get(2)?,
                    trips: row.get(3)?,
                    returns: row.get(4)?,
                    num_bikes_available: row.get(5)?,
                    num_docks_available: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "📥 range_query {} [{} .. {}] {:?}: {} rows",
            system,
            start,
            end,
            filter,
            rows.len()
        );

        Ok(rows)
    }

    fn time_span(&self, system: &str) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StoreError> {
        let conn = self.conn.lock()?;
        let (first, last): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(m.datetime), MAX(m.datetime)
             FROM measurement m
             JOIN station s ON s.id = m.station_id
             JOIN system y ON y.id = s.system_id
             WHERE y.name = ?1",
            [system],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        match (first, last) {
            (Some(first), Some(last)) => Ok(Some((from_ts(first, 0)?, from_ts(last, 1)?))),
            _ => Ok(None),
        }
    }
}
