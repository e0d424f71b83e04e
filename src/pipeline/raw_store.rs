//! Raw snapshot store
//!
//! Polled feed rows land in per-system tables of a separate SQLite file:
//! - `{system}_stations_raw` - one row per station per poll
//! - `{system}_bikes_raw` - one row per visible free bike per poll
//!
//! Tables are created on first append. After each successful merge the
//! trimmer cuts them back to the latest poll.

use super::db::{from_ts, to_ts};
use super::error::StoreError;
use super::types::{is_valid_system_name, RawFreeBikeSnapshot, RawStationSnapshot, RawTable};
use crate::sqlite_pragma::apply_optimized_pragmas;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub trait RawSnapshotStore: Send + Sync {
    fn append_stations(&self, system: &str, rows: &[RawStationSnapshot]) -> Result<usize, StoreError>;

    fn append_free_bikes(&self, system: &str, rows: &[RawFreeBikeSnapshot]) -> Result<usize, StoreError>;

    /// All retained station rows; empty when nothing was ever polled
    fn read_stations(&self, system: &str) -> Result<Vec<RawStationSnapshot>, StoreError>;

    /// All retained free-bike rows; empty when nothing was ever polled
    fn read_free_bikes(&self, system: &str) -> Result<Vec<RawFreeBikeSnapshot>, StoreError>;

    /// Most recent snapshot time. `MissingTable` if the table does not exist.
    fn latest_datetime(&self, system: &str, table: RawTable) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Delete every row whose datetime differs from `keep`; returns rows deleted
    fn delete_all_except(&self, system: &str, table: RawTable, keep: DateTime<Utc>) -> Result<usize, StoreError>;
}

pub struct SqliteRawStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRawStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        apply_optimized_pragmas(&conn)?;

        log::info!("📊 Opened raw snapshot store: {}", db_path.as_ref().display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Physical table name, rejecting system names that are not identifiers
    fn table(system: &str, table: RawTable) -> Result<String, StoreError> {
        if !is_valid_system_name(system) {
            return Err(StoreError::InvalidData(format!("Invalid system name: {:?}", system)));
        }
        Ok(table.table_name(system))
    }

    fn table_exists(conn: &Connection, name: &str) -> Result<bool, StoreError> {
        let found = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn create_table(conn: &Connection, name: &str, table: RawTable) -> Result<(), StoreError> {
        let columns = match table {
            RawTable::Stations => {
                "datetime INTEGER NOT NULL,
                 station_id TEXT NOT NULL,
                 num_bikes_available INTEGER NOT NULL,
                 num_docks_available INTEGER NOT NULL,
                 is_renting INTEGER NOT NULL"
            }
            RawTable::FreeBikes => {
                "datetime INTEGER NOT NULL,
                 bike_id TEXT NOT NULL,
                 lat REAL NOT NULL,
                 lon REAL NOT NULL"
            }
        };
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {name} ({columns});
             CREATE INDEX IF NOT EXISTS idx_{name}_datetime ON {name}(datetime);"
        ))?;
        Ok(())
    }
}

impl RawSnapshotStore for SqliteRawStore {
    fn append_stations(&self, system: &str, rows: &[RawStationSnapshot]) -> Result<usize, StoreError> {
        let name = Self::table(system, RawTable::Stations)?;
        let mut conn = self.conn.lock()?;
        Self::create_table(&conn, &name, RawTable::Stations)?;

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (datetime, station_id, num_bikes_available, num_docks_available, is_renting)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                name
            ))?;
            for row in rows {
                stmt.execute(params![
                    to_ts(row.datetime),
                    row.station_id,
                    row.num_bikes_available,
                    row.num_docks_available,
                    row.is_renting,
                ])?;
            }
        }
        tx.commit()?;

        log::debug!("✅ Appended {} rows to {}", rows.len(), name);
        Ok(rows.len())
    }

    fn append_free_bikes(&self, system: &str, rows: &[RawFreeBikeSnapshot]) -> Result<usize, StoreError> {
        let name = Self::table(system, RawTable::FreeBikes)?;
        let mut conn = self.conn.lock()?;
        Self::create_table(&conn, &name, RawTable::FreeBikes)?;

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (datetime, bike_id, lat, lon) VALUES (?1, ?2, ?3, ?4)",
                name
            ))?;
            for row in rows {
                stmt.execute(params![to_ts(row.datetime), row.bike_id, row.lat, row.lon])?;
            }
        }
        tx.commit()?;

        log::debug!("✅ Appended {} rows to {}", rows.len(), name);
        Ok(rows.len())
    }

    fn read_stations(&self, system: &str) -> Result<Vec<RawStationSnapshot>, StoreError> {
        let name = Self::table(system, RawTable::Stations)?;
        let conn = self.conn.lock()?;
        if !Self::table_exists(&conn, &name)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT datetime, station_id, num_bikes_available, num_docks_available, is_renting
             FROM {} ORDER BY datetime, station_id",
            name
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RawStationSnapshot {
                    datetime: from_ts(row.get(0)?, 0)?,
                    station_id: row.get(1)?,
                    num_bikes_available: row.get(2)?,
                    num_docks_available: row.get(3)?,
                    is_renting: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn read_free_bikes(&self, system: &str) -> Result<Vec<RawFreeBikeSnapshot>, StoreError> {
        let name = Self::table(system, RawTable::FreeBikes)?;
        let conn = self.conn.lock()?;
        if !Self::table_exists(&conn, &name)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT datetime, bike_id, lat, lon FROM {} ORDER BY datetime, bike_id",
            name
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RawFreeBikeSnapshot {
                    datetime: from_ts(row.get(0)?, 0)?,
                    bike_id: row.get(1)?,
                    lat: row.get(2)?,
                    lon: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn latest_datetime(&self, system: &str, table: RawTable) -> Result<Option<DateTime<Utc>>, StoreError> {
        let name = Self::table(system, table)?;
        let conn = self.conn.lock()?;
        if !Self::table_exists(&conn, &name)? {
            return Err(StoreError::MissingTable(name));
        }

        let latest: Option<i64> =
            conn.query_row(&format!("SELECT MAX(datetime) FROM {}", name), [], |row| row.get(0))?;
        Ok(latest.map(|ts| from_ts(ts, 0)).transpose()?)
    }

    fn delete_all_except(&self, system: &str, table: RawTable, keep: DateTime<Utc>) -> Result<usize, StoreError> {
        let name = Self::table(system, table)?;
        let conn = self.conn.lock()?;
        if !Self::table_exists(&conn, &name)? {
            return Err(StoreError::MissingTable(name));
        }

        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE datetime != ?1", name),
            [to_ts(keep)],
        )?;
        Ok(deleted)
    }
}
