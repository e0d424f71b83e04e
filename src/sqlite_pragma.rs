//! Shared SQLite connection tuning
//!
//! Applied to every connection the tracker opens (durable store and raw
//! snapshot store). The tracker writes both files while the `activity`
//! binary reads the durable one, so WAL is required.

use rusqlite::Connection;
use std::time::Duration;

/// Apply WAL mode plus throughput PRAGMAs
///
/// - `journal_mode = WAL` lets readers proceed during a merge transaction
/// - `synchronous = NORMAL` is durable enough under WAL
/// - `busy_timeout` covers short lock contention between the two binaries
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "cache_size", -16_000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_pragmas_enable_wal() {
        let temp = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp.path()).unwrap();

        apply_optimized_pragmas(&conn).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
