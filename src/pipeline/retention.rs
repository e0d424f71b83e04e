//! Raw snapshot retention
//!
//! After a merge the raw tables only need the latest poll: it is the
//! left-hand side of the next cycle's first delta. Everything older has
//! already been counted.

use super::error::StoreError;
use super::raw_store::RawSnapshotStore;
use super::types::RawTable;

/// Delete every raw row except those at the most recent snapshot time
///
/// Returns the number of rows deleted. A missing or empty table is a no-op.
pub fn trim_raw(store: &dyn RawSnapshotStore, system: &str, table: RawTable) -> Result<usize, StoreError> {
    let latest = match store.latest_datetime(system, table) {
        Ok(Some(t)) => t,
        Ok(None) => {
            log::debug!("Raw table {} is empty, nothing to trim", table.table_name(system));
            return Ok(0);
        }
        Err(StoreError::MissingTable(name)) => {
            log::debug!("Raw table {} does not exist yet, nothing to trim", name);
            return Ok(0);
        }
        Err(e) => return Err(e),
    };

    let deleted = store.delete_all_except(system, table, latest)?;
    log::debug!(
        "   ├─ Trimmed {} rows from {} (kept {})",
        deleted,
        table.table_name(system),
        latest
    );
    Ok(deleted)
}
