//! Tracker engine: store handles plus the poll and merge cycles
//!
//! ```text
//! every query interval        every update interval
//! ────────────────────        ─────────────────────
//! FeedClient                  RawSnapshotStore::read_*
//!     ↓                           ↓
//! RawSnapshotStore::append_*  derive_and_merge (one transaction)
//!                                 ↓
//!                             trim_raw (both tables, only on success)
//! ```
//!
//! A failed merge leaves the raw tables untouched, so the next cycle sees the
//! same snapshots plus whatever was polled in between.

use super::db::{MeasurementStore, SqliteStore, StationRepository, SystemRepository};
use super::error::{PipelineError, StoreError};
use super::merge::derive_and_merge;
use super::raw_store::{RawSnapshotStore, SqliteRawStore};
use super::retention::trim_raw;
use super::types::{MergeResult, RawTable, System};
use crate::config::TrackerConfig;
use crate::feed_core::{FeedClient, FeedError};
use std::sync::Arc;

/// Store handles shared by the tracker, the registry and the query path
#[derive(Clone)]
pub struct TrackerContext {
    pub raw: Arc<dyn RawSnapshotStore>,
    pub stations: Arc<dyn StationRepository>,
    pub measurements: Arc<dyn MeasurementStore>,
    pub systems: Arc<dyn SystemRepository>,
}

impl TrackerContext {
    /// Wire one SQLite store into every durable role
    pub fn from_stores(store: Arc<SqliteStore>, raw: Arc<SqliteRawStore>) -> Self {
        Self {
            raw,
            stations: store.clone(),
            measurements: store.clone(),
            systems: store,
        }
    }

    /// Open both SQLite files named by the config, running migrations
    pub fn open(config: &TrackerConfig) -> Result<Self, StoreError> {
        let store = Arc::new(SqliteStore::open(&config.db_path, &config.schema_dir)?);
        let raw = Arc::new(SqliteRawStore::open(&config.raw_db_path)?);
        Ok(Self::from_stores(store, raw))
    }

    pub fn tracking_systems(&self) -> Result<Vec<System>, StoreError> {
        Ok(self
            .systems
            .list_systems()?
            .into_iter()
            .filter(|s| s.is_tracking)
            .collect())
    }
}

/// Rows appended by one poll
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub stations: usize,
    pub free_bikes: usize,
}

/// Fetch both snapshot feeds of a system and append them to the raw store
///
/// Feed failures skip that feed for this poll. Storage failures are returned.
pub async fn poll_system(
    ctx: &TrackerContext,
    feed: &dyn FeedClient,
    system: &System,
) -> Result<PollSummary, PipelineError> {
    let mut summary = PollSummary::default();

    match feed.fetch_station_snapshot(system).await {
        Ok(rows) => summary.stations = ctx.raw.append_stations(&system.name, &rows)?,
        Err(e) => log::warn!("⚠️  {}: station_status poll skipped: {}", system.name, e),
    }

    match feed.fetch_free_bike_snapshot(system).await {
        Ok(rows) => summary.free_bikes = ctx.raw.append_free_bikes(&system.name, &rows)?,
        // many systems have no free-floating fleet
        Err(FeedError::FeedNotListed(_)) => {}
        Err(e) => log::warn!("⚠️  {}: free_bike_status poll skipped: {}", system.name, e),
    }

    log::debug!(
        "📥 {}: polled {} stations, {} free bikes",
        system.name,
        summary.stations,
        summary.free_bikes
    );

    Ok(summary)
}

/// Difference the retained raw snapshots, merge, then trim on success
pub fn run_merge_cycle(ctx: &TrackerContext, system: &str) -> Result<MergeResult, PipelineError> {
    let station_rows = ctx.raw.read_stations(system)?;
    let bike_rows = ctx.raw.read_free_bikes(system)?;

    let result = derive_and_merge(ctx, system, &station_rows, &bike_rows)?;

    let trimmed_stations = trim_raw(ctx.raw.as_ref(), system, RawTable::Stations)?;
    let trimmed_bikes = trim_raw(ctx.raw.as_ref(), system, RawTable::FreeBikes)?;

    log::info!("✅ {} merge complete", system);
    log::info!("   ├─ Derived rows: {}", result.rows_derived);
    log::info!("   ├─ Created / updated: {} / {}", result.created, result.updated);
    log::info!("   ├─ Trips / returns: {} / {}", result.trips, result.returns);
    log::info!("   └─ Raw rows trimmed: {}", trimmed_stations + trimmed_bikes);

    Ok(result)
}
