//! Write path: snapshot polling, differencing and measurement merging
//!
//! ## Stages
//!
//! 1. `engine::poll_system` appends GBFS snapshots to the raw store
//! 2. `station_diff` / `free_bike_diff` turn consecutive snapshots into
//!    hourly trip/return rows
//! 3. `merge::derive_and_merge` folds those rows into `measurement` in one
//!    transaction
//! 4. `retention::trim_raw` keeps only the latest snapshot per raw table
//!
//! `scheduler` drives the stages on their intervals.
//!
//! ## Module Organization
//!
//! - `types` - Row types per stage (snapshots, derived rows, measurements)
//! - `error` - `StoreError` / `PipelineError`
//! - `db` - SQLite store traits and implementation
//! - `raw_store` - Per-system raw snapshot tables

pub mod db;
pub mod engine;
pub mod error;
pub mod free_bike_diff;
pub mod merge;
pub mod raw_store;
pub mod retention;
pub mod scheduler;
pub mod station_diff;
pub mod types;

pub use db::{MeasurementStore, MeasurementTx, SqliteStore, StationRepository, SystemRepository};
pub use engine::{poll_system, run_merge_cycle, PollSummary, TrackerContext};
pub use error::{PipelineError, StoreError};
pub use merge::derive_and_merge;
pub use raw_store::{RawSnapshotStore, SqliteRawStore};
pub use types::{DerivedEventRow, Measurement, MergeResult, RawFreeBikeSnapshot, RawStationSnapshot};
