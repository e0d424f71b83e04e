//! Read path: time bucketing, grouping and activity queries
//!
//! ```text
//! ActivityRequest::parse (local YYYYMMDDHH → UTC range)
//!     ↓
//! MeasurementStore::range_query
//!     ↓
//! aggregate (localize, bucket, group_by)
//!     ↓
//! Vec<Record> → JSON
//! ```

pub mod group;
pub mod query;
pub mod request;
pub mod time_bucket;

pub use group::{group_by, FieldValue, Record, Reducer};
pub use query::{aggregate, list_stations, list_systems, run_activity, StationListing};
pub use request::{ActivityRequest, ActivityScope, QueryError};
pub use time_bucket::Frequency;
