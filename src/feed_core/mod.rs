//! Feed clients for polling bike-share systems

pub mod gbfs;

use crate::pipeline::types::{RawFreeBikeSnapshot, RawStationSnapshot, StationInfo, System};
use async_trait::async_trait;

pub use gbfs::GbfsClient;

#[derive(Debug)]
pub enum FeedError {
    Http(reqwest::Error),
    Status { url: String, status: u16 },
    Parse(serde_json::Error),
    /// The auto-discovery document does not list this feed
    FeedNotListed(String),
    InvalidPayload(String),
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        FeedError::Http(err)
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Parse(err)
    }
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::Http(e) => write!(f, "HTTP error: {}", e),
            FeedError::Status { url, status } => write!(f, "HTTP {} from {}", status, url),
            FeedError::Parse(e) => write!(f, "JSON parse error: {}", e),
            FeedError::FeedNotListed(name) => write!(f, "Feed '{}' not listed in gbfs.json", name),
            FeedError::InvalidPayload(msg) => write!(f, "Invalid feed payload: {}", msg),
        }
    }
}

impl std::error::Error for FeedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FeedError::Http(e) => Some(e),
            FeedError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

/// Source of point-in-time snapshots for a system
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Current `station_status`, one row per station, stamped with the feed time
    async fn fetch_station_snapshot(&self, system: &System) -> Result<Vec<RawStationSnapshot>, FeedError>;

    /// Current `free_bike_status`, one row per visible bike
    async fn fetch_free_bike_snapshot(&self, system: &System) -> Result<Vec<RawFreeBikeSnapshot>, FeedError>;

    /// Current `station_information` (names and locations)
    async fn fetch_station_information(&self, system: &System) -> Result<Vec<StationInfo>, FeedError>;
}
