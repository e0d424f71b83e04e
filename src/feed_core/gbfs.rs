//! GBFS feed client
//!
//! Every system is configured with its auto-discovery URL (`gbfs.json`).
//! Each fetch first resolves the concrete feed URL from that document, then
//! downloads the feed:
//!
//! ```text
//! gbfs.json ─► data.en.feeds[name == "station_status"].url ─► station_status.json
//! ```
//!
//! Parsing is lenient about the variations seen in the wild: ids as numbers
//! or strings, `is_renting` as bool or 0/1, records under `data` or at the
//! top level, `bikes` (v2) or `vehicles` (v3).

use super::{FeedClient, FeedError};
use crate::pipeline::types::{RawFreeBikeSnapshot, RawStationSnapshot, StationInfo, System};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

pub const STATION_STATUS: &str = "station_status";
pub const STATION_INFORMATION: &str = "station_information";
pub const FREE_BIKE_STATUS: &str = "free_bike_status";

pub struct GbfsClient {
    client: reqwest::Client,
}

impl GbfsClient {
    pub fn new(timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bikeflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn get_json(&self, url: &str) -> Result<Value, FeedError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FeedError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Resolve a feed through the system's auto-discovery document and fetch it
    async fn fetch_feed(&self, system: &System, feed: &str) -> Result<Value, FeedError> {
        let discovery = self.get_json(&system.url).await?;
        let url = find_feed_url(&discovery, feed)?;
        log::debug!("{}: {} -> {}", system.name, feed, url);
        self.get_json(&url).await
    }
}

#[async_trait]
impl FeedClient for GbfsClient {
    async fn fetch_station_snapshot(&self, system: &System) -> Result<Vec<RawStationSnapshot>, FeedError> {
        let doc = self.fetch_feed(system, STATION_STATUS).await?;
        parse_station_status(&doc, Utc::now())
    }

    async fn fetch_free_bike_snapshot(&self, system: &System) -> Result<Vec<RawFreeBikeSnapshot>, FeedError> {
        let doc = self.fetch_feed(system, FREE_BIKE_STATUS).await?;
        parse_free_bikes(&doc, Utc::now())
    }

    async fn fetch_station_information(&self, system: &System) -> Result<Vec<StationInfo>, FeedError> {
        let doc = self.fetch_feed(system, STATION_INFORMATION).await?;
        parse_station_information(&doc)
    }
}

/// Find a feed URL in a `gbfs.json` document
///
/// Looks in `data.en.feeds`, then the first language present, then
/// `data.feeds` (GBFS v3 has no language level).
pub fn find_feed_url(discovery: &Value, feed: &str) -> Result<String, FeedError> {
    let data = discovery
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| FeedError::InvalidPayload("gbfs.json has no data object".to_string()))?;

    let feeds = data
        .get("feeds")
        .or_else(|| data.get("en").and_then(|l| l.get("feeds")))
        .or_else(|| data.values().find_map(|l| l.get("feeds")))
        .and_then(Value::as_array)
        .ok_or_else(|| FeedError::InvalidPayload("gbfs.json lists no feeds".to_string()))?;

    feeds
        .iter()
        .find(|f| f.get("name").and_then(Value::as_str) == Some(feed))
        .and_then(|f| f.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| FeedError::FeedNotListed(feed.to_string()))
}

/// Feed timestamp (`last_updated`), falling back to `now`
fn snapshot_time(doc: &Value, now: DateTime<Utc>) -> DateTime<Utc> {
    match doc.get("last_updated") {
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(now),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(now),
        _ => now,
    }
}

/// Record array under `data.{key}` or `{key}`
fn records<'a>(doc: &'a Value, keys: &[&str]) -> Result<&'a Vec<Value>, FeedError> {
    keys.iter()
        .find_map(|key| {
            doc.get("data")
                .and_then(|d| d.get(*key))
                .or_else(|| doc.get(*key))
                .and_then(Value::as_array)
        })
        .ok_or_else(|| FeedError::InvalidPayload(format!("no {} array", keys.join("/"))))
}

fn id_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_u32(v: Option<&Value>) -> Option<u32> {
    v?.as_u64().and_then(|n| u32::try_from(n).ok())
}

fn as_bool(v: Option<&Value>) -> Option<bool> {
    match v? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Display text: plain string, or the first entry of a localized array
fn text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items
            .first()
            .and_then(|i| i.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Parse `station_status`
///
/// Duplicate `(station_id, last_reported)` records are dropped. Records
/// without a station id or bike count are skipped.
pub fn parse_station_status(doc: &Value, now: DateTime<Utc>) -> Result<Vec<RawStationSnapshot>, FeedError> {
    let datetime = snapshot_time(doc, now);
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for record in records(doc, &["stations"])? {
        let (Some(station_id), Some(bikes)) = (
            id_string(record.get("station_id")),
            as_u32(record.get("num_bikes_available")),
        ) else {
            log::debug!("Skipping incomplete station_status record: {}", record);
            continue;
        };

        let last_reported = record.get("last_reported").map(Value::to_string);
        if !seen.insert((station_id.clone(), last_reported)) {
            continue;
        }

        out.push(RawStationSnapshot {
            datetime,
            station_id,
            num_bikes_available: bikes,
            num_docks_available: as_u32(record.get("num_docks_available")).unwrap_or(0),
            is_renting: as_bool(record.get("is_renting")).unwrap_or(true),
        });
    }

    Ok(out)
}

/// Parse `free_bike_status` (v2 `bikes` or v3 `vehicles`)
pub fn parse_free_bikes(doc: &Value, now: DateTime<Utc>) -> Result<Vec<RawFreeBikeSnapshot>, FeedError> {
    let datetime = snapshot_time(doc, now);

    let bikes = records(doc, &["bikes", "vehicles"])?
        .iter()
        .filter_map(|record| {
            Some(RawFreeBikeSnapshot {
                datetime,
                bike_id: id_string(record.get("bike_id").or_else(|| record.get("vehicle_id")))?,
                lat: record.get("lat")?.as_f64()?,
                lon: record.get("lon")?.as_f64()?,
            })
        })
        .collect();

    Ok(bikes)
}

/// Parse `station_information`
pub fn parse_station_information(doc: &Value) -> Result<Vec<StationInfo>, FeedError> {
    let stations = records(doc, &["stations"])?
        .iter()
        .filter_map(|record| {
            let station_id = id_string(record.get("station_id"))?;
            Some(StationInfo {
                name: text(record.get("name")).unwrap_or_else(|| station_id.clone()),
                station_id,
                lat: record.get("lat").and_then(Value::as_f64),
                lon: record.get("lon").and_then(Value::as_f64),
            })
        })
        .collect();

    Ok(stations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_find_feed_url_prefers_english() {
        let doc = json!({
            "data": {
                "fr": {"feeds": [{"name": "station_status", "url": "https://x/fr/status"}]},
                "en": {"feeds": [
                    {"name": "system_information", "url": "https://x/en/info"},
                    {"name": "station_status", "url": "https://x/en/status"}
                ]}
            }
        });

        assert_eq!(find_feed_url(&doc, STATION_STATUS).unwrap(), "https://x/en/status");
        assert!(matches!(
            find_feed_url(&doc, FREE_BIKE_STATUS),
            Err(FeedError::FeedNotListed(_))
        ));
    }

    #[test]
    fn test_find_feed_url_other_language_and_v3() {
        let fr = json!({"data": {"fr": {"feeds": [{"name": "station_status", "url": "u-fr"}]}}});
        assert_eq!(find_feed_url(&fr, STATION_STATUS).unwrap(), "u-fr");

        let v3 = json!({"data": {"feeds": [{"name": "station_status", "url": "u-v3"}]}});
        assert_eq!(find_feed_url(&v3, STATION_STATUS).unwrap(), "u-v3");
    }

    #[test]
    fn test_parse_station_status() {
        let doc = json!({
            "last_updated": 1714564800,
            "data": {"stations": [
                {"station_id": 7001, "num_bikes_available": 4, "num_docks_available": 11, "is_renting": 1, "last_reported": 1714564700},
                {"station_id": "7001", "num_bikes_available": 4, "num_docks_available": 11, "is_renting": 1, "last_reported": 1714564700},
                {"station_id": "7002", "num_bikes_available": 0, "num_docks_available": 20, "is_renting": false, "last_reported": 1714564750},
                {"station_id": "7003", "num_docks_available": 20}
            ]}
        });

        let rows = parse_station_status(&doc, now()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].station_id, "7001");
        assert_eq!(rows[0].datetime, Utc.timestamp_opt(1714564800, 0).unwrap());
        assert!(rows[0].is_renting);
        assert!(!rows[1].is_renting);
    }

    #[test]
    fn test_snapshot_time_falls_back_to_now() {
        let doc = json!({"stations": [{"station_id": "1", "num_bikes_available": 2}]});
        let rows = parse_station_status(&doc, now()).unwrap();
        assert_eq!(rows[0].datetime, now());
        assert_eq!(rows[0].num_docks_available, 0);
    }

    #[test]
    fn test_parse_free_bikes() {
        let doc = json!({
            "last_updated": 1714564800,
            "data": {"bikes": [
                {"bike_id": "abc", "lat": 49.28, "lon": -123.12},
                {"bike_id": 42, "lat": 49.29, "lon": -123.11},
                {"bike_id": "no-location"}
            ]}
        });

        let bikes = parse_free_bikes(&doc, now()).unwrap();
        assert_eq!(bikes.len(), 2);
        assert_eq!(bikes[1].bike_id, "42");
    }

    #[test]
    fn test_parse_station_information() {
        let doc = json!({"data": {"stations": [
            {"station_id": "7001", "name": "Wellesley Station", "lat": 43.66, "lon": -79.38},
            {"station_id": "7002", "name": [{"text": "St. George", "language": "en"}]}
        ]}});

        let stations = parse_station_information(&doc).unwrap();
        assert_eq!(stations[0].name, "Wellesley Station");
        assert_eq!(stations[1].name, "St. George");
        assert_eq!(stations[1].lat, None);
    }

    #[test]
    fn test_missing_records_is_invalid_payload() {
        let doc = json!({"data": {}});
        assert!(matches!(
            parse_station_status(&doc, now()),
            Err(FeedError::InvalidPayload(_))
        ));
    }
}
