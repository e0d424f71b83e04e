//! Tracker scheduler
//!
//! One task drives every tracked system sequentially:
//! - poll tick (`QUERY_INTERVAL_SECS`): fetch snapshots into the raw store
//! - merge tick (`UPDATE_INTERVAL_MINS`): difference, merge, trim, then
//!   refresh each system's tracking window
//! - once per local day at `STATION_CHECK_HOUR`: refresh station lists
//!
//! The system list is re-read on every tick, so systems activated or
//! deactivated while the tracker runs are picked up without a restart.

use super::engine::{poll_system, run_merge_cycle, TrackerContext};
use super::types::System;
use crate::aggregator_core::time_bucket::to_local_time;
use crate::config::TrackerConfig;
use crate::feed_core::FeedClient;
use crate::systems::{ensure_free_bikes_station, refresh_tracking_window, update_stations};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

/// Local date on which a station check should run now, if one is due
///
/// Due when the system's local hour equals `check_hour` and no check ran on
/// that local date yet.
pub fn station_check_due(
    system: &System,
    now: DateTime<Utc>,
    check_hour: u32,
    last_checked: Option<NaiveDate>,
) -> Option<NaiveDate> {
    let tz = system.timezone()?;
    let local = to_local_time(now, tz);
    let today = local.date_naive();
    if local.hour() == check_hour && last_checked != Some(today) {
        Some(today)
    } else {
        None
    }
}

/// Refresh the station list of every tracked system
///
/// Run once at startup. Failures are logged per system.
pub async fn initial_station_update(ctx: &TrackerContext, feed: &dyn FeedClient) {
    let systems = match ctx.tracking_systems() {
        Ok(systems) => systems,
        Err(e) => {
            log::error!("❌ Failed to list systems: {}", e);
            return;
        }
    };

    for system in &systems {
        let now = Utc::now();
        if let Err(e) = ensure_free_bikes_station(ctx, system, now) {
            log::error!("❌ {}: free_bikes station check failed: {}", system.name, e);
        }
        if let Err(e) = update_stations(ctx, feed, system, now).await {
            log::warn!("⚠️  {}: station update failed: {}", system.name, e);
        }
    }
}

/// Poll every tracked system once
pub async fn poll_all(ctx: &TrackerContext, feed: &dyn FeedClient) {
    let systems = match ctx.tracking_systems() {
        Ok(systems) => systems,
        Err(e) => {
            log::error!("❌ Failed to list systems: {}", e);
            return;
        }
    };

    for system in &systems {
        if let Err(e) = poll_system(ctx, feed, system).await {
            log::error!("❌ {}: poll failed: {}", system.name, e);
        }
    }
}

/// Merge every tracked system, then refresh all tracking windows
///
/// A failed merge affects only its own system; its raw rows are kept for the
/// next cycle.
pub fn merge_all(ctx: &TrackerContext) {
    let systems = match ctx.systems.list_systems() {
        Ok(systems) => systems,
        Err(e) => {
            log::error!("❌ Failed to list systems: {}", e);
            return;
        }
    };

    for system in &systems {
        if system.is_tracking {
            if let Err(e) = run_merge_cycle(ctx, &system.name) {
                log::error!("❌ {}: merge failed, raw snapshots kept: {}", system.name, e);
            }
        }
        if let Err(e) = refresh_tracking_window(ctx, system) {
            log::warn!("⚠️  {}: tracking window not updated: {}", system.name, e);
        }
    }
}

async fn check_stations(
    ctx: &TrackerContext,
    feed: &dyn FeedClient,
    config: &TrackerConfig,
    last_checked: &mut HashMap<String, NaiveDate>,
) {
    let systems = match ctx.tracking_systems() {
        Ok(systems) => systems,
        Err(e) => {
            log::error!("❌ Failed to list systems: {}", e);
            return;
        }
    };

    let now = Utc::now();
    for system in &systems {
        let Some(today) = station_check_due(
            system,
            now,
            config.station_check_hour,
            last_checked.get(&system.name).copied(),
        ) else {
            continue;
        };

        match update_stations(ctx, feed, system, now).await {
            Ok(_) => {
                last_checked.insert(system.name.clone(), today);
            }
            Err(e) => log::warn!("⚠️  {}: station check failed: {}", system.name, e),
        }
    }
}

/// Run the tracker until the surrounding task is cancelled
pub async fn run_tracker(ctx: TrackerContext, feed: Arc<dyn FeedClient>, config: TrackerConfig) {
    log::info!("⏰ Starting tracker scheduler");
    log::info!("   ├─ Poll interval: {}s", config.query_interval_secs);
    log::info!("   ├─ Merge interval: {}min", config.update_interval_mins);
    log::info!("   └─ Station check hour: {:02}:00 local", config.station_check_hour);

    initial_station_update(&ctx, feed.as_ref()).await;

    let mut poll_timer = interval(config.query_interval());
    poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut merge_timer = interval_at(Instant::now() + config.update_interval(), config.update_interval());
    merge_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_checked: HashMap<String, NaiveDate> = HashMap::new();

    loop {
        tokio::select! {
            _ = poll_timer.tick() => {
                poll_all(&ctx, feed.as_ref()).await;
                check_stations(&ctx, feed.as_ref(), &config, &mut last_checked).await;
            }
            _ = merge_timer.tick() => {
                merge_all(&ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed_core::FeedError;
    use crate::pipeline::types::{RawFreeBikeSnapshot, RawStationSnapshot, StationInfo, FREE_BIKES_STATION_ID};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

    struct StaticFeed;

    #[async_trait]
    impl FeedClient for StaticFeed {
        async fn fetch_station_snapshot(&self, _system: &System) -> Result<Vec<RawStationSnapshot>, FeedError> {
            Ok(Vec::new())
        }

        async fn fetch_free_bike_snapshot(&self, _system: &System) -> Result<Vec<RawFreeBikeSnapshot>, FeedError> {
            Err(FeedError::FeedNotListed("free_bike_status".to_string()))
        }

        async fn fetch_station_information(&self, _system: &System) -> Result<Vec<StationInfo>, FeedError> {
            Ok(vec![StationInfo {
                station_id: "7001".to_string(),
                name: "Wellesley".to_string(),
                lat: Some(43.66),
                lon: Some(-79.38),
            }])
        }
    }

    fn toronto() -> System {
        System {
            id: 1,
            name: "bike_share_toronto".to_string(),
            tz: "America/Toronto".to_string(),
            url: "u".to_string(),
            is_tracking: true,
            tracking_start: None,
            tracking_end: None,
        }
    }

    #[test]
    fn test_station_check_due_on_local_hour() {
        let system = toronto();
        // 08:30 UTC is 04:30 EDT
        let now = Utc.with_ymd_and_hms(2024, 7, 15, 8, 30, 0).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 7, 15).unwrap();

        assert_eq!(station_check_due(&system, now, 4, None), Some(today));
        assert_eq!(station_check_due(&system, now, 4, Some(today)), None);
        assert_eq!(station_check_due(&system, now, 5, None), None);
    }

    #[test]
    fn test_station_check_due_invalid_timezone() {
        let system = System {
            tz: "Nowhere/Special".to_string(),
            ..toronto()
        };
        let now = Utc.with_ymd_and_hms(2024, 7, 15, 8, 0, 0).unwrap();

        assert_eq!(station_check_due(&system, now, 4, None), None);
    }

    #[tokio::test]
    async fn test_initial_station_update_populates_stations() {
        let dir = TempDir::new().unwrap();
        let config = TrackerConfig {
            db_path: dir.path().join("main.db").to_string_lossy().into_owned(),
            raw_db_path: dir.path().join("raw.db").to_string_lossy().into_owned(),
            schema_dir: SCHEMA_DIR.to_string(),
            ..TrackerConfig::default()
        };
        let ctx = TrackerContext::open(&config).unwrap();
        ctx.systems.insert_system("bike_share_toronto", "America/Toronto", "u").unwrap();
        ctx.systems.set_tracking("bike_share_toronto", true).unwrap();

        initial_station_update(&ctx, &StaticFeed).await;

        let ids: Vec<String> = ctx
            .stations
            .list_stations("bike_share_toronto")
            .unwrap()
            .into_iter()
            .map(|s| s.station_id)
            .collect();
        assert_eq!(ids, vec!["7001".to_string(), FREE_BIKES_STATION_ID.to_string()]);
    }
}
