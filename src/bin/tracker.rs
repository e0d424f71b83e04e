//! Tracker - polls GBFS feeds and merges trips into measurements
//!
//! Usage:
//!   cargo run --release --bin tracker
//!
//! Environment variables:
//!   BIKEFLOW_DB_PATH - measurement database (default: data/bikeflow.db)
//!   BIKEFLOW_RAW_DB_PATH - raw snapshot database (default: data/bikeflow-raw.db)
//!   QUERY_INTERVAL_SECS - feed poll interval (default: 20)
//!   UPDATE_INTERVAL_MINS - merge interval (default: 20)
//!   STATION_CHECK_HOUR - local hour for station list refresh (default: 4)
//!   RUST_LOG - log filter (default: info)

use bikeflow::config::TrackerConfig;
use bikeflow::feed_core::{FeedClient, GbfsClient};
use bikeflow::pipeline::engine::TrackerContext;
use bikeflow::pipeline::scheduler::run_tracker;
use dotenv::dotenv;
use env_logger::Env;
use log::{error, info};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = TrackerConfig::from_env()?;

    info!("🚲 Bikeflow tracker");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Raw snapshots: {}", config.raw_db_path);
    info!("   └─ Feed timeout: {}s", config.feed_timeout_secs);

    let ctx = TrackerContext::open(&config)?;
    let tracking = ctx.tracking_systems()?;
    if tracking.is_empty() {
        info!("⚠️  No systems are being tracked (use `manage add` / `manage activate`)");
    } else {
        let names: Vec<&str> = tracking.iter().map(|s| s.name.as_str()).collect();
        info!("✅ Tracking {} systems: {}", names.len(), names.join(", "));
    }

    let feed: Arc<dyn FeedClient> = Arc::new(GbfsClient::new(config.feed_timeout())?);

    info!("🔄 Press CTRL+C to shutdown gracefully");

    tokio::select! {
        _ = run_tracker(ctx, feed, config) => {}
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
                Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
            }
        }
    }

    info!("✅ Tracker stopped");
    Ok(())
}
