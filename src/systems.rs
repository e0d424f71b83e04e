//! System registry
//!
//! Administration of tracked systems: adding them from a systems file,
//! toggling tracking, refreshing station lists from `station_information`
//! and keeping each system's tracking window current.

use crate::feed_core::{FeedClient, FeedError};
use crate::pipeline::engine::TrackerContext;
use crate::pipeline::error::StoreError;
use crate::pipeline::types::{is_valid_system_name, StationInfo, System, FREE_BIKES_STATION_ID};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

#[derive(Debug)]
pub enum RegistryError {
    InvalidName(String),
    InvalidTimezone(String),
    AlreadyExists(String),
    UnknownSystem(String),
    Store(StoreError),
    Feed(FeedError),
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        RegistryError::Store(err)
    }
}

impl From<FeedError> for RegistryError {
    fn from(err: FeedError) -> Self {
        RegistryError::Feed(err)
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Io(err)
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Parse(err)
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::InvalidName(n) => {
                write!(f, "Invalid system name '{}' (use letters, digits and _)", n)
            }
            RegistryError::InvalidTimezone(tz) => write!(f, "Unknown timezone '{}'", tz),
            RegistryError::AlreadyExists(n) => write!(f, "System '{}' already exists", n),
            RegistryError::UnknownSystem(n) => write!(f, "No system named '{}'", n),
            RegistryError::Store(e) => write!(f, "Store error: {}", e),
            RegistryError::Feed(e) => write!(f, "Feed error: {}", e),
            RegistryError::Io(e) => write!(f, "IO error: {}", e),
            RegistryError::Parse(e) => write!(f, "Systems file parse error: {}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

/// One entry of a systems file
///
/// Extra keys (brand, city, ...) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SystemDefinition {
    pub name: String,
    pub tz: String,
    pub url: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SystemsFile {
    Keyed(BTreeMap<String, SystemDefinition>),
    List(Vec<SystemDefinition>),
}

/// Parse a systems file: either `{"key": {name, tz, url}, ...}` or a list
pub fn parse_systems(json: &str) -> Result<Vec<SystemDefinition>, RegistryError> {
    let systems = match serde_json::from_str::<SystemsFile>(json)? {
        SystemsFile::Keyed(map) => map.into_values().collect(),
        SystemsFile::List(list) => list,
    };
    Ok(systems)
}

pub fn load_systems(path: impl AsRef<Path>) -> Result<Vec<SystemDefinition>, RegistryError> {
    let content = std::fs::read_to_string(path)?;
    parse_systems(&content)
}

/// Register a new system and start tracking it
///
/// Also creates the system's `free_bikes` sentinel station.
pub fn add_system(
    ctx: &TrackerContext,
    def: &SystemDefinition,
    now: DateTime<Utc>,
) -> Result<System, RegistryError> {
    if !is_valid_system_name(&def.name) {
        return Err(RegistryError::InvalidName(def.name.clone()));
    }
    if def.tz.parse::<chrono_tz::Tz>().is_err() {
        return Err(RegistryError::InvalidTimezone(def.tz.clone()));
    }
    if ctx.systems.get_system(&def.name)?.is_some() {
        return Err(RegistryError::AlreadyExists(def.name.clone()));
    }

    let mut system = ctx.systems.insert_system(&def.name, &def.tz, &def.url)?;
    ctx.systems.set_tracking(&system.name, true)?;
    ctx.systems.set_tracking_window(system.id, Some(now), None)?;
    system.is_tracking = true;
    system.tracking_start = Some(now);

    ensure_free_bikes_station(ctx, &system, now)?;

    log::info!("✅ Added system {} ({})", system.name, system.tz);
    Ok(system)
}

/// Turn tracking on or off for a system
pub fn set_tracking(ctx: &TrackerContext, name: &str, is_tracking: bool) -> Result<(), RegistryError> {
    if !ctx.systems.set_tracking(name, is_tracking)? {
        return Err(RegistryError::UnknownSystem(name.to_string()));
    }
    log::info!(
        "{} {} tracking",
        name,
        if is_tracking { "▶️  started" } else { "⏸️  stopped" }
    );
    Ok(())
}

/// Create the `free_bikes` sentinel station if missing; returns true if created
pub fn ensure_free_bikes_station(
    ctx: &TrackerContext,
    system: &System,
    now: DateTime<Utc>,
) -> Result<bool, RegistryError> {
    if ctx
        .stations
        .resolve_station(&system.name, FREE_BIKES_STATION_ID)?
        .is_some()
    {
        return Ok(false);
    }

    let sentinel = StationInfo {
        station_id: FREE_BIKES_STATION_ID.to_string(),
        name: FREE_BIKES_STATION_ID.to_string(),
        lat: None,
        lon: None,
    };
    ctx.stations.insert_station(system.id, &sentinel, now)?;
    log::debug!("{}: created free_bikes station", system.name);
    Ok(true)
}

/// Add stations that are new to the system
///
/// A station counts as known when a row with the same `station_id` and name
/// exists. A renamed station gets a new row, which becomes the one resolved
/// for its id. Returns the number of stations added.
pub fn merge_station_list(
    ctx: &TrackerContext,
    system: &System,
    infos: &[StationInfo],
    now: DateTime<Utc>,
) -> Result<usize, RegistryError> {
    let known: HashSet<(String, String)> = ctx
        .stations
        .list_stations(&system.name)?
        .into_iter()
        .map(|s| (s.station_id, s.name))
        .collect();

    let mut added = 0;
    for info in infos {
        if info.station_id == FREE_BIKES_STATION_ID
            || known.contains(&(info.station_id.clone(), info.name.clone()))
        {
            continue;
        }
        ctx.stations.insert_station(system.id, info, now)?;
        added += 1;
    }

    Ok(added)
}

/// Refresh a system's station list from its `station_information` feed
pub async fn update_stations(
    ctx: &TrackerContext,
    feed: &dyn FeedClient,
    system: &System,
    now: DateTime<Utc>,
) -> Result<usize, RegistryError> {
    let infos = feed.fetch_station_information(system).await?;
    let added = merge_station_list(ctx, system, &infos, now)?;
    ensure_free_bikes_station(ctx, system, now)?;

    log::info!("🚲 {} station update: {} listed, {} new", system.name, infos.len(), added);
    Ok(added)
}

/// Recompute tracking_start / tracking_end from stored measurements
///
/// `tracking_end` stays empty while the system is tracked.
pub fn refresh_tracking_window(ctx: &TrackerContext, system: &System) -> Result<(), RegistryError> {
    if let Some((first, last)) = ctx.measurements.time_span(&system.name)? {
        let end = if system.is_tracking { None } else { Some(last) };
        ctx.systems.set_tracking_window(system.id, Some(first), end)?;
    }
    Ok(())
}
