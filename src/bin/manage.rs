//! Manage - system administration
//!
//! Usage:
//!   manage init
//!   manage add [-f systems.json] <name>...
//!   manage activate <name>
//!   manage deactivate <name>
//!   manage update-stations <name>
//!   manage list

use bikeflow::config::TrackerConfig;
use bikeflow::feed_core::GbfsClient;
use bikeflow::pipeline::engine::TrackerContext;
use bikeflow::systems::{add_system, load_systems, set_tracking, update_stations};
use chrono::Utc;
use dotenv::dotenv;
use env_logger::Env;
use log::info;
use std::env;

const DEFAULT_SYSTEMS_FILE: &str = "systems.json";

const USAGE: &str = "Usage: manage <init | add [-f systems.json] <name>... | activate <name> | \
                     deactivate <name> | update-stations <name> | list>";

/// Positional arguments after the subcommand, skipping `-f <file>`
fn positional(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut iter = args.iter().skip(2);
    while let Some(arg) = iter.next() {
        if arg == "-f" {
            iter.next();
            continue;
        }
        out.push(arg.as_str());
    }
    out
}

fn single_name<'a>(args: &'a [String]) -> Result<&'a str, Box<dyn std::error::Error>> {
    positional(args)
        .first()
        .copied()
        .ok_or_else(|| USAGE.into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let config = TrackerConfig::from_env()?;
    let ctx = TrackerContext::open(&config)?;

    match command {
        "init" => {
            info!("✅ Database ready");
            info!("   ├─ Measurements: {}", config.db_path);
            info!("   └─ Raw snapshots: {}", config.raw_db_path);
        }
        "add" => {
            let file = args
                .windows(2)
                .find(|w| w[0] == "-f")
                .map(|w| w[1].clone())
                .unwrap_or_else(|| DEFAULT_SYSTEMS_FILE.to_string());
            let names = positional(&args);
            if names.is_empty() {
                return Err(USAGE.into());
            }

            let definitions = load_systems(&file)?;
            for name in names {
                let def = definitions
                    .iter()
                    .find(|d| d.name == name)
                    .ok_or_else(|| format!("System '{}' not found in {}", name, file))?;
                add_system(&ctx, def, Utc::now())?;
            }
        }
        "activate" => set_tracking(&ctx, single_name(&args)?, true)?,
        "deactivate" => set_tracking(&ctx, single_name(&args)?, false)?,
        "update-stations" => {
            let name = single_name(&args)?;
            let system = ctx
                .systems
                .get_system(name)?
                .ok_or_else(|| format!("No system named '{}'", name))?;
            let feed = GbfsClient::new(config.feed_timeout())?;
            update_stations(&ctx, &feed, &system, Utc::now()).await?;
        }
        "list" => {
            for system in ctx.systems.list_systems()? {
                println!(
                    "{:<32} {:<24} {:<9} {}",
                    system.name,
                    system.tz,
                    if system.is_tracking { "tracking" } else { "idle" },
                    system
                        .tracking_start
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
        _ => return Err(USAGE.into()),
    }

    Ok(())
}
