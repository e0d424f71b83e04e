//! Activity - prints trip activity as JSON
//!
//! Usage:
//!   activity --system <name> --start YYYYMMDDHH --end YYYYMMDDHH [--frequency t|h|d|m|y] [--station <id>|all]
//!   activity systems
//!   activity stations --system <name>
//!
//! Times are on the system's local clock. Without `--station` the whole
//! system is reported (station trips plus free-bike trips). Invalid
//! parameters print `{"error": "..."}` and exit with status 1.

use bikeflow::aggregator_core::{list_stations, list_systems, run_activity, ActivityRequest, QueryError};
use bikeflow::config::TrackerConfig;
use bikeflow::pipeline::engine::TrackerContext;
use dotenv::dotenv;
use env_logger::Env;
use serde::Serialize;
use std::env;

const USAGE: &str = "Usage: activity --system <name> --start YYYYMMDDHH --end YYYYMMDDHH \
                     [--frequency t|h|d|m|y] [--station <id>|all] | activity systems | activity stations --system <name>";

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(ctx: &TrackerContext, args: &[String]) -> Result<serde_json::Value, QueryError> {
    let system = arg_value(args, "--system");

    match args.get(1).map(String::as_str) {
        Some("systems") => Ok(serde_json::json!(list_systems(ctx)?)),
        Some("stations") => {
            let system = system.ok_or(QueryError::MissingParameter("--system"))?;
            Ok(serde_json::json!(list_stations(ctx, system)?))
        }
        _ => {
            let system = system.ok_or(QueryError::MissingParameter("--system"))?;
            let start = arg_value(args, "--start").ok_or(QueryError::MissingParameter("--start"))?;
            let end = arg_value(args, "--end").ok_or(QueryError::MissingParameter("--end"))?;
            let req = ActivityRequest::parse(
                ctx,
                system,
                start,
                end,
                arg_value(args, "--frequency"),
                arg_value(args, "--station"),
            )?;
            Ok(serde_json::json!(run_activity(ctx, &req)?))
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.iter().any(|a| a == "--help" || a == "-h") {
        eprintln!("{}", USAGE);
        return Ok(());
    }

    let config = TrackerConfig::from_env()?;
    let ctx = TrackerContext::open(&config)?;

    match run(&ctx, &args) {
        Ok(value) => print_json(&value),
        Err(e) => {
            log::debug!("query rejected: {}", e);
            print_json(&e.to_json())?;
            std::process::exit(1);
        }
    }
}
