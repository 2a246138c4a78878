//! engineon CLI - batch runner for engine-on analytics
//!
//! Usage:
//!   engineon run --start 01/12/2025 --end 31/12/2025 [--parallel --workers 4]
//!   engineon trip-summary --year 2025 --month 12 [--version-type v1]
//!   engineon import-readings <file.json>
//!   engineon import-facilities <file.json>
//!   engineon import-trips <file.json>
//!   engineon import-vehicles <file.json>
//!
//! The database path comes from `--db` or `ENGINEON_DB`.

use clap::{Parser, Subcommand};
use engineon::{
    run_date_range, DateOutcome, EngineOnError, Facility, FuelConfig, OptionExt, OutcomeCallback,
    ReadingRecord, Result, RunConfig, SqliteStore, TripRecord, TripSummaryRequest,
    VehicleMasterRecord, VersionType,
};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "engineon")]
#[command(about = "Engine-on while parked detection and fuel analytics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database file
    #[arg(long, env = "ENGINEON_DB", default_value = "engineon.db", global = true)]
    db: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect engine-on events for a date range
    Run {
        /// First date (dd/mm/YYYY or YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// Last date, inclusive
        #[arg(long)]
        end: String,

        /// Clustering and facility radius in meters
        #[arg(long, default_value = "200")]
        max_distance: f64,

        /// Run dates on a worker pool
        #[arg(long)]
        parallel: bool,

        /// Worker pool size
        #[arg(long, default_value = "4")]
        workers: usize,

        /// Do not store raw event rows
        #[arg(long)]
        no_raw: bool,

        /// Do not store daily summary rows
        #[arg(long)]
        no_summary: bool,

        /// Process only this vehicle and log its intervals and events
        #[arg(long)]
        debug_vehicle: Option<String>,
    },

    /// Join one month of summaries with trips and estimate fuel
    TripSummary {
        #[arg(long)]
        year: i32,

        #[arg(long)]
        month: u32,

        /// Only summaries of this firmware class (v1 or v2)
        #[arg(long)]
        version_type: Option<String>,
    },

    /// Append driving-log records from a JSON array
    ImportReadings { file: PathBuf },

    /// Replace the facility set from a JSON array
    ImportFacilities { file: PathBuf },

    /// Append trip cost ticket rows from a JSON array
    ImportTrips { file: PathBuf },

    /// Replace the vehicle master from a JSON array
    ImportVehicles { file: PathBuf },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| writeln!(buf, "[{:5}] {}", record.level(), record.args()))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let store = SqliteStore::new(&cli.db.to_string_lossy())?;

    match cli.command {
        Commands::Run {
            start,
            end,
            max_distance,
            parallel,
            workers,
            no_raw,
            no_summary,
            debug_vehicle,
        } => {
            let mut config = RunConfig::from_request_dates(&start, &end)?;
            config.segment.max_distance_m = max_distance;
            config.parallel_dates = parallel;
            config.max_workers = workers;
            config.save_raw = !no_raw;
            config.save_summary = !no_summary;
            config.debug_vehicle = debug_vehicle;

            let progress: OutcomeCallback =
                Arc::new(|outcome: &DateOutcome, done: u32, total: u32| {
                    eprintln!("  [{}/{}] {}", done, total, outcome);
                });
            let report = run_date_range(&store, &store, &config, Some(progress))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::TripSummary {
            year,
            month,
            version_type,
        } => {
            let version_type = match version_type.as_deref() {
                Some(label) => Some(
                    VersionType::from_label(label)
                        .ok_or_config(&format!("unknown version type '{}'", label))?,
                ),
                None => None,
            };
            let request = TripSummaryRequest {
                year,
                month,
                version_type,
            };
            let rows = store.run_trip_summary(&request, &FuelConfig::default())?;
            println!("{} rows written for {}/{}", rows.len(), month, year);
        }
        Commands::ImportReadings { file } => {
            let records: Vec<ReadingRecord> = read_json(&file)?;
            let n = store.insert_readings(&records)?;
            println!("Imported {} readings", n);
        }
        Commands::ImportFacilities { file } => {
            let facilities: Vec<Facility> = read_json(&file)?;
            let n = store.replace_facilities(&facilities)?;
            println!("Imported {} facilities", n);
        }
        Commands::ImportTrips { file } => {
            let trips: Vec<TripRecord> = read_json(&file)?;
            let n = store.insert_trip_records(&trips)?;
            println!("Imported {} trip records", n);
        }
        Commands::ImportVehicles { file } => {
            let vehicles: Vec<VehicleMasterRecord> = read_json(&file)?;
            let n = store.replace_vehicle_master(&vehicles)?;
            println!("Imported {} vehicles", n);
        }
    }

    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| EngineOnError::Io {
        message: format!("{}: {}", path.display(), e),
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_import_file_is_io_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing.json");
        let err = read_json::<Vec<Facility>>(&path).unwrap_err();
        match err {
            EngineOnError::Io { message } => assert!(message.contains("missing.json")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_import_file_parses() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plants.json");
        std::fs::write(&path, r#"[{"code": "P01", "latitude": 13.75, "longitude": 100.5}]"#)
            .unwrap();
        let plants: Vec<Facility> = read_json(&path).unwrap();
        assert_eq!(plants, vec![Facility::new("P01", 13.75, 100.5)]);
    }
}
