use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use occupancy_forecast::{
    config::AppConfig,
    db::{self, Database},
    ml::{ArtifactStore, ForecastService, ModelFamily},
    schedule::{LibrarySchedule, parse_local_date, parse_local_datetime},
    traits::SystemClock,
};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "occupancy-forecast")]
#[command(about = "Hourly occupancy forecasts for library floors")]
struct Args {
    /// Model family: cnn, lstm, cnn_lstm or cnn_lstm_attn
    #[arg(long, global = true)]
    family: Option<String>,

    /// Artifact version to load
    #[arg(long, global = true)]
    version: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Forecast a single local hour
    At {
        #[arg(long)]
        location: String,
        /// Local time, YYYY-MM-DDTHH:MM
        #[arg(long)]
        when: String,
    },
    /// Forecast the 24 hours of a local day
    Day {
        #[arg(long)]
        location: String,
        /// Local date, YYYY-MM-DD
        #[arg(long)]
        date: String,
        /// Write the points as CSV instead of printing JSON
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Print the observed hourly counts for a local day
    History {
        #[arg(long)]
        location: String,
        /// Local date, YYYY-MM-DD
        #[arg(long)]
        date: String,
    },
    /// Print the (day-of-week, hour) occupancy profile
    Profile {
        #[arg(long)]
        location: String,
    },
    /// List model families with artifacts on disk
    Models {
        #[arg(long)]
        location: Option<String>,
    },
    /// Load hourly Wi-Fi counts (ts,wifi_clients) from a CSV file
    Import {
        #[arg(long)]
        location: String,
        #[arg(long)]
        csv: PathBuf,
    },
}

#[derive(Serialize)]
struct ModelListing {
    location: String,
    family: ModelFamily,
    version: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .parse_lossy("occupancy_forecast=debug");

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let result = rt.block_on(run(args, &config));
    if let Err(e) = &result {
        tracing::error!("Command failed: {e:#}");
    }
    result
}

async fn run(args: Args, config: &AppConfig) -> Result<()> {
    let family: ModelFamily = args
        .family
        .as_deref()
        .unwrap_or(&config.artifacts.default_family)
        .parse()?;
    let version = args
        .version
        .unwrap_or_else(|| config.artifacts.default_version.clone());

    match args.command {
        Command::Models { location } => list_models(config, location.as_deref()),
        Command::Import { location, csv } => {
            let database = connect(config).await?;
            import_csv(&database, &location, &csv).await
        }
        Command::At { location, when } => {
            let offset = config
                .timezone
                .offset()
                .context("Invalid timezone offset")?;
            let schedule = LibrarySchedule::new(&config.schedule, offset);
            let target = schedule.local_to_utc(parse_local_datetime(&when)?)?;

            let service = ForecastService::from_config(config, connect(config).await?, SystemClock)?;
            let forecast = service
                .forecast_at(&location, family, &version, target)
                .await?;
            print_json(&forecast)
        }
        Command::Day {
            location,
            date,
            csv,
        } => {
            let date = parse_local_date(&date)?;
            let service = ForecastService::from_config(config, connect(config).await?, SystemClock)?;
            let forecast = service
                .forecast_day(&location, family, &version, date)
                .await?;

            match csv {
                Some(path) => {
                    forecast
                        .write_csv_file(&path)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    tracing::info!(path = %path.display(), points = forecast.points.len(), "Wrote day forecast");
                    Ok(())
                }
                None => print_json(&forecast),
            }
        }
        Command::History { location, date } => {
            let date = parse_local_date(&date)?;
            let service = ForecastService::from_config(config, connect(config).await?, SystemClock)?;
            print_json(&service.history_day(&location, date).await?)
        }
        Command::Profile { location } => {
            let service = ForecastService::from_config(config, connect(config).await?, SystemClock)?;
            let profile = service.profile(&location).await?;
            print_json(&profile.slots())
        }
    }
}

async fn connect(config: &AppConfig) -> Result<Database> {
    tracing::info!("Connecting to database...");
    let database = Database::new(config.database_url()?).await?;
    tracing::info!("Database connected successfully");
    Ok(database)
}

fn list_models(config: &AppConfig, location: Option<&str>) -> Result<()> {
    let store = ArtifactStore::new(config.artifacts.root.clone());
    let locations: Vec<String> = match location {
        Some(location) => vec![location.to_string()],
        None => store.list_locations().into_iter().collect(),
    };

    let listings: Vec<ModelListing> = locations
        .iter()
        .flat_map(|location| {
            store
                .list_families(location)
                .into_iter()
                .map(move |(family, version)| ModelListing {
                    location: location.clone(),
                    family,
                    version,
                })
        })
        .collect();

    print_json(&listings)
}

async fn import_csv(database: &Database, location: &str, path: &Path) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let observations = db::read_observations_csv(file, location)?;

    let rows: Vec<_> = observations
        .iter()
        .map(|obs| (obs.ts, obs.wifi_clients))
        .collect();
    database.batch_insert(location, &rows).await?;

    tracing::info!(location, rows = rows.len(), "Imported observations");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}
