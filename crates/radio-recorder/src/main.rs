mod http;
mod logging;
mod scheduler;
mod service;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use radio_core::config::Config;
use radio_core::disk::SystemDisks;
use radio_core::inventory::SystemInventory;
use radio_core::launcher::FfmpegLauncher;
use radio_core::reconciler::duration_from_minutes;
use radio_core::resolver::{HttpProbe, Resolver};
use radio_core::station::{Schedule, StationDraft};
use radio_core::store::SqliteStore;
use radio_core::{platform, Recorder, RecorderSettings};
use serde::Serialize;
use tracing::{info, warn};

use crate::service::Service;

type LiveRecorder = Recorder<Resolver<HttpProbe>>;

#[derive(Parser)]
#[command(version, about = "Records internet radio streams into hourly files")]
struct Cli {
    /// Config file to use instead of the platform default
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hourly scheduler and the HTTP API
    Serve,
    /// Run one reconciliation pass now
    Tick,
    /// Record one station for a fixed time
    Start {
        station: String,
        /// Duration in minutes (defaults to capture.manual_seconds)
        #[arg(long)]
        minutes: Option<u64>,
        /// Re-encode to mp3 instead of copying the stream
        #[arg(long)]
        encode: bool,
    },
    /// Stop every capture of one station
    Stop { station: String },
    /// Stop every capture of every station
    StopAll,
    /// Resolve and validate a stream URL without saving it
    Resolve { url: String },
    /// Check disk space and the ffmpeg binary
    Prep,
    /// Manage stations
    Station {
        #[command(subcommand)]
        action: StationCommand,
    },
}

#[derive(Subcommand)]
enum StationCommand {
    List,
    Add {
        name: String,
        url: String,
        #[arg(long, conflicts_with = "from")]
        always_on: bool,
        /// Window start as YYYY-MM-DDTHH
        #[arg(long, requires = "until")]
        from: Option<String>,
        /// Window end (exclusive) as YYYY-MM-DDTHH
        #[arg(long, requires = "from")]
        until: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    Remove { name: String },
}

/// `2024-05-01T10` -> date and hour.
fn parse_hour_slot(value: &str) -> anyhow::Result<(NaiveDate, u32)> {
    let (date, hour) = value
        .split_once(['T', ' '])
        .with_context(|| format!("expected YYYY-MM-DDTHH, got {value:?}"))?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .with_context(|| format!("bad date in {value:?}"))?;
    let hour = hour
        .parse::<u32>()
        .with_context(|| format!("bad hour in {value:?}"))?;
    Ok((date, hour))
}

fn build_recorder(config: &Config) -> anyhow::Result<LiveRecorder> {
    let ffmpeg = platform::find_ffmpeg_binary(config.capture.ffmpeg_path.as_ref());
    match &ffmpeg {
        Some(path) => info!("Using ffmpeg at {:?}", path),
        None => warn!("ffmpeg not found; captures and decode probes will fail"),
    }

    let store = SqliteStore::open(&config.paths.database)
        .with_context(|| format!("opening {}", config.paths.database.display()))?;
    info!("Station database: {:?}", config.paths.database);

    let probe = HttpProbe::new(&config.resolver, ffmpeg.clone())?;
    Ok(Recorder::new(
        Arc::new(store),
        Resolver::new(probe),
        Arc::new(SystemInventory),
        Arc::new(FfmpegLauncher::new(ffmpeg, &config.capture)),
        Arc::new(SystemDisks),
        RecorderSettings::from_config(config)?,
    ))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(config: Config, service: Arc<Service<Resolver<HttpProbe>>>) -> anyhow::Result<()> {
    let prep = service.recorder.prep().await;
    if prep.ready() {
        info!(
            "Ready: {:.1} GiB free, {}",
            prep.free_gib.unwrap_or_default(),
            prep.ffmpeg_version.as_deref().unwrap_or("ffmpeg")
        );
    }

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            service.clone(),
        );
    }

    if config.scheduler.enabled {
        let offset = Duration::from_secs(config.scheduler.offset_secs);
        tokio::spawn(scheduler::run(service.clone(), offset));
    } else {
        info!("Scheduler disabled; ticks only run on request");
    }

    tokio::signal::ctrl_c().await?;
    // captures run in their own process group and keep recording
    info!("Shutting down, running captures are left in place");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let one_shot = !matches!(cli.command, Command::Serve);
    let tally = logging::init(&platform::data_dir(), one_shot)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!(
        "Config loaded from: {:?}",
        cli.config.clone().unwrap_or_else(Config::config_path)
    );

    let recorder = build_recorder(&config)?;

    match cli.command {
        Command::Serve => {
            let service = Arc::new(Service::new(recorder, tally));
            serve(config, service).await?;
        }
        Command::Tick => print_json(&recorder.tick().await?)?,
        Command::Start {
            station,
            minutes,
            encode,
        } => {
            let duration = minutes.map(duration_from_minutes).transpose()?;
            print_json(&recorder.start_manual(&station, duration, encode).await?)?;
        }
        Command::Stop { station } => {
            let stopped = recorder.stop_station(&station).await?;
            println!("stopped {} capture(s) of {}", stopped.len(), station);
        }
        Command::StopAll => {
            let stopped = recorder.stop_all().await?;
            println!("stopped {} capture(s)", stopped.len());
        }
        Command::Resolve { url } => println!("{}", recorder.test_stream(&url).await?),
        Command::Prep => {
            let report = recorder.prep().await;
            print_json(&report)?;
            if !report.ready() {
                anyhow::bail!("host is not ready for recording");
            }
        }
        Command::Station { action } => match action {
            StationCommand::List => print_json(&recorder.status()?)?,
            StationCommand::Add {
                name,
                url,
                always_on,
                from,
                until,
                reason,
            } => {
                let schedule = match (from, until) {
                    (Some(from), Some(until)) => {
                        let (start_date, start_hour) = parse_hour_slot(&from)?;
                        let (end_date, end_hour) = parse_hour_slot(&until)?;
                        Some(Schedule::from_parts(
                            start_date, start_hour, end_date, end_hour, reason,
                        )?)
                    }
                    _ => None,
                };
                let station = recorder
                    .add_station(StationDraft {
                        name,
                        source_url: url,
                        always_on,
                        schedule,
                    })
                    .await?;
                print_json(&station)?;
            }
            StationCommand::Remove { name } => {
                recorder.delete_station(&name).await?;
                println!("removed {name}");
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_slot_parsing() {
        assert_eq!(
            parse_hour_slot("2024-05-01T10").unwrap(),
            (NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), 10)
        );
        assert_eq!(parse_hour_slot("2024-05-01 7").unwrap().1, 7);
        assert!(parse_hour_slot("2024-05-01").is_err());
        assert!(parse_hour_slot("2024-13-01T10").is_err());
    }

    #[test]
    fn cli_parses_manual_start() {
        let cli = Cli::try_parse_from(["radio-recorder", "start", "Radio X", "--minutes", "30", "--encode"]).unwrap();
        match cli.command {
            Command::Start { station, minutes, encode } => {
                assert_eq!(station, "Radio X");
                assert_eq!(minutes, Some(30));
                assert!(encode);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn always_on_conflicts_with_window() {
        let parsed = Cli::try_parse_from([
            "radio-recorder", "station", "add", "a", "http://a/", "--always-on", "--from", "2024-05-01T10", "--until", "2024-05-01T12",
        ]);
        assert!(parsed.is_err());
    }
}
