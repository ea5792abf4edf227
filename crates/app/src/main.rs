mod sensor;
mod wav_engine;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use accel_logger_core::{read_log, AppConfig, ClipCatalog, Notice, SystemClock, TestController};
use clap::{Parser, Subcommand};
use crossbeam_channel::{after, never, select, tick};
use tracing_subscriber::EnvFilter;

use crate::{sensor::SimulatedAccelerometer, wav_engine::WavTimerEngine};

fn main() -> accel_logger_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Clips { config } => run_clips(config.as_ref()),
        Commands::Run(args) => run_test(args),
        Commands::Inspect { log } => run_inspect(&log),
    }
}

fn load_config(path: Option<&PathBuf>) -> accel_logger_core::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None => Ok(AppConfig::default()),
    }
}

fn load_catalog(config: &AppConfig) -> accel_logger_core::Result<ClipCatalog> {
    ClipCatalog::from_groups(&config.catalog.root, config.catalog.groups.as_slice())
}

fn run_clips(config: Option<&PathBuf>) -> accel_logger_core::Result<()> {
    let config = load_config(config)?;
    let catalog = load_catalog(&config)?;
    for (index, clip) in catalog.iter().enumerate() {
        println!("{index:>4}  {}", clip.display_name);
    }
    println!("{} clips", catalog.len());
    Ok(())
}

enum Event {
    Tick(Instant),
    Notice(Notice),
    Done,
}

fn run_test(args: RunArgs) -> accel_logger_core::Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(output) = args.output {
        config.log.output_dir = output;
    }
    if let Some(device) = args.device {
        config.log.device_identity = device;
    }

    let catalog = load_catalog(&config)?;
    let controller = TestController::new(
        catalog,
        Arc::new(WavTimerEngine),
        SystemClock::shared(),
        &config,
    )?;
    let window = controller.window(args.start, args.end)?;
    let notices = controller.notices();

    let log_path = controller.start_test(window)?;
    tracing::info!(?log_path, clips = window.len(), "recording");

    let sensor = SimulatedAccelerometer::new(args.rate);
    let ticker = tick(sensor.interval());
    let deadline = match args.seconds {
        Some(seconds) => after(Duration::from_secs_f64(seconds.max(0.0))),
        None => never(),
    };
    let mut last_track = None;

    loop {
        let event = select! {
            recv(ticker) -> instant => instant.map(Event::Tick).unwrap_or(Event::Done),
            recv(notices) -> notice => notice.map(Event::Notice).unwrap_or(Event::Done),
            recv(deadline) -> _ => Event::Done,
        };

        match event {
            Event::Tick(arrival) => {
                controller.on_sensor_event(sensor.sample(arrival));

                let track = controller.current_track_display()?;
                if last_track.as_ref() != Some(&track) {
                    tracing::info!(
                        track = %track.name,
                        index = track.index,
                        total = track.total,
                        "now playing"
                    );
                    last_track = Some(track);
                }
                if args.seconds.is_none() && !controller.is_playing() {
                    break;
                }
            }
            Event::Notice(Notice::RateUpdated(rate)) => {
                tracing::debug!(hz = rate.hz, "sampling rate");
            }
            Event::Notice(Notice::TestFinished) => {
                tracing::info!(hz = controller.current_rate().hz, "clip window finished");
                break;
            }
            Event::Notice(Notice::TestAborted { reason }) => {
                tracing::error!(%reason, "test aborted");
                break;
            }
            Event::Notice(notice) => tracing::warn!(?notice, "log writer"),
            Event::Done => break,
        }
    }

    if let Some(path) = controller.end_test()? {
        println!("{}", path.display());
    }
    Ok(())
}

fn run_inspect(log: &Path) -> accel_logger_core::Result<()> {
    let contents = read_log(log)?;
    let mut per_clip: BTreeMap<&str, usize> = BTreeMap::new();
    for record in &contents.records {
        let name = record.clip_name.as_deref().unwrap_or("<no clip>");
        *per_clip.entry(name).or_default() += 1;
    }

    println!("{} records", contents.records.len());
    for (name, count) in per_clip {
        println!("{count:>8}  {name}");
    }
    if let (Some(first), Some(last)) = (contents.records.first(), contents.records.last()) {
        let span_ms = last.wall_clock_millis - first.wall_clock_millis;
        if span_ms > 0 {
            let hz = (contents.records.len() - 1) as f64 * 1000.0 / span_ms as f64;
            println!("average rate {hz:.1} Hz over {span_ms} ms");
        }
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Accelerometer logger synchronised with clip playback", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the clip catalog with the indices used by `run`.
    Clips {
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Play a window of clips while recording accelerometer samples.
    Run(RunArgs),
    /// Summarise a recorded log file.
    Inspect {
        /// Path to the log file.
        log: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// First clip index to play.
    #[arg(long)]
    start: Option<usize>,
    /// Clip index to stop before. Defaults to the catalog length.
    #[arg(long)]
    end: Option<usize>,
    /// Device identity used in the log file name.
    #[arg(long)]
    device: Option<String>,
    /// Directory that receives the log file.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Simulated sensor rate in Hz.
    #[arg(long, default_value_t = 200.0)]
    rate: f64,
    /// Stop after this many seconds even if clips remain.
    #[arg(long)]
    seconds: Option<f64>,
}
