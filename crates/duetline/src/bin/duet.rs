//! duet - command line front end for duetline
//!
//! Subcommands:
//! - `duet timeline <durations...>` - Cascade segment durations into start times
//! - `duet calibrate <reference> <test>` - Measure round-trip latency
//! - `duet chains list|show|delete` - Inspect stored chains
//! - `duet play` - Play files or a stored chain
//! - `duet record` - Punch a new take into a chain
//! - `duet config` - Show the effective configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use duetconf::{DeviceKind, DuetConfig};
use duetline::{
    commit_take, compute_timeline, delete_chain, load_chain, AudioDevice, Calibrator,
    DuetEngine, EngineConfig, FileObjectStore, FileResolver, FileSegmentRepository, ObjectStore,
    SegmentId, SegmentRepository, StoreResolver, TrackSpec, VirtualDevice,
};

#[derive(Parser)]
#[command(name = "duet")]
#[command(about = "Duet timeline and synchronized audio engine")]
#[command(version)]
struct Cli {
    /// Config file (overrides ./duetline.toml)
    #[arg(short, long, global = true, env = "DUETLINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute start times for a chain of segment durations (seconds)
    Timeline {
        #[arg(required = true, allow_negative_numbers = true)]
        durations: Vec<f64>,
    },

    /// Measure latency between a reference click and its re-recording
    Calibrate {
        reference: PathBuf,
        test: PathBuf,

        /// Fraction of the peak that marks the transient
        #[arg(long)]
        ratio: Option<f64>,
    },

    /// Inspect stored chains
    Chains {
        #[command(subcommand)]
        action: ChainAction,
    },

    /// Play audio files or a stored chain
    Play {
        /// Leaf segment of a stored chain
        #[arg(long, conflicts_with = "files")]
        chain: Option<SegmentId>,

        /// Files to play, all starting at 0
        files: Vec<PathBuf>,

        /// Position to start from (ms)
        #[arg(long, default_value = "0")]
        from: f64,

        /// Stop after this many seconds (default: end of the chain)
        #[arg(long)]
        seconds: Option<f64>,
    },

    /// Record a take on top of a chain and store it
    Record {
        /// Chain to extend; starts a new chain when omitted
        #[arg(long)]
        chain: Option<SegmentId>,

        /// Take length in seconds
        #[arg(long, default_value = "10")]
        seconds: f64,

        /// Playback pre-roll before the punch-in point (ms)
        #[arg(long, default_value = "0")]
        pre_roll: f64,
    },

    /// Show the effective configuration
    Config {
        /// Also list the files and env vars it came from
        #[arg(long)]
        sources: bool,
    },
}

#[derive(Subcommand)]
enum ChainAction {
    /// List chain tips
    List,

    /// Show the layout of one chain
    Show { leaf: SegmentId },

    /// Delete a chain and its audio
    Delete { leaf: SegmentId },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, sources) = DuetConfig::load_with_sources_from(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.telemetry.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Timeline { durations } => {
            let summary = compute_timeline(&durations);
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Calibrate {
            reference,
            test,
            ratio,
        } => {
            let mut calibrator = Calibrator::from_config(&config.calibration);
            if let Some(ratio) = ratio {
                calibrator = calibrator.with_threshold_ratio(ratio);
            }
            let report = calibrator.measure_files(&reference, &test)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Chains { action } => {
            let repo = open_repository(&config)?;
            match action {
                ChainAction::List => {
                    for leaf in repo.list_leaf_chains()? {
                        let layout = load_chain(&repo, leaf)?;
                        println!(
                            "{leaf}  {} segments  {:.3}s",
                            layout.segments.len(),
                            layout.total_duration().0
                        );
                    }
                }
                ChainAction::Show { leaf } => {
                    let layout = load_chain(&repo, leaf)?;
                    for (segment, entry) in layout.segments.iter().zip(layout.timeline.entries()) {
                        println!(
                            "{}  start {:>9.3}s  duration {:>9.3}s  {}",
                            segment.id, entry.start.0, entry.duration.0, segment.source
                        );
                    }
                    println!("next take starts at {:.3}s", layout.next_start_time().0);
                }
                ChainAction::Delete { leaf } => {
                    let store = open_store(&config)?;
                    let removed = delete_chain(&repo, store.as_ref(), leaf)?;
                    println!("removed {removed} segments");
                }
            }
        }
        Commands::Play {
            chain,
            files,
            from,
            seconds,
        } => {
            let mut engine = match chain {
                Some(leaf) => {
                    let repo = open_repository(&config)?;
                    let layout = load_chain(&repo, leaf)?;
                    let mut engine = store_engine(&config)?;
                    engine.load_tracks(&layout.track_specs());
                    engine
                }
                None => {
                    let specs: Vec<TrackSpec> = files
                        .iter()
                        .enumerate()
                        .map(|(i, path)| TrackSpec::new(format!("file-{i}"), path.clone(), 0.0))
                        .collect();
                    let mut engine = DuetEngine::new(
                        EngineConfig::from(&config),
                        open_device(&config)?,
                        Arc::new(FileResolver::new()),
                    );
                    engine.load_tracks(&specs);
                    engine
                }
            };

            if engine.loaded_track_count() == 0 {
                bail!("nothing to play");
            }
            let length = seconds.unwrap_or((engine.chain_end_ms() - from).max(0.0) / 1000.0);
            engine.play(from)?;
            std::thread::sleep(Duration::from_secs_f64(length.max(0.0)));
            engine.stop();
            engine.cleanup();
        }
        Commands::Record {
            chain,
            seconds,
            pre_roll,
        } => {
            let repo = open_repository(&config)?;
            let store = open_store(&config)?;
            let mut engine = store_engine(&config)?;

            let punch_in_ms = match chain {
                Some(leaf) => {
                    let layout = load_chain(&repo, leaf)?;
                    engine.load_tracks(&layout.track_specs());
                    layout.next_start_time().as_millis()
                }
                None => 0.0,
            };
            let from = (punch_in_ms - pre_roll).max(0.0);

            info!(punch_in_ms, from, seconds, "recording");
            engine.play_and_record(from, punch_in_ms, |actual_ms| {
                eprintln!("recording started at {actual_ms:.1} ms");
            })?;

            let wait = (punch_in_ms - from) / 1000.0 + seconds;
            std::thread::sleep(Duration::from_secs_f64(wait.max(0.0)));

            let take = engine.stop_recording()?;
            engine.stop();
            engine.cleanup();

            let id = commit_take(&repo, store.as_ref(), chain, &take)?;
            println!(
                "{id}  start {:.1} ms (requested {:.1}, drift {:+.1})  duration {:.1} ms{}",
                take.start_time_ms,
                take.requested_start_ms,
                take.punch_in_drift_ms(),
                take.duration_ms,
                if take.truncated { "  [truncated]" } else { "" }
            );
        }
        Commands::Config { sources: show } => {
            print!("{}", config.to_toml());
            if show {
                for file in &sources.files {
                    println!("# loaded {}", file.display());
                }
                for var in &sources.env_overrides {
                    println!("# env {var}");
                }
            }
        }
    }

    Ok(())
}

fn open_repository(config: &DuetConfig) -> Result<FileSegmentRepository> {
    FileSegmentRepository::open(&config.paths.segments_file).with_context(|| {
        format!(
            "failed to open segment file {}",
            config.paths.segments_file.display()
        )
    })
}

fn open_store(config: &DuetConfig) -> Result<Arc<dyn ObjectStore>> {
    let store = FileObjectStore::new(&config.paths.store_dir)
        .with_context(|| format!("failed to open store {}", config.paths.store_dir.display()))?;
    Ok(Arc::new(store))
}

fn open_device(config: &DuetConfig) -> Result<Box<dyn AudioDevice>> {
    match config.audio.device {
        DeviceKind::Virtual => Ok(Box::new(VirtualDevice::new())),
        #[cfg(feature = "pipewire")]
        DeviceKind::Pipewire => Ok(Box::new(duetline::PipeWireDevice::new())),
        #[cfg(not(feature = "pipewire"))]
        DeviceKind::Pipewire => bail!("built without PipeWire support (enable the pipewire feature)"),
    }
}

/// Engine whose tracks are storage keys.
fn store_engine(config: &DuetConfig) -> Result<DuetEngine> {
    let resolver = Arc::new(StoreResolver::new(open_store(config)?));
    Ok(DuetEngine::new(
        EngineConfig::from(config),
        open_device(config)?,
        resolver,
    ))
}
