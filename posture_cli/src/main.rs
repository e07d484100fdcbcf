use clap::{Parser, Subcommand};
use posture_core::calibration::PhaseCapture;
use posture_core::radio::ReplayRadio;
use posture_core::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Parser)]
#[command(name = "posture")]
#[command(about = "Dual-sensor posture monitor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use this config file instead of the default one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override user id
    #[arg(long, global = true)]
    user: Option<String>,

    /// More log output on stderr (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate upright and slouched baselines from two sensor recordings
    Calibrate {
        /// Telemetry recorded while sitting upright
        #[arg(long)]
        upright: PathBuf,

        /// Telemetry recorded while slouching
        #[arg(long)]
        slouch: PathBuf,
    },

    /// Run device cycles over a recording, storing and analysing sessions
    Monitor {
        /// Telemetry recording to replay on every cycle
        #[arg(long)]
        replay: PathBuf,

        /// Number of cycles to run
        #[arg(long, default_value_t = 1)]
        cycles: usize,
    },

    /// Capture labelled training data from a recording
    Train {
        #[arg(long)]
        replay: PathBuf,

        /// Pose label the data is stored under
        #[arg(long)]
        label: String,
    },

    /// Analyse every pending session
    Analyze,

    /// Remove expired and incomplete sessions
    Cleanup,

    /// Show recent daily posture statistics
    Stats {
        #[arg(long, default_value_t = 7)]
        days: usize,
    },

    /// Append history to a CSV file
    Export {
        #[arg(long)]
        out: PathBuf,

        /// Export individual sessions instead of daily statistics
        #[arg(long)]
        sessions: bool,
    },

    /// Show the calibration profile
    Profile {
        /// Delete the stored profile
        #[arg(long)]
        reset: bool,
    },
}

/// Everything a command needs
struct Context {
    config: Config,
    records: Records,
}

impl Context {
    fn lifecycle(&self) -> SessionLifecycle {
        SessionLifecycle::new(
            self.records.clone(),
            self.config.lifecycle.clone(),
            PostureClassifier::new(self.config.classifier.clone()),
        )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    posture_core::logging::init_with_level(posture_core::logging::level_for_verbosity(
        cli.verbose,
        cli.quiet,
    ));

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let data_dir = cli.data_dir.unwrap_or_else(|| config.data.data_dir.clone());
    let user_id = cli.user.unwrap_or_else(|| config.user.id.clone());

    std::fs::create_dir_all(&data_dir)?;
    let store: SharedStore = Arc::new(JsonFileStore::open(data_dir.join("store.json"))?);
    tracing::debug!("Using data directory {:?} for user {}", data_dir, user_id);

    let ctx = Context {
        records: Records::new(store, user_id),
        config,
    };

    match cli.command {
        Commands::Calibrate { upright, slouch } => cmd_calibrate(&ctx, &upright, &slouch).await,
        Commands::Monitor { replay, cycles } => cmd_monitor(&ctx, &replay, cycles).await,
        Commands::Train { replay, label } => cmd_train(&ctx, &replay, &label).await,
        Commands::Analyze => cmd_analyze(&ctx),
        Commands::Cleanup => cmd_cleanup(&ctx),
        Commands::Stats { days } => cmd_stats(&ctx, days),
        Commands::Export { out, sessions } => cmd_export(&ctx, &out, sessions),
        Commands::Profile { reset } => cmd_profile(&ctx, reset),
    }
}

fn read_recording(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::Other(format!("cannot read recording {}: {}", path.display(), e)))
}

/// Controller whose radio replays `log`
fn spawn_replay(config: &Config, log: &str) -> (CycleHandle, JoinHandle<()>) {
    let devices = config.devices.clone();
    spawn_controller(config.cycle.clone(), config.devices.clone(), move |sink| {
        ReplayRadio::from_log(sink, devices, log)
    })
}

async fn stop(handle: CycleHandle, task: JoinHandle<()>) {
    handle.shutdown();
    if let Err(e) = task.await {
        tracing::warn!("Controller task ended abnormally: {}", e);
    }
}

fn print_capture(label: &str, capture: &PhaseCapture) {
    println!("  {}:", label);
    println!(
        "    upper back pitch {:>6.1}°  roll {:>6.1}°  ({} samples)",
        capture.upper.pitch, capture.upper.roll, capture.upper_samples
    );
    println!(
        "    lower back pitch {:>6.1}°  roll {:>6.1}°  ({} samples)",
        capture.lower.pitch, capture.lower.roll, capture.lower_samples
    );
}

async fn cmd_calibrate(ctx: &Context, upright: &Path, slouch: &Path) -> Result<()> {
    let upright_log = read_recording(upright)?;
    let slouch_log = read_recording(slouch)?;

    let mut engine = CalibrationEngine::new(ctx.records.clone(), ctx.config.calibration.clone());
    engine.begin()?;

    let (handle, task) = spawn_replay(&ctx.config, &upright_log);
    let result = engine.collect_upright(&handle).await;
    stop(handle, task).await;
    let upright_capture = result?;

    let (handle, task) = spawn_replay(&ctx.config, &slouch_log);
    let result = engine.collect_slouch(&handle).await;
    stop(handle, task).await;
    let profile = result?;

    println!("✓ Calibration complete");
    print_capture("Upright", &upright_capture);
    if let (Some(upper), Some(lower)) = (profile.upper_slouch, profile.lower_slouch) {
        println!("  Slouch:");
        println!("    upper back pitch {:>6.1}°  roll {:>6.1}°", upper.pitch, upper.roll);
        println!("    lower back pitch {:>6.1}°  roll {:>6.1}°", lower.pitch, lower.roll);
    }
    print_thresholds(&profile);
    Ok(())
}

fn print_thresholds(profile: &CalibrationProfile) {
    println!(
        "  Upper threshold: {:.2}°",
        profile.upper_threshold.unwrap_or_default()
    );
    println!(
        "  Lower threshold: {:.2}°",
        profile.lower_threshold.unwrap_or_default()
    );
}

async fn cmd_monitor(ctx: &Context, replay: &Path, cycles: usize) -> Result<()> {
    let log = read_recording(replay)?;
    let mut lifecycle = ctx.lifecycle();

    let now = now_ms();
    let expired = lifecycle.run_retention_cleanup(now)?;
    let incomplete = lifecycle.cleanup_incomplete(now)?;
    if expired + incomplete > 0 {
        println!("Removed {} expired and {} incomplete sessions", expired, incomplete);
    }

    let (handle, task) = spawn_replay(&ctx.config, &log);
    let result = PostureMonitor::new(ctx.config.monitor.clone())
        .run(&handle, &mut lifecycle, Some(cycles))
        .await;
    stop(handle, task).await;
    let report = result?;

    println!("✓ Monitored {} cycles", report.cycles);
    println!(
        "  Sessions: {} complete, {} incomplete",
        report.sessions, report.incomplete
    );
    println!(
        "  Analysed: {} ({} slouching)",
        report.analysis.analyzed, report.analysis.slouching
    );
    if report.sessions > 0 && report.analysis.analyzed == 0 {
        println!("  Sessions are pending; run `posture calibrate` to analyse them.");
    }
    Ok(())
}

async fn cmd_train(ctx: &Context, replay: &Path, label: &str) -> Result<()> {
    let log = read_recording(replay)?;

    let (handle, task) = spawn_replay(&ctx.config, &log);
    let result = TrainingCapture::new(ctx.config.training.clone(), &ctx.config.cycle)
        .capture(&handle, &ctx.records, label)
        .await;
    stop(handle, task).await;
    let record = result?;

    println!("✓ Captured training data for '{}'", label.trim());
    println!("  Upper back samples: {}", record.upper_back.len());
    println!("  Lower back samples: {}", record.lower_back.len());
    println!("  Total: {}", record.sample_count);
    Ok(())
}

fn cmd_analyze(ctx: &Context) -> Result<()> {
    let report = ctx.lifecycle().analyze_all_pending(now_ms())?;

    if report.analyzed == 0 {
        println!("No pending sessions to analyse.");
    } else {
        println!(
            "✓ Analysed {} sessions ({} slouching)",
            report.analyzed, report.slouching
        );
    }
    if report.skipped > 0 {
        println!(
            "  {} sessions are missing a sensor sample; `posture cleanup` removes them.",
            report.skipped
        );
    }
    Ok(())
}

fn cmd_cleanup(ctx: &Context) -> Result<()> {
    let mut lifecycle = ctx.lifecycle();
    let now = now_ms();
    let expired = lifecycle.run_retention_cleanup(now)?;
    let incomplete = lifecycle.cleanup_incomplete(now)?;

    println!("✓ Removed {} expired sessions", expired);
    println!("✓ Removed {} incomplete sessions", incomplete);
    Ok(())
}

/// Drop expired sessions before reporting on history
fn expire_old_sessions(ctx: &Context) -> Result<()> {
    let expired = ctx.lifecycle().run_retention_cleanup(now_ms())?;
    if expired > 0 {
        tracing::info!("Removed {} expired sessions before reporting", expired);
    }
    Ok(())
}

fn cmd_stats(ctx: &Context, days: usize) -> Result<()> {
    expire_old_sessions(ctx)?;
    let stats = ctx.records.recent_daily_stats(days)?;
    if stats.is_empty() {
        println!("No posture data yet.");
        return Ok(());
    }

    println!("Date        Total  Slouching  Good  Slouch %");
    for stat in &stats {
        println!(
            "{:<10}  {:>5}  {:>9}  {:>4}  {:>7.1}%",
            stat.date_key,
            stat.total_sessions,
            stat.slouching_sessions,
            stat.good_posture_sessions,
            stat.slouch_percentage
        );
    }
    Ok(())
}

fn cmd_export(ctx: &Context, out: &Path, sessions: bool) -> Result<()> {
    expire_old_sessions(ctx)?;
    let count = if sessions {
        let sessions = ctx.records.all_sessions()?;
        posture_core::export::export_sessions(&sessions, out)?
    } else {
        let mut stats = ctx.records.recent_daily_stats(usize::MAX)?;
        stats.reverse();
        posture_core::export::export_daily_stats(&stats, out)?
    };

    println!("✓ Exported {} rows", count);
    println!("  CSV: {}", out.display());
    Ok(())
}

fn cmd_profile(ctx: &Context, reset: bool) -> Result<()> {
    if reset {
        ctx.records.delete_profile()?;
        println!("✓ Calibration profile removed");
        return Ok(());
    }

    let profile = match ctx.records.load_profile()? {
        Some(profile) if profile.calibrated => profile,
        _ => {
            println!("Not calibrated. Run `posture calibrate` first.");
            return Ok(());
        }
    };

    let calibrated_at = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(profile.timestamp)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| "unknown".into());
    println!("Calibrated at {}", calibrated_at);
    print_thresholds(&profile);
    Ok(())
}
