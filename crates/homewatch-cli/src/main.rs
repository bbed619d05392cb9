//! `homewatch` – the device daemon.
//!
//! 1. Loads `~/.homewatch/config.toml`, writing the defaults on first run.
//! 2. Initialises logging (and OTLP export when configured).
//! 3. Connects to the Redis store and wires sensors, series recorder and
//!    camera actuators onto the bus.
//! 4. Runs until **Ctrl-C**, then stops every service.

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use thiserror::Error;
use tracing::{info, warn};

use homewatch_hal::{SensorSet, SimSpi};
use homewatch_memory::SeriesRegistry;
use homewatch_middleware::{Bus, RedisStore};
use homewatch_runtime::telemetry::{self, LogFormat};
use homewatch_runtime::{CameraControl, PeripheralService, SeriesRecorder};
use homewatch_types::{BusError, Clock, SeriesError, StoreError, SystemClock};

use config::Config;

/// Period of the simulated PIR detections.
const SIMULATED_MOTION_EVERY: Duration = Duration::from_secs(45);

#[derive(Debug, Error)]
enum StartupError {
    #[error("bus: {0}")]
    Bus(#[from] BusError),

    #[error("series: {0}")]
    Series(#[from] SeriesError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("runtime: {0}")]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    // ── Configuration ─────────────────────────────────────────────────────
    let (cfg, config_note) = load_config();

    // ── Structured logging ────────────────────────────────────────────────
    let format = LogFormat::from_env().unwrap_or(cfg.log_format);
    let tracing_guard = telemetry::init_tracing("homewatch", format);
    if tracing_guard.is_exporting() {
        info!("exporting spans over OTLP");
    }

    print_banner();
    println!("  {config_note}");

    match start(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{}: {}", "Startup failed".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> (Config, String) {
    let path = config::config_path();
    match config::load() {
        Ok(Some(cfg)) => (
            cfg,
            format!("Config loaded from {}", path.display().to_string().bold()),
        ),
        Ok(None) => {
            let mut cfg = Config::default();
            let note = match config::save(&cfg) {
                Ok(()) => format!("Default config written to {}", path.display().to_string().bold()),
                Err(e) => format!("{}: {}", "Could not write default config".yellow(), e),
            };
            config::apply_env_overrides(&mut cfg);
            (cfg, note)
        }
        Err(e) => {
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            (cfg, format!("{}: {} (using defaults)", "Config error".red(), e))
        }
    }
}

fn start(cfg: Config) -> Result<(), StartupError> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<(), StartupError> {
    // ── Store & bus ───────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    println!("  Connecting to store at {} …", cfg.store_url.dimmed());
    let store = RedisStore::connect(&cfg.store_url).await?;
    let bus = Bus::new(Arc::new(store));

    // ── Sensors ───────────────────────────────────────────────────────────
    if !cfg.mock_sensors {
        warn!("no hardware drivers are built in; using simulated sensors");
    }
    let sensors = SensorSet::simulated(Arc::clone(&clock));
    let motion = sensors.motion().simulate(SIMULATED_MOTION_EVERY);

    // ── Series recording ──────────────────────────────────────────────────
    let registry = SeriesRegistry::new(bus.clone(), Arc::clone(&clock));
    let recorder = SeriesRecorder::start(&sensors, &registry, &cfg.recorded_series).await?;

    // ── Camera actuators ──────────────────────────────────────────────────
    let peripherals = PeripheralService::start(&bus, Arc::new(SimSpi::new())).await?;
    let camera = CameraControl::new(bus.clone(), cfg.ack_timeout());
    let settings = camera.values().await?;
    info!(x = settings.x, y = settings.y, ir = settings.ir, "camera settings loaded");

    println!(
        "  {} recording {} series; press {} to stop.",
        "●".green(),
        recorder.recording().len(),
        "Ctrl-C".bold()
    );

    // ── Shutdown ──────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    println!();
    println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());

    recorder.stop();
    peripherals.stop();
    motion.abort();

    println!("{}", "  ✓ Exiting homewatch.".green());
    Ok(())
}

fn print_banner() {
    println!();
    println!("{}", "  homewatch".bold().cyan());
    println!("{}", "  sensors · time series · camera".dimmed());
    println!();
}
