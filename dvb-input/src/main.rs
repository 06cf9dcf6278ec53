//! dvb-input: Linux DVB frontend control and transport stream ingestion.
//!
//! Loads the persisted networks and multiplexes, registers the frontends
//! listed in the config file, optionally tunes them and runs until
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info, warn};

use dvb_input::config::{self, ConfigFile, FrontendSection, DEFAULT_CONFIG_FILE};
use dvb_input::device::LinuxDevices;
use dvb_input::settings::JsonSettings;
use dvb_input::timer::TokioTimer;
use dvb_input::ts_sync::PacketSync;
use dvb_input::{logging, notify, Context};

/// dvb-input - Linux DVB frontend control and TS ingestion
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Directory holding persisted networks, muxes and frontends
    #[arg(short, long)]
    settings_dir: Option<PathBuf>,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // explicit path > auto-detect > defaults
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match config::load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        },
        None => ConfigFile::default(),
    };

    // command line takes precedence
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    let _log_guard = logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let settings_dir = args
        .settings_dir
        .clone()
        .or_else(|| file_config.settings.dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("settings"));

    // one thread drives every monitor tick
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(settings_dir, file_config.frontends))
}

async fn run(
    settings_dir: PathBuf,
    frontends: Vec<FrontendSection>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("dvb-input starting...");
    info!("  Settings: {}", settings_dir.display());

    let settings = Arc::new(JsonSettings::open(&settings_dir)?);
    let sink = Arc::new(PacketSync::new());
    let ctx = Context::new(
        Arc::new(LinuxDevices::new()),
        settings,
        sink.clone(),
        TokioTimer::new(),
    );
    ctx.load()?;

    for section in &frontends {
        setup_frontend(&ctx, section);
    }

    tokio::spawn(notify::log_status(ctx.subscribe_status()));

    let stats_sink = Arc::clone(&sink);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            debug!(
                "{} packets received, {} bytes skipped",
                stats_sink.packet_count(),
                stats_sink.skipped_bytes()
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    ctx.stop_all();
    Ok(())
}

fn setup_frontend(ctx: &Arc<Context>, section: &FrontendSection) {
    let paths = section.paths();
    let id = match ctx.frontend_added(section.adapter, section.number, paths, section.kind) {
        Ok(id) => id,
        Err(e) => {
            error!(
                "adapter{}/frontend{}: {}",
                section.adapter, section.number, e
            );
            return;
        }
    };
    if let Err(e) = ctx.frontend_update(&id, &section.to_update()) {
        warn!("Frontend {}: {}", id, e);
    }
    if !ctx.is_enabled(&id) {
        info!("Frontend {} is disabled or not accessible", id);
        return;
    }

    let Some(mux) = &section.autostart else {
        return;
    };
    let instance = match ctx.create_instance(mux, &id) {
        Ok(instance) => instance,
        Err(e) => {
            error!("Frontend {}: cannot autostart {}: {}", id, mux, e);
            return;
        }
    };
    if let Err(e) = ctx.start(&id, &instance) {
        error!("{}", e);
    }
}
