//! lipovision - headless viewer for LipoVision devices
//!
//! This binary:
//! 1. Loads the viewer configuration (JSON file, env, then flags)
//! 2. Opens the selected device and optionally probes it
//! 3. Applies camera and pump commands through a control session
//! 4. Streams fresh frames into an "original" sink until stopped

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use image::DynamicImage;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use lipovision::{
    open_device, ControlSession, DeviceKind, Sinks, StreamScope, StreamSession, ViewerConfig,
    STREAM_ORIGINAL,
};

/// How often the progress line and snapshot are refreshed.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON config file (overrides LIPOVISION_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Device family: file or droplet-genomics.
    #[arg(long)]
    device: Option<DeviceKind>,
    /// Video file, still image or image directory for the file device.
    #[arg(long)]
    path: Option<String>,
    /// Target frames per second.
    #[arg(long)]
    fps: Option<u32>,
    /// Stop after this many seconds (0 = until the stream ends or Ctrl-C).
    #[arg(long, default_value_t = 0)]
    seconds: u64,
    /// Only report whether the device is available.
    #[arg(long)]
    probe: bool,
    /// Directory receiving latest.png once per second.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
    /// Camera illumination scale value.
    #[arg(long)]
    illumination: Option<f64>,
    /// Camera exposure scale value.
    #[arg(long)]
    exposure: Option<f64>,
    /// Let the camera pick illumination and exposure.
    #[arg(long)]
    auto_adjust: bool,
    /// Send a refresh to every pump before streaming.
    #[arg(long)]
    refresh_pumps: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = resolve_config(&args)?;
    let device = open_device(&config)?;
    log::info!("device: {}", device.name());

    if args.probe {
        let available = device.available();
        let state = if available { "available" } else { "unavailable" };
        println!("{}: {}", device.name(), state);
        return if available {
            Ok(())
        } else {
            Err(anyhow!("{} is not available", device.name()))
        };
    }

    let mut control = ControlSession::new(device.clone());
    if args.auto_adjust {
        control.auto_adjust()?;
    }
    if let Some(value) = args.illumination {
        control.set_illumination(value)?;
    }
    if let Some(value) = args.exposure {
        control.set_exposure(value)?;
    }
    if device.capabilities().camera_control {
        log::info!(
            "camera: illumination {}, exposure {}",
            describe_scale(control.illumination()),
            describe_scale(control.exposure())
        );
    }
    if args.refresh_pumps {
        let refreshed = control.refresh_pumps();
        log::info!("refreshed {}/{} pumps", refreshed, device.pump_count());
    }

    let root = StreamScope::new();
    let signal_scope = root.clone();
    ctrlc::set_handler(move || signal_scope.cancel()).context("install Ctrl-C handler")?;

    let mut session = StreamSession::new(root);
    session.switch_to(device, original_sink(args.snapshot_dir.clone())?)?;

    let started = Instant::now();
    let limit = (args.seconds > 0).then(|| Duration::from_secs(args.seconds));
    while !session.is_finished() {
        if limit.map(|limit| started.elapsed() >= limit).unwrap_or(false) {
            log::info!("time limit reached");
            break;
        }
        if !session.root().sleep(Duration::from_millis(50)) {
            log::info!("shutdown signal received");
            break;
        }
    }

    if let Some(stats) = session.shutdown() {
        log::info!(
            "stream finished: {} frame(s) shown, {} stale frame(s) skipped",
            stats.processed,
            stats.skipped
        );
    }
    Ok(())
}

fn resolve_config(args: &Args) -> Result<ViewerConfig> {
    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("LIPOVISION_CONFIG").ok().map(PathBuf::from));
    let mut config = ViewerConfig::read(config_path.as_deref())?;
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(path) = &args.path {
        config.file.path = path.clone();
    }
    if let Some(fps) = args.fps {
        config.set_target_fps(fps);
    }
    config.validate()?;
    Ok(config)
}

fn describe_scale(value: Option<f64>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "unchanged".to_string())
}

fn original_sink(snapshot_dir: Option<PathBuf>) -> Result<Sinks> {
    if let Some(dir) = &snapshot_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;
    }
    let mut shown = 0u64;
    let mut last_report = Instant::now();
    Ok(Sinks::new().with(STREAM_ORIGINAL, move |image: &DynamicImage| {
        shown += 1;
        if last_report.elapsed() < REPORT_INTERVAL && shown > 1 {
            return;
        }
        last_report = Instant::now();
        log::info!(
            "{} frame(s) shown, latest {}x{}",
            shown,
            image.width(),
            image.height()
        );
        if let Some(dir) = &snapshot_dir {
            let path = dir.join("latest.png");
            if let Err(err) = image.save(&path) {
                log::warn!("snapshot {} failed: {}", path.display(), err);
            }
        }
    }))
}
