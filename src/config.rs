use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::device::{DropletConfig, FileConfig};
use crate::pipe::DEFAULT_QUEUE_DEPTH;

const MAX_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Deserialize, Default)]
struct ViewerConfigFile {
    device: Option<DeviceKind>,
    queue_depth: Option<usize>,
    file: Option<FileConfigFile>,
    droplet: Option<DropletConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct FileConfigFile {
    path: Option<String>,
    target_fps: Option<u32>,
    looping: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DropletConfigFile {
    ip_address: Option<String>,
    http_port: Option<u16>,
    pump_data_port: Option<u16>,
    recording_data_port: Option<u16>,
    pump_count: Option<usize>,
    stream_port: Option<u16>,
    stream_path: Option<String>,
    control_path: Option<String>,
    target_fps: Option<u32>,
    connect_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
}

/// Device family selected by the viewer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    File,
    DropletGenomics,
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(DeviceKind::File),
            "droplet_genomics" | "droplet-genomics" | "dropletgenomics" => {
                Ok(DeviceKind::DropletGenomics)
            }
            other => Err(format!(
                "unknown device {:?} (expected file or droplet_genomics)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub device: DeviceKind,
    /// Frame queue capacity shared by every device.
    pub queue_depth: usize,
    pub file: FileConfig,
    pub droplet: DropletConfig,
}

impl ViewerConfig {
    /// Load from `LIPOVISION_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LIPOVISION_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit JSON file (or defaults), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let cfg = Self::read(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Like `load_from`, without validation, for callers that layer more
    /// overrides on top and validate afterwards.
    pub fn read(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn from_file(file: ViewerConfigFile) -> Self {
        let file_defaults = FileConfig::default();
        let droplet_defaults = DropletConfig::default();
        let queue_depth = file.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH);

        let source = file.file.unwrap_or_default();
        let file_settings = FileConfig {
            path: source.path.unwrap_or(file_defaults.path),
            target_fps: source.target_fps.unwrap_or(file_defaults.target_fps),
            looping: source.looping.unwrap_or(file_defaults.looping),
            queue_depth,
        };

        let rig = file.droplet.unwrap_or_default();
        let droplet = DropletConfig {
            ip_address: rig.ip_address.unwrap_or(droplet_defaults.ip_address),
            http_port: rig.http_port.unwrap_or(droplet_defaults.http_port),
            pump_data_port: rig.pump_data_port.unwrap_or(droplet_defaults.pump_data_port),
            recording_data_port: rig
                .recording_data_port
                .unwrap_or(droplet_defaults.recording_data_port),
            pump_count: rig.pump_count.unwrap_or(droplet_defaults.pump_count),
            stream_port: rig.stream_port.unwrap_or(droplet_defaults.stream_port),
            stream_path: rig.stream_path.unwrap_or(droplet_defaults.stream_path),
            control_path: rig.control_path.unwrap_or(droplet_defaults.control_path),
            target_fps: rig.target_fps.unwrap_or(droplet_defaults.target_fps),
            connect_timeout: millis_or(rig.connect_timeout_ms, droplet_defaults.connect_timeout),
            read_timeout: millis_or(rig.read_timeout_ms, droplet_defaults.read_timeout),
            request_timeout: millis_or(rig.request_timeout_ms, droplet_defaults.request_timeout),
            reconnect_delay: millis_or(rig.reconnect_delay_ms, droplet_defaults.reconnect_delay),
            queue_depth,
        };

        Self {
            device: file.device.unwrap_or_default(),
            queue_depth,
            file: file_settings,
            droplet,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("LIPOVISION_DEVICE") {
            if !device.trim().is_empty() {
                self.device = device
                    .parse()
                    .map_err(|e| anyhow!("LIPOVISION_DEVICE: {}", e))?;
            }
        }
        if let Ok(path) = std::env::var("LIPOVISION_VIDEO_PATH") {
            if !path.trim().is_empty() {
                self.file.path = path;
            }
        }
        if let Ok(fps) = std::env::var("LIPOVISION_TARGET_FPS") {
            let fps: u32 = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("LIPOVISION_TARGET_FPS must be an integer frame rate"))?;
            self.file.target_fps = fps;
            self.droplet.target_fps = fps;
        }
        if let Ok(ip) = std::env::var("LIPOVISION_DEVICE_IP") {
            if !ip.trim().is_empty() {
                self.droplet.ip_address = ip.trim().to_string();
            }
        }
        if let Ok(count) = std::env::var("LIPOVISION_PUMP_COUNT") {
            self.droplet.pump_count = count
                .trim()
                .parse()
                .map_err(|_| anyhow!("LIPOVISION_PUMP_COUNT must be a non-negative integer"))?;
        }
        if let Ok(depth) = std::env::var("LIPOVISION_QUEUE_DEPTH") {
            let depth: usize = depth
                .trim()
                .parse()
                .map_err(|_| anyhow!("LIPOVISION_QUEUE_DEPTH must be an integer"))?;
            self.set_queue_depth(depth);
        }
        Ok(())
    }

    /// Overwrite the queue depth everywhere it is carried.
    pub fn set_queue_depth(&mut self, depth: usize) {
        self.queue_depth = depth;
        self.file.queue_depth = depth;
        self.droplet.queue_depth = depth;
    }

    /// Overwrite the frame rate of both device families.
    pub fn set_target_fps(&mut self, fps: u32) {
        self.file.target_fps = fps;
        self.droplet.target_fps = fps;
    }

    /// Re-check invariants after callers (e.g. the CLI) changed fields.
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 || self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(anyhow!(
                "queue_depth must be between 1 and {}",
                MAX_QUEUE_DEPTH
            ));
        }
        if self.file.target_fps == 0 || self.droplet.target_fps == 0 {
            return Err(anyhow!("target_fps must be >= 1"));
        }
        if self.device == DeviceKind::File && self.file.path.trim().is_empty() {
            return Err(anyhow!(
                "file device selected but no path configured (set LIPOVISION_VIDEO_PATH)"
            ));
        }
        if self.device == DeviceKind::DropletGenomics && self.droplet.ip_address.trim().is_empty()
        {
            return Err(anyhow!("droplet_genomics device selected but ip_address is empty"));
        }
        Ok(())
    }
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn read_config_file(path: &Path) -> Result<ViewerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
