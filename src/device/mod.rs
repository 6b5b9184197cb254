//! Imagery devices.
//!
//! This module provides the sources a viewer can stream from:
//! - Video files, still images and image sequences (`FileDevice`)
//! - DropletGenomics microfluidics rigs over HTTP (`DropletGenomicsDevice`)
//! - Synthetic `stub://` sources (testing)
//!
//! Every device produces the same thing: a `FrameStream` fed by a dedicated
//! acquisition thread that runs until the governing `StreamScope` is
//! cancelled. Each device is responsible for:
//! - Polling cancellation at least once per acquired image
//! - Retrying transient acquisition failures without ending the stream
//! - Keeping its cadence at or below the configured frame rate
//!
//! Devices MUST NOT:
//! - Drop frames on a full queue (backpressure, not eviction)
//! - Publish a frame before retiring the previous one (the pipe enforces this)

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{DeviceKind, ViewerConfig};
use crate::pipe::FrameStream;
use crate::scope::StreamScope;

pub mod dropletgenomics;
pub mod file;
#[cfg(feature = "file-ffmpeg")]
pub(crate) mod file_ffmpeg;

pub use dropletgenomics::{DropletConfig, DropletGenomicsDevice};
pub use file::{FileConfig, FileDevice};

/// Which optional control surfaces a device exposes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub camera_control: bool,
    pub pump_control: bool,
}

/// An imagery source.
pub trait Device: Send + Sync {
    /// Source address (file path, host and port).
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Start the acquisition loop and return the consumer half of its pipe.
    ///
    /// The loop runs until `scope` is cancelled, the source is exhausted, or
    /// it fails unrecoverably; in every case the stream then closes.
    fn stream(&self, scope: &StreamScope) -> Result<FrameStream>;

    /// Lightweight liveness probe. Never fails; problems read as `false`.
    fn available(&self) -> bool;

    fn camera(&self) -> Option<&dyn Controller> {
        None
    }

    fn pump(&self, _index: usize) -> Option<&dyn Controller> {
        None
    }

    fn pump_count(&self) -> usize {
        0
    }
}

/// Closed set of commands the control path can send to a sub-controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    CameraSetIllumination,
    CameraSetExposure,
    CameraAutoAdjust,
    PumpRefresh,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::CameraSetIllumination => "camera_set_illumination",
            CommandKind::CameraSetExposure => "camera_set_exposure",
            CommandKind::CameraAutoAdjust => "camera_auto_adjust",
            CommandKind::PumpRefresh => "pump_refresh",
        }
    }

    pub fn targets_camera(&self) -> bool {
        matches!(
            self,
            CommandKind::CameraSetIllumination
                | CommandKind::CameraSetExposure
                | CommandKind::CameraAutoAdjust
        )
    }

    pub fn targets_pump(&self) -> bool {
        matches!(self, CommandKind::PumpRefresh)
    }

    /// Set-style commands carry a numeric argument.
    pub fn requires_number(&self) -> bool {
        matches!(
            self,
            CommandKind::CameraSetIllumination | CommandKind::CameraSetExposure
        )
    }
}

/// A device sub-controller (camera or pump).
///
/// Implementations serialize invocations per device.
pub trait Controller: Send + Sync {
    fn invoke(&self, kind: CommandKind, argument: serde_json::Value) -> Result<()>;
}

/// Build the device selected by `config`.
///
/// Construction failures (missing file, bad address) surface here; the
/// caller must not go on to stream.
pub fn open_device(config: &ViewerConfig) -> Result<Arc<dyn Device>> {
    match config.device {
        DeviceKind::File => {
            let mut file = config.file.clone();
            file.queue_depth = config.queue_depth;
            Ok(Arc::new(FileDevice::new(file)?))
        }
        DeviceKind::DropletGenomics => {
            let mut droplet = config.droplet.clone();
            droplet.queue_depth = config.queue_depth;
            Ok(Arc::new(DropletGenomicsDevice::new(droplet)?))
        }
    }
}

/// Shared argument check for controllers.
pub(crate) fn validate_command(
    kind: CommandKind,
    argument: &serde_json::Value,
    camera: bool,
) -> Result<()> {
    if camera && !kind.targets_camera() {
        return Err(anyhow!("{} is not a camera command", kind.as_str()));
    }
    if !camera && !kind.targets_pump() {
        return Err(anyhow!("{} is not a pump command", kind.as_str()));
    }
    if kind.requires_number() && !argument.is_number() {
        return Err(anyhow!(
            "{} requires a numeric argument, got {}",
            kind.as_str(),
            argument
        ));
    }
    Ok(())
}
