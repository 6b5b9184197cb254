//! Viewer sessions.
//!
//! - `StreamSession`: owns the governing scope of the active stream and
//!   implements device switching (cancel, drain, rebuild, restream).
//! - `ControlSession`: owns the last values sent to the camera's scales and
//!   forwards control commands to a device's sub-controllers.

use anyhow::{anyhow, Result};
use serde_json::json;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::device::{CommandKind, Device};
use crate::processor::{FrameProcessor, ProcessorStats, Sinks};
use crate::scope::StreamScope;

// ----------------------------------------------------------------------------
// StreamSession
// ----------------------------------------------------------------------------

struct ActiveStream {
    device: Arc<dyn Device>,
    scope: StreamScope,
    processor: JoinHandle<ProcessorStats>,
}

/// Drives at most one device stream at a time.
///
/// Every stream runs under a child of the session's root scope, so
/// cancelling the root (e.g. from a signal handler) ends whatever is active.
pub struct StreamSession {
    root: StreamScope,
    active: Option<ActiveStream>,
}

impl StreamSession {
    pub fn new(root: StreamScope) -> Self {
        Self { root, active: None }
    }

    pub fn root(&self) -> &StreamScope {
        &self.root
    }

    pub fn device(&self) -> Option<&Arc<dyn Device>> {
        self.active.as_ref().map(|active| &active.device)
    }

    /// Retire the current stream (if any) and start streaming `device` into
    /// `sinks` under a fresh scope.
    pub fn switch_to(&mut self, device: Arc<dyn Device>, sinks: Sinks) -> Result<()> {
        if let Some(stats) = self.stop() {
            log::info!(
                "previous stream: {} processed, {} skipped",
                stats.processed,
                stats.skipped
            );
        }
        if self.root.is_cancelled() {
            return Err(anyhow!("session is shut down"));
        }

        let scope = self.root.child();
        let stream = match device.stream(&scope) {
            Ok(stream) => stream,
            Err(err) => {
                scope.cancel();
                return Err(err);
            }
        };
        let mut outputs: Vec<&str> = sinks.names().collect();
        outputs.sort_unstable();
        let outputs = outputs.join(", ");
        let processor = FrameProcessor::new().launch(stream, sinks)?;
        log::info!("streaming from {} into [{}]", device.name(), outputs);
        self.active = Some(ActiveStream {
            device,
            scope,
            processor,
        });
        Ok(())
    }

    /// True once the active stream has closed on its own (source exhausted
    /// or failed), or if nothing is streaming.
    pub fn is_finished(&self) -> bool {
        self.active
            .as_ref()
            .map(|active| active.processor.is_finished())
            .unwrap_or(true)
    }

    /// Cancel the active stream and wait for its processor to drain.
    pub fn stop(&mut self) -> Option<ProcessorStats> {
        let active = self.active.take()?;
        active.scope.cancel();
        match active.processor.join() {
            Ok(stats) => Some(stats),
            Err(_) => {
                log::error!("frame processor for {} panicked", active.device.name());
                None
            }
        }
    }

    /// Cancel the root scope and stop the active stream.
    pub fn shutdown(mut self) -> Option<ProcessorStats> {
        self.root.cancel();
        self.stop()
    }
}

// ----------------------------------------------------------------------------
// ControlSession
// ----------------------------------------------------------------------------

/// Control path of one device. Scale values are only forwarded when they
/// differ from the last value successfully sent.
pub struct ControlSession {
    device: Arc<dyn Device>,
    illumination: Option<f64>,
    exposure: Option<f64>,
}

impl ControlSession {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            illumination: None,
            exposure: None,
        }
    }

    pub fn illumination(&self) -> Option<f64> {
        self.illumination
    }

    pub fn exposure(&self) -> Option<f64> {
        self.exposure
    }

    /// Returns whether a command was actually sent.
    pub fn set_illumination(&mut self, value: f64) -> Result<bool> {
        if self.illumination == Some(value) {
            return Ok(false);
        }
        self.camera_invoke(CommandKind::CameraSetIllumination, json!(value))?;
        self.illumination = Some(value);
        Ok(true)
    }

    /// Returns whether a command was actually sent.
    pub fn set_exposure(&mut self, value: f64) -> Result<bool> {
        if self.exposure == Some(value) {
            return Ok(false);
        }
        self.camera_invoke(CommandKind::CameraSetExposure, json!(value))?;
        self.exposure = Some(value);
        Ok(true)
    }

    pub fn auto_adjust(&mut self) -> Result<()> {
        self.camera_invoke(CommandKind::CameraAutoAdjust, json!(0))?;
        // The camera picks its own values; ours are stale now.
        self.illumination = None;
        self.exposure = None;
        Ok(())
    }

    pub fn invoke_pump(
        &self,
        index: usize,
        kind: CommandKind,
        argument: serde_json::Value,
    ) -> Result<()> {
        let pump = self
            .device
            .pump(index)
            .ok_or_else(|| anyhow!("{} has no pump {}", self.device.name(), index))?;
        pump.invoke(kind, argument)
    }

    /// Refresh every pump. Failures are logged and do not stop the sweep.
    /// Returns the number of pumps refreshed.
    pub fn refresh_pumps(&self) -> usize {
        let mut refreshed = 0;
        for index in 0..self.device.pump_count() {
            match self.invoke_pump(index, CommandKind::PumpRefresh, serde_json::Value::Null) {
                Ok(()) => refreshed += 1,
                Err(err) => log::warn!("pump {} refresh failed: {:#}", index, err),
            }
        }
        refreshed
    }

    fn camera_invoke(&self, kind: CommandKind, argument: serde_json::Value) -> Result<()> {
        let camera = self
            .device
            .camera()
            .ok_or_else(|| anyhow!("{} has no camera control", self.device.name()))?;
        camera.invoke(kind, argument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Capabilities, Controller};
    use crate::pipe::{frame_pipe, FrameStream};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingController {
        calls: Mutex<Vec<(CommandKind, serde_json::Value)>>,
    }

    impl Controller for RecordingController {
        fn invoke(&self, kind: CommandKind, argument: serde_json::Value) -> Result<()> {
            self.calls.lock().expect("calls lock").push((kind, argument));
            Ok(())
        }
    }

    struct FakeRig {
        camera: RecordingController,
        pumps: Vec<RecordingController>,
    }

    impl Device for FakeRig {
        fn name(&self) -> &str {
            "fake-rig"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                camera_control: true,
                pump_control: true,
            }
        }

        fn stream(&self, scope: &StreamScope) -> Result<FrameStream> {
            let (publisher, stream) = frame_pipe(scope, 1);
            publisher.close();
            Ok(stream)
        }

        fn available(&self) -> bool {
            true
        }

        fn camera(&self) -> Option<&dyn Controller> {
            Some(&self.camera)
        }

        fn pump(&self, index: usize) -> Option<&dyn Controller> {
            self.pumps.get(index).map(|pump| pump as &dyn Controller)
        }

        fn pump_count(&self) -> usize {
            self.pumps.len()
        }
    }

    fn fake_rig(pumps: usize) -> Arc<FakeRig> {
        Arc::new(FakeRig {
            camera: RecordingController::default(),
            pumps: (0..pumps).map(|_| RecordingController::default()).collect(),
        })
    }

    #[test]
    fn unchanged_scale_values_are_not_resent() -> Result<()> {
        let rig = fake_rig(0);
        let mut control = ControlSession::new(rig.clone());

        assert!(control.set_illumination(0.5)?);
        assert!(!control.set_illumination(0.5)?);
        assert!(control.set_illumination(0.7)?);
        assert!(control.set_exposure(0.5)?);
        assert_eq!(control.illumination(), Some(0.7));
        assert_eq!(control.exposure(), Some(0.5));

        let calls = rig.camera.calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], (CommandKind::CameraSetIllumination, json!(0.5)));
        assert_eq!(calls[2], (CommandKind::CameraSetExposure, json!(0.5)));
        Ok(())
    }

    #[test]
    fn auto_adjust_forgets_last_values() -> Result<()> {
        let rig = fake_rig(0);
        let mut control = ControlSession::new(rig.clone());
        control.set_exposure(0.2)?;
        control.auto_adjust()?;
        assert_eq!(control.exposure(), None);
        assert!(control.set_exposure(0.2)?);
        Ok(())
    }

    #[test]
    fn refresh_reaches_every_pump() {
        let rig = fake_rig(3);
        let control = ControlSession::new(rig.clone());
        assert_eq!(control.refresh_pumps(), 3);
        for pump in &rig.pumps {
            let calls = pump.calls.lock().expect("calls lock");
            assert_eq!(
                calls.as_slice(),
                &[(CommandKind::PumpRefresh, serde_json::Value::Null)]
            );
        }
        assert!(control
            .invoke_pump(3, CommandKind::PumpRefresh, serde_json::Value::Null)
            .is_err());
    }

    #[test]
    fn stream_session_finishes_when_source_closes() -> Result<()> {
        let mut session = StreamSession::new(StreamScope::new());
        assert!(session.is_finished());
        session.switch_to(fake_rig(0), Sinks::new())?;
        let stats = session.stop().expect("active stream");
        assert_eq!(stats, ProcessorStats::default());
        assert!(session.device().is_none());
        Ok(())
    }

    #[test]
    fn shut_down_session_refuses_new_streams() {
        let root = StreamScope::new();
        let mut session = StreamSession::new(root.clone());
        root.cancel();
        assert!(session.switch_to(fake_rig(0), Sinks::new()).is_err());
    }
}
