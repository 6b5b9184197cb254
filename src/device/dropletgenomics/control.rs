//! Camera and pump sub-controllers.
//!
//! Commands are posted as JSON to the rig's control endpoints:
//! - camera: `POST http://{ip}:{http_port}/camera`
//! - pump i: `POST http://{ip}:{pump_data_port}/pumps/{i}`
//!
//! with body `{"command": "<kind>", "value": <argument>}`. Every controller of
//! one device shares a `CommandChannel`, whose lock keeps invocations on that
//! device strictly one at a time.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::device::{validate_command, CommandKind, Controller};

#[derive(Serialize)]
struct CommandBody<'a> {
    command: CommandKind,
    value: &'a serde_json::Value,
}

/// HTTP agent plus the per-device serialization lock.
pub(crate) struct CommandChannel {
    agent: ureq::Agent,
    lock: Mutex<()>,
}

impl CommandChannel {
    pub(crate) fn new(agent: ureq::Agent) -> Self {
        Self {
            agent,
            lock: Mutex::new(()),
        }
    }

    fn post(&self, endpoint: &str, kind: CommandKind, argument: &serde_json::Value) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("command channel lock poisoned"))?;
        let body = CommandBody {
            command: kind,
            value: argument,
        };
        match self.agent.post(endpoint).send_json(&body) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(anyhow!(
                "{} rejected by {} with status {}",
                kind.as_str(),
                endpoint,
                code
            )),
            Err(err) => Err(anyhow!("{} to {} failed: {}", kind.as_str(), endpoint, err)),
        }
    }
}

/// The rig's single camera.
pub struct Camera {
    endpoint: String,
    channel: Arc<CommandChannel>,
}

impl Camera {
    pub(crate) fn new(endpoint: String, channel: Arc<CommandChannel>) -> Self {
        Self { endpoint, channel }
    }
}

impl Controller for Camera {
    fn invoke(&self, kind: CommandKind, argument: serde_json::Value) -> Result<()> {
        validate_command(kind, &argument, true)?;
        log::debug!("camera {} {}", kind.as_str(), argument);
        self.channel.post(&self.endpoint, kind, &argument)
    }
}

/// One syringe pump, addressed by index.
pub struct Pump {
    index: usize,
    endpoint: String,
    channel: Arc<CommandChannel>,
}

impl Pump {
    pub(crate) fn new(index: usize, endpoint: String, channel: Arc<CommandChannel>) -> Self {
        Self {
            index,
            endpoint,
            channel,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl Controller for Pump {
    fn invoke(&self, kind: CommandKind, argument: serde_json::Value) -> Result<()> {
        validate_command(kind, &argument, false)?;
        log::debug!("pump {} {} {}", self.index, kind.as_str(), argument);
        self.channel.post(&self.endpoint, kind, &argument)
    }
}
