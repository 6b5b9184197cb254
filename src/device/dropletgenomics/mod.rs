//! DropletGenomics microfluidics rig.
//!
//! This module provides `DropletGenomicsDevice` for streaming frames from the
//! rig's camera over HTTP and driving its camera and pump controllers.
//!
//! The device is responsible for:
//! - Holding a long-lived GET on the video feed and cutting PNG images out
//!   of the raw body (`wire`)
//! - Reconnecting after any connection, framing or decode failure
//! - Decimating the feed to the target frame rate (newest image wins)
//! - Probing the control endpoint for liveness
//!
//! The device MUST NOT:
//! - Treat a dropped connection as the end of the stream
//! - Block on a network read past its read timeout
//! - Keep reading the feed once its scope is cancelled

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{Capabilities, Controller, Device};
use crate::pipe::{
    frame_interval, frame_pipe, FramePublisher, FrameStream, Pacer, DEFAULT_QUEUE_DEPTH,
};
use crate::scope::StreamScope;

mod control;
pub mod wire;

use control::CommandChannel;
pub use control::{Camera, Pump};
use wire::{decode_png, FeedReader};

/// Configuration for a DropletGenomics rig.
#[derive(Clone, Debug)]
pub struct DropletConfig {
    pub ip_address: String,
    /// Control HTTP port (liveness probe, camera commands).
    pub http_port: u16,
    /// Pump command port.
    pub pump_data_port: u16,
    /// Recording data port. Carried for identity; nothing streams from it.
    pub recording_data_port: u16,
    pub pump_count: usize,
    /// Port and path of the video feed.
    pub stream_port: u16,
    pub stream_path: String,
    /// Path probed by `available()`.
    pub control_path: String,
    /// Frames per second published to the consumer.
    pub target_fps: u32,
    pub connect_timeout: Duration,
    /// Bound on any single blocking read from the feed.
    pub read_timeout: Duration,
    /// Overall bound on a liveness probe or command request.
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub queue_depth: usize,
}

impl Default for DropletConfig {
    fn default() -> Self {
        Self {
            ip_address: "192.168.1.100".to_string(),
            http_port: 80,
            pump_data_port: 8766,
            recording_data_port: 8767,
            pump_count: 4,
            stream_port: 8765,
            stream_path: "/video_feed".to_string(),
            control_path: "/".to_string(),
            target_fps: 30,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_millis(500),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// DropletGenomics rig: HTTP video feed, one camera, a bank of pumps.
pub struct DropletGenomicsDevice {
    config: DropletConfig,
    name: String,
    stream_url: String,
    control_url: String,
    stream_agent: ureq::Agent,
    control_agent: ureq::Agent,
    camera: Camera,
    pumps: Vec<Pump>,
}

impl DropletGenomicsDevice {
    pub fn new(config: DropletConfig) -> Result<Self> {
        if config.target_fps == 0 {
            return Err(anyhow!("target_fps must be >= 1"));
        }
        let stream_url = endpoint(&config, config.stream_port, &config.stream_path)?;
        let control_url = endpoint(&config, config.http_port, &config.control_path)?;
        let camera_url = endpoint(&config, config.http_port, "/camera")?;

        let stream_agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout_read(config.read_timeout)
            .build();
        let control_agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout(config.request_timeout)
            .build();

        let channel = Arc::new(CommandChannel::new(control_agent.clone()));
        let camera = Camera::new(camera_url, channel.clone());
        let pumps = (0..config.pump_count)
            .map(|index| {
                let url = endpoint(&config, config.pump_data_port, &format!("/pumps/{}", index))?;
                Ok(Pump::new(index, url, channel.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let name = format!("dropletgenomics@{}:{}", config.ip_address, config.http_port);
        Ok(Self {
            config,
            name,
            stream_url,
            control_url,
            stream_agent,
            control_agent,
            camera,
            pumps,
        })
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }
}

impl Device for DropletGenomicsDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            camera_control: true,
            pump_control: !self.pumps.is_empty(),
        }
    }

    fn stream(&self, scope: &StreamScope) -> Result<FrameStream> {
        let (publisher, stream) = frame_pipe(scope, self.config.queue_depth);
        let publisher = publisher.with_frame_window(frame_interval(self.config.target_fps));
        let feed = FeedSettings {
            url: self.stream_url.clone(),
            agent: self.stream_agent.clone(),
            target_fps: self.config.target_fps,
            reconnect_delay: self.config.reconnect_delay,
        };
        std::thread::Builder::new()
            .name("droplet-stream".to_string())
            .spawn(move || run_feed(feed, publisher))
            .context("spawn droplet stream thread")?;
        Ok(stream)
    }

    fn available(&self) -> bool {
        match self.control_agent.get(&self.control_url).call() {
            Ok(response) => (200..=299).contains(&response.status()),
            Err(ureq::Error::Status(code, _)) => {
                log::debug!("DropletGenomics: {} answered {}", self.control_url, code);
                false
            }
            Err(err) => {
                log::debug!("DropletGenomics: {} unreachable: {}", self.control_url, err);
                false
            }
        }
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

// ----------------------------------------------------------------------------
// Acquisition loop
// ----------------------------------------------------------------------------

struct FeedSettings {
    url: String,
    agent: ureq::Agent,
    target_fps: u32,
    reconnect_delay: Duration,
}

enum FeedEnd {
    Cancelled,
    ConsumerGone,
}

fn run_feed(feed: FeedSettings, mut publisher: FramePublisher<DynamicImage>) {
    let scope = publisher.scope().clone();
    let mut pacer = Pacer::new(feed.target_fps);
    let mut connections = 0u64;

    while !scope.is_cancelled() {
        connections += 1;
        match read_feed(&feed, &scope, &mut pacer, &mut publisher) {
            Ok(FeedEnd::Cancelled) => break,
            Ok(FeedEnd::ConsumerGone) => {
                log::info!("DropletGenomics: consumer of {} went away", feed.url);
                break;
            }
            Err(err) => {
                log::warn!(
                    "DropletGenomics: feed {} dropped (attempt {}): {:#}",
                    feed.url,
                    connections,
                    err
                );
                if !scope.sleep(feed.reconnect_delay) {
                    break;
                }
            }
        }
    }

    log::info!(
        "DropletGenomics: stream {} stopped after {} frame(s), {} connection(s)",
        feed.url,
        publisher.published(),
        connections
    );
    publisher.close();
}

fn read_feed(
    feed: &FeedSettings,
    scope: &StreamScope,
    pacer: &mut Pacer,
    publisher: &mut FramePublisher<DynamicImage>,
) -> Result<FeedEnd> {
    let response = feed
        .agent
        .get(&feed.url)
        .call()
        .with_context(|| format!("connect to {}", feed.url))?;
    log::info!("DropletGenomics: connected to {}", feed.url);

    let body = scope.bind_reader(response.into_reader());
    let mut reader = FeedReader::new(BufReader::new(body));
    loop {
        if scope.is_cancelled() {
            return Ok(FeedEnd::Cancelled);
        }
        let png = match reader.next_png() {
            Ok(png) => png,
            Err(_) if scope.is_cancelled() => return Ok(FeedEnd::Cancelled),
            Err(err) => {
                return Err(err.context(format!("after {} image(s)", reader.images_read())))
            }
        };
        if !pacer.admit() {
            continue;
        }
        let image = decode_png(&png)?;
        if publisher.publish(image).is_err() {
            return Ok(if scope.is_cancelled() {
                FeedEnd::Cancelled
            } else {
                FeedEnd::ConsumerGone
            });
        }
    }
}

fn endpoint(config: &DropletConfig, port: u16, path: &str) -> Result<String> {
    let raw = format!("http://{}:{}{}", config.ip_address, port, path);
    let url = Url::parse(&raw).with_context(|| format!("invalid device address {}", raw))?;
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(anyhow!("device address {} has no host", raw));
    }
    Ok(url.to_string())
}
