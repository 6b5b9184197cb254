//! File-backed device.
//!
//! This module provides `FileDevice` for streaming frames from local media.
//! The file device is responsible for:
//! - Reading still images, image sequences (a directory of stills, played in
//!   file name order) or, with `file-ffmpeg`, video containers
//! - Decoding frames in-memory
//! - Pacing playback at the configured frame rate
//! - Producing `Frame` instances through the device's pipe
//!
//! The file device MUST NOT:
//! - Fetch remote URLs
//! - Write decoded frames back to disk

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, Rgb, RgbImage};
use std::path::{Path, PathBuf};

use super::{Capabilities, Device};
#[cfg(feature = "file-ffmpeg")]
use super::file_ffmpeg::FfmpegReader;
use crate::pipe::{frame_pipe, FramePublisher, FrameStream, Pacer, DEFAULT_QUEUE_DEPTH};
use crate::scope::StreamScope;

const STILL_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];
/// Decode failures in a row after which the source is considered broken.
const MAX_CONSECUTIVE_FAILURES: u32 = 8;
const SYNTHETIC_WIDTH: u32 = 320;
const SYNTHETIC_HEIGHT: u32 = 240;

/// Configuration for a file-backed device.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local path (e.g. "/data/run-07.mp4", "/data/run-07/"), or `stub://name`.
    pub path: String,
    /// Playback rate (frames per second).
    pub target_fps: u32,
    /// Restart from the first frame when the source is exhausted.
    pub looping: bool,
    pub queue_depth: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            target_fps: 24,
            looping: false,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// File-backed device.
pub struct FileDevice {
    config: FileConfig,
    source: FileSource,
}

#[derive(Clone, Debug)]
enum FileSource {
    Synthetic,
    Stills(Vec<PathBuf>),
    #[cfg(feature = "file-ffmpeg")]
    Video,
}

impl FileDevice {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file device only supports local paths (no URL schemes), got '{}'",
                config.path
            ));
        }
        if config.target_fps == 0 {
            return Err(anyhow!("target_fps must be >= 1"));
        }
        let source = if config.path.starts_with("stub://") {
            FileSource::Synthetic
        } else {
            probe_source(Path::new(&config.path))?
        };
        log::debug!("FileDevice: {} resolved to {:?}", config.path, source);
        Ok(Self { config, source })
    }

}

impl Device for FileDevice {
    fn name(&self) -> &str {
        &self.config.path
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn stream(&self, scope: &StreamScope) -> Result<FrameStream> {
        let (publisher, stream) = frame_pipe(scope, self.config.queue_depth);
        let config = self.config.clone();
        let source = self.source.clone();
        std::thread::Builder::new()
            .name("file-stream".to_string())
            .spawn(move || run_file_stream(source, config, publisher))
            .context("spawn file stream thread")?;
        Ok(stream)
    }

    fn available(&self) -> bool {
        match &self.source {
            FileSource::Synthetic => true,
            _ => Path::new(&self.config.path).exists(),
        }
    }
}

fn run_file_stream(
    source: FileSource,
    config: FileConfig,
    mut publisher: FramePublisher<DynamicImage>,
) {
    let scope = publisher.scope().clone();
    let mut reader = match FileReader::open(&source, &config) {
        Ok(reader) => reader,
        Err(err) => {
            log::error!("FileDevice: failed to open {}: {:#}", config.path, err);
            publisher.close();
            return;
        }
    };
    log::info!(
        "FileDevice: streaming {} at {} fps",
        config.path,
        config.target_fps
    );

    let mut pacer = Pacer::new(config.target_fps);
    let mut this_pass = 0u64;
    let mut failures = 0u32;
    loop {
        if !pacer.wait(&scope) {
            break;
        }
        let image = match reader.next_image() {
            Ok(Some(image)) => image,
            Ok(None) if config.looping && this_pass > 0 => {
                if let Err(err) = reader.rewind() {
                    log::error!("FileDevice: rewind of {} failed: {:#}", config.path, err);
                    break;
                }
                this_pass = 0;
                continue;
            }
            Ok(None) => {
                log::info!("FileDevice: end of {}", config.path);
                break;
            }
            Err(err) => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    log::error!(
                        "FileDevice: giving up on {} after {} failed frames: {:#}",
                        config.path,
                        failures,
                        err
                    );
                    break;
                }
                log::warn!("FileDevice: skipping frame of {}: {:#}", config.path, err);
                continue;
            }
        };
        failures = 0;
        this_pass += 1;
        if publisher.publish(image).is_err() {
            break;
        }
    }
    log::info!(
        "FileDevice: stream of {} stopped after {} frame(s)",
        config.path,
        publisher.published()
    );
    publisher.close();
}

// ----------------------------------------------------------------------------
// Readers
// ----------------------------------------------------------------------------

enum FileReader {
    Synthetic(SyntheticReader),
    Stills(StillsReader),
    #[cfg(feature = "file-ffmpeg")]
    Ffmpeg(FfmpegReader),
}

impl FileReader {
    #[cfg_attr(not(feature = "file-ffmpeg"), allow(unused_variables))]
    fn open(source: &FileSource, config: &FileConfig) -> Result<Self> {
        match source {
            FileSource::Synthetic => Ok(Self::Synthetic(SyntheticReader::new())),
            FileSource::Stills(paths) => Ok(Self::Stills(StillsReader::new(paths.clone()))),
            #[cfg(feature = "file-ffmpeg")]
            FileSource::Video => Ok(Self::Ffmpeg(FfmpegReader::open(&config.path)?)),
        }
    }

    fn next_image(&mut self) -> Result<Option<DynamicImage>> {
        match self {
            Self::Synthetic(reader) => Ok(Some(reader.next_image())),
            Self::Stills(reader) => reader.next_image(),
            #[cfg(feature = "file-ffmpeg")]
            Self::Ffmpeg(reader) => reader.next_image(),
        }
    }

    fn rewind(&mut self) -> Result<()> {
        match self {
            Self::Synthetic(_) => Ok(()),
            Self::Stills(reader) => {
                reader.index = 0;
                Ok(())
            }
            #[cfg(feature = "file-ffmpeg")]
            Self::Ffmpeg(reader) => reader.rewind(),
        }
    }
}

/// Endless generated frames. The red channel of the top-left pixel carries
/// the frame number modulo 256 so tests can check ordering.
struct SyntheticReader {
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticReader {
    fn new() -> Self {
        Self {
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn next_image(&mut self) -> DynamicImage {
        self.frame_count += 1;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let (count, scene) = (self.frame_count, self.scene_state as u64);
        let mut image = RgbImage::from_fn(SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT, |x, y| {
            let v = ((x as u64 + y as u64 + count + scene) % 256) as u8;
            Rgb([v, v / 2, 255 - v])
        });
        image.put_pixel(0, 0, Rgb([(count % 256) as u8, 0, 0]));
        DynamicImage::ImageRgb8(image)
    }
}

/// Stills played in order. An undecodable still is an error for that slot
/// only; the next call moves on to the following file.
struct StillsReader {
    paths: Vec<PathBuf>,
    index: usize,
}

impl StillsReader {
    fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths, index: 0 }
    }

    fn next_image(&mut self) -> Result<Option<DynamicImage>> {
        let Some(path) = self.paths.get(self.index) else {
            return Ok(None);
        };
        self.index += 1;
        image::open(path)
            .map(Some)
            .with_context(|| format!("decode {}", path.display()))
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn probe_source(path: &Path) -> Result<FileSource> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("cannot open media path {}", path.display()))?;
    if metadata.is_dir() {
        let mut stills = Vec::new();
        for entry in std::fs::read_dir(path)
            .with_context(|| format!("read directory {}", path.display()))?
        {
            let entry_path = entry?.path();
            if entry_path.is_file() && is_still(&entry_path) {
                stills.push(entry_path);
            }
        }
        if stills.is_empty() {
            return Err(anyhow!("no images found in {}", path.display()));
        }
        stills.sort();
        return Ok(FileSource::Stills(stills));
    }
    if is_still(path) {
        return Ok(FileSource::Stills(vec![path.to_path_buf()]));
    }
    #[cfg(feature = "file-ffmpeg")]
    {
        FfmpegReader::open(&path.to_string_lossy())?;
        Ok(FileSource::Video)
    }
    #[cfg(not(feature = "file-ffmpeg"))]
    {
        Err(anyhow!(
            "video file {} requires the file-ffmpeg feature",
            path.display()
        ))
    }
}

fn is_still(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            STILL_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}
