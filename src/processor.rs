//! Frame consumer.
//!
//! `FrameProcessor` drains a `FrameStream` and hands fresh images to named
//! sinks. Frames that were retired before the processor got to them are
//! dropped without touching their payload; this is how a processor that
//! fell behind catches up instead of rendering stale images.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::thread::JoinHandle;

use crate::pipe::FrameStream;

/// Sink name for the unprocessed camera view.
pub const STREAM_ORIGINAL: &str = "original";

pub type Sink<I> = Box<dyn FnMut(&I) + Send>;

/// Named output callbacks, supplied per stream session.
pub struct Sinks<I = image::DynamicImage> {
    entries: HashMap<String, Sink<I>>,
}

impl<I> Default for Sinks<I> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<I> Sinks<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sink` under `name`, replacing any previous sink of that name.
    pub fn with(
        mut self,
        name: impl Into<String>,
        sink: impl FnMut(&I) + Send + 'static,
    ) -> Self {
        self.entries.insert(name.into(), Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn dispatch(&mut self, image: &I) {
        for sink in self.entries.values_mut() {
            sink(image);
        }
    }
}

/// Counters reported when a processor finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Frames whose payload reached the sinks.
    pub processed: u64,
    /// Frames discarded because they were already retired.
    pub skipped: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FrameProcessor;

impl FrameProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Consume `stream` on the calling thread until it closes.
    pub fn run<I>(&self, stream: FrameStream<I>, mut sinks: Sinks<I>) -> ProcessorStats {
        let mut stats = ProcessorStats::default();
        for frame in stream {
            if frame.is_retired() {
                stats.skipped += 1;
                continue;
            }
            if frame.is_overdue() {
                log::trace!("frame {} is past its cadence window", frame.sequence());
            }
            let image = frame.into_image();
            sinks.dispatch(&image);
            stats.processed += 1;
        }
        log::debug!(
            "frame processor finished: {} processed, {} skipped",
            stats.processed,
            stats.skipped
        );
        stats
    }

    /// Consume `stream` on a dedicated thread.
    pub fn launch<I: Send + 'static>(
        self,
        stream: FrameStream<I>,
        sinks: Sinks<I>,
    ) -> Result<JoinHandle<ProcessorStats>> {
        std::thread::Builder::new()
            .name("frame-processor".to_string())
            .spawn(move || self.run(stream, sinks))
            .context("spawn frame processor thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::frame_pipe;
    use crate::scope::StreamScope;
    use std::sync::{Arc, Mutex};

    #[test]
    fn retired_frames_never_reach_sinks() -> Result<()> {
        let scope = StreamScope::new();
        let (mut publisher, stream) = frame_pipe::<u32>(&scope, 8);
        for value in 1..=5 {
            publisher.publish(value)?;
        }
        publisher.close();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sinks = Sinks::new().with(STREAM_ORIGINAL, move |value: &u32| {
            sink_seen.lock().expect("sink lock").push(*value);
        });

        let stats = FrameProcessor::new().run(stream, sinks);
        // Every frame but the newest was superseded before the processor ran.
        assert_eq!(stats, ProcessorStats { processed: 1, skipped: 4 });
        assert_eq!(*seen.lock().expect("sink lock"), vec![5]);
        Ok(())
    }

    #[test]
    fn every_sink_receives_the_image() -> Result<()> {
        let scope = StreamScope::new();
        let (mut publisher, stream) = frame_pipe::<u32>(&scope, 2);
        publisher.publish(9)?;
        publisher.close();

        let total = Arc::new(Mutex::new(0u32));
        let (a, b) = (total.clone(), total.clone());
        let sinks = Sinks::new()
            .with("a", move |v: &u32| *a.lock().expect("lock") += *v)
            .with("b", move |v: &u32| *b.lock().expect("lock") += *v);
        assert_eq!(sinks.len(), 2);
        let mut names: Vec<&str> = sinks.names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["a", "b"]);

        let stats = FrameProcessor::new()
            .launch(stream, sinks)?
            .join()
            .expect("processor thread");
        assert_eq!(stats.processed, 1);
        assert_eq!(*total.lock().expect("lock"), 18);
        Ok(())
    }
}
