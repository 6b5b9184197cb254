//! Bounded frame pipe between a device's acquisition loop and its consumer.
//!
//! `frame_pipe` returns the two halves:
//! - `FramePublisher` (producer): wraps images in frames and enforces the
//!   ordering rule that frame N is retired before frame N+1 enters the queue.
//! - `FrameStream` (consumer): FIFO iterator that ends once the publisher is
//!   closed or dropped.
//!
//! A full queue applies backpressure. The publisher waits for room instead of
//! dropping frames, re-checking the governing scope while it waits, so a
//! cancelled stream never wedges its producer thread.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::{Duration, Instant};

use crate::frame::{Frame, FrameLifetime};
use crate::scope::StreamScope;

/// Default queue depth. Small on purpose: staleness is handled by retirement,
/// so a deep queue only adds latency.
pub const DEFAULT_QUEUE_DEPTH: usize = 10;

/// How often a producer blocked on a full queue re-checks its scope.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(2);

/// Create a bounded pipe governed by `scope`.
pub fn frame_pipe<I>(
    scope: &StreamScope,
    depth: usize,
) -> (FramePublisher<I>, FrameStream<I>) {
    let (sender, receiver) = mpsc::sync_channel(depth.max(1));
    (
        FramePublisher {
            sender,
            scope: scope.clone(),
            current: None,
            next_sequence: 1,
            frame_window: None,
        },
        FrameStream { receiver },
    )
}

// ----------------------------------------------------------------------------
// Producer half
// ----------------------------------------------------------------------------

pub struct FramePublisher<I> {
    sender: SyncSender<Frame<I>>,
    scope: StreamScope,
    current: Option<FrameLifetime>,
    next_sequence: u64,
    frame_window: Option<Duration>,
}

impl<I> FramePublisher<I> {
    /// Give every published frame a deadline `window` after publication.
    pub fn with_frame_window(mut self, window: Duration) -> Self {
        self.frame_window = Some(window);
        self
    }

    pub fn scope(&self) -> &StreamScope {
        &self.scope
    }

    /// Number of frames handed to the queue so far.
    pub fn published(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Publish the next image.
    ///
    /// Retires the previously published frame before the new one is queued,
    /// then blocks while the queue is full. Fails once the scope is cancelled
    /// or the consumer has gone away; the producer should stop on error.
    pub fn publish(&mut self, image: I) -> Result<()> {
        if self.scope.is_cancelled() {
            return Err(anyhow!("stream scope cancelled"));
        }

        let lifetime = self.scope.frame_lifetime();
        let mut frame = Frame::new(image, self.next_sequence, lifetime.clone());
        if let Some(window) = self.frame_window {
            frame = frame.with_deadline(Instant::now() + window);
        }
        if let Some(previous) = self.current.replace(lifetime) {
            previous.retire();
        }
        self.next_sequence += 1;

        let mut pending = frame;
        loop {
            match self.sender.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(frame)) => {
                    if !self.scope.sleep(BACKPRESSURE_POLL) {
                        return Err(anyhow!("stream scope cancelled while queue was full"));
                    }
                    pending = frame;
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(anyhow!("frame stream consumer disconnected"));
                }
            }
        }
    }

    /// Retire the most recently published frame without publishing another.
    pub fn retire_current(&mut self) {
        if let Some(current) = self.current.take() {
            current.retire();
        }
    }

    /// Close the queue. The consumer drains what is queued, then its
    /// iteration ends.
    ///
    /// Closing is dropping the sender: once the publisher is gone nothing
    /// can be queued again, and a publisher dropped without `close` closes
    /// the queue the same way.
    pub fn close(self) {
        log::debug!(
            "frame pipe closed after {} frame(s)",
            self.published()
        );
    }
}

// ----------------------------------------------------------------------------
// Consumer half
// ----------------------------------------------------------------------------

pub struct FrameStream<I = image::DynamicImage> {
    receiver: Receiver<Frame<I>>,
}

impl<I> FrameStream<I> {
    /// Wait up to `timeout` for the next frame.
    ///
    /// `Ok(None)` means the wait timed out; `Err` means the stream is closed.
    pub fn next_timeout(&self, timeout: Duration) -> Result<Option<Frame<I>>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("frame stream closed")),
        }
    }
}

impl<I> Iterator for FrameStream<I> {
    type Item = Frame<I>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

// ----------------------------------------------------------------------------
// Cadence
// ----------------------------------------------------------------------------

/// Keeps an acquisition loop at or below its target frame rate.
#[derive(Clone, Debug)]
pub struct Pacer {
    interval: Duration,
    next_due: Option<Instant>,
}

impl Pacer {
    pub fn new(target_fps: u32) -> Self {
        Self {
            interval: frame_interval(target_fps),
            next_due: None,
        }
    }

    /// Sleep until the next slot. A loop that fell behind starts fresh from
    /// now instead of bursting to catch up.
    ///
    /// Returns `false` if the scope was cancelled while waiting.
    pub fn wait(&mut self, scope: &StreamScope) -> bool {
        let now = Instant::now();
        let due = match self.next_due {
            Some(due) if due > now => due,
            _ => now,
        };
        if !scope.sleep_until(due) {
            return false;
        }
        self.next_due = Some(due + self.interval);
        true
    }

    /// Non-blocking variant for sources that push faster than the target
    /// rate: true if a slot is due now (and claims it).
    pub fn admit(&mut self) -> bool {
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if now < due {
                return false;
            }
        }
        self.next_due = Some(now + self.interval);
        true
    }
}

pub fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_micros(1_000_000 / u64::from(target_fps))
    }
}
