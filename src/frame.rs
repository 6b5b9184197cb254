//! Frames and their freshness signal.
//!
//! - `FrameLifetime`: per-frame cancellation handle derived from the stream's
//!   governing scope. Retiring it marks the frame as superseded or consumed.
//! - `Frame`: decoded image plus its lifetime. Consumers check `is_retired()`
//!   before touching the payload and skip frames that are already stale.
//!
//! Retirement is advisory. A retired frame still owns its image; retirement
//! only tells a consumer that a newer frame exists (or that the payload was
//! already taken).

use std::time::Instant;

use image::DynamicImage;
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// FrameLifetime
// ----------------------------------------------------------------------------

/// Lifetime scope of a single frame.
///
/// Clones share the same underlying token: the producer keeps one clone to
/// retire the frame on supersession while the frame carries another.
#[derive(Clone, Debug)]
pub struct FrameLifetime {
    token: CancellationToken,
}

impl FrameLifetime {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Retire the lifetime. Idempotent.
    pub fn retire(&self) {
        self.token.cancel();
    }

    /// Non-blocking staleness check.
    pub fn is_retired(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One image sample with freshness metadata.
///
/// There is no `Clone`: the payload is moved out exactly once through
/// `into_image`, which also retires the frame.
pub struct Frame<I = DynamicImage> {
    image: I,
    sequence: u64,
    lifetime: FrameLifetime,
    deadline: Option<Instant>,
}

impl<I> Frame<I> {
    /// Wrap an image. `sequence` is producer-assigned and strictly increasing
    /// within one stream.
    pub fn new(image: I, sequence: u64, lifetime: FrameLifetime) -> Self {
        Self {
            image,
            sequence,
            lifetime,
            deadline: None,
        }
    }

    /// Attach a deadline after which the frame is considered overdue.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// True once the frame has been superseded, consumed, or its stream
    /// cancelled.
    pub fn is_retired(&self) -> bool {
        self.lifetime.is_retired()
    }

    /// Health signal only: the producer's cadence window for this frame has
    /// passed. An overdue frame that has not been superseded is still fresh.
    pub fn is_overdue(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// Handle for observing this frame's retirement without owning the frame.
    pub fn lifetime(&self) -> FrameLifetime {
        self.lifetime.clone()
    }

    /// Take the payload. Retires the frame as a side effect.
    pub fn into_image(self) -> I {
        self.lifetime.retire();
        self.image
    }
}

impl<I> std::fmt::Debug for Frame<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("retired", &self.is_retired())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
