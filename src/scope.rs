//! Governing cancellation scopes.
//!
//! A `StreamScope` bounds the lifetime of one stream session. Everything the
//! session spawns (the acquisition thread, the frame lifetimes it hands out,
//! child sessions) hangs off the same token, so a single `cancel()` stops the
//! producer at its next poll point and retires every outstanding frame.
//!
//! Producers run on plain OS threads, so waiting on a scope is done by
//! polling `is_cancelled()` in short slices rather than awaiting a future.
//! Blocking reads are bound to a scope with `StreamScope::bind_reader`.

use std::io::{self, Read};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::frame::FrameLifetime;

/// Upper bound on how long a cancel-aware sleep goes without re-checking
/// the scope.
pub const CANCEL_POLL: Duration = Duration::from_millis(5);

/// Cancellation scope governing a stream session.
///
/// Cloning yields another handle to the same scope. `child()` derives a
/// scope that is cancelled together with this one but can also be cancelled
/// on its own.
#[derive(Clone, Debug, Default)]
pub struct StreamScope {
    token: CancellationToken,
}

impl StreamScope {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Derive a scope that ends when either it or `self` is cancelled.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Derive a fresh per-frame lifetime from this scope.
    pub fn frame_lifetime(&self) -> FrameLifetime {
        FrameLifetime::new(self.token.child_token())
    }

    /// Cancel the scope. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Sleep for `duration` unless the scope is cancelled first.
    ///
    /// Returns `false` if the scope was (or became) cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration)
    }

    /// Sleep until `deadline` unless the scope is cancelled first.
    ///
    /// Returns `false` if the scope was (or became) cancelled.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }

    /// Wrap `reader` so every read fails once this scope is cancelled.
    ///
    /// Each underlying read is still bounded by its own timeout; this only
    /// stops a peer that keeps a read loop alive by sending a little at a time.
    pub fn bind_reader<R: Read>(&self, reader: R) -> ScopedReader<R> {
        ScopedReader {
            inner: reader,
            scope: self.clone(),
        }
    }
}

/// Reader that refuses to continue after its scope is cancelled.
pub struct ScopedReader<R> {
    inner: R,
    scope: StreamScope,
}

impl<R: Read> Read for ScopedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.scope.is_cancelled() {
            // Not `Interrupted`: `read_exact` retries on that.
            return Err(io::Error::new(io::ErrorKind::Other, "stream scope cancelled"));
        }
        self.inner.read(buf)
    }
}
