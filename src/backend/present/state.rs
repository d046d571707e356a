use serde::{Deserialize, Serialize};

/// Counters the pipeline carries from frame to frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationState {
    /// No frame has been presented since startup or the last reset.
    pub first_frame: bool,
    /// Frames that still have to be committed synchronously.
    pub forced_sync_frames: u32,
    /// Consecutive failures to get a buffer from the pool.
    pub acquire_failures: u32,
    /// Flips that completed since the last summary.
    pub flip_successes: u32,
    /// Flips that failed to submit since the last summary.
    pub flip_failures: u32,
}

impl Default for PresentationState {
    fn default() -> Self {
        Self {
            first_frame: true,
            forced_sync_frames: 0,
            acquire_failures: 0,
            flip_successes: 0,
            flip_failures: 0,
        }
    }
}

/// Flip statistics over one reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipSummary {
    pub successes: u32,
    pub failures: u32,
}

impl PresentationState {
    /// Whether the next frame must be committed synchronously. Consumes one forced frame.
    pub fn take_sync_frame(&mut self) -> bool {
        let first = std::mem::replace(&mut self.first_frame, false);
        let forced = self.forced_sync_frames > 0;
        self.forced_sync_frames = self.forced_sync_frames.saturating_sub(1);
        first || forced
    }

    /// Counts a failed acquisition. Returns `true` when `limit` is exceeded and the counter was
    /// reset, at which point the caller should drop its cached scan-out state.
    pub fn record_acquire_failure(&mut self, limit: u32) -> bool {
        self.acquire_failures += 1;
        if self.acquire_failures > limit {
            self.acquire_failures = 0;
            return true;
        }
        false
    }

    pub fn record_acquire_success(&mut self) {
        self.acquire_failures = 0;
    }

    /// Counts a completed flip. Once `window` flips succeeded, returns the window's summary and
    /// resets both flip counters.
    pub fn record_flip_success(&mut self, window: u32) -> Option<FlipSummary> {
        self.flip_successes += 1;
        if self.flip_successes < window {
            return None;
        }

        let summary = FlipSummary {
            successes: self.flip_successes,
            failures: self.flip_failures,
        };
        self.flip_successes = 0;
        self.flip_failures = 0;
        Some(summary)
    }

    pub fn record_flip_failure(&mut self) {
        self.flip_failures = self.flip_failures.saturating_add(1);
    }

    /// Back to a fresh start with `frames` synchronous commits ahead.
    pub fn resynchronize(&mut self, frames: u32) {
        *self = Self {
            forced_sync_frames: frames,
            ..Self::default()
        };
    }
}
