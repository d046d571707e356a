//! Getting rendered buffers on screen.
//!
//! Each frame the [`PresentationPipeline`] gives back the buffer shown by the previous frame,
//! takes the newest rendered one from the [`BufferPool`], wraps it in a framebuffer (cached per
//! pool slot) and shows it. Right after startup or a handoff the framebuffer is committed with a
//! full mode set. Otherwise it is flipped at vblank and the pipeline waits a bounded time for the
//! kernel to confirm.

mod cache;
mod pool;
mod state;

use std::time::Duration;

use smithay::reexports::drm::control::framebuffer;

pub use cache::ScanoutCache;
pub use pool::{BufferId, BufferPool, DumbBufferPool, DumbSlot, PoolError};
pub use state::{FlipSummary, PresentationState};

use crate::backend::kms::{DisplayDevice, DisplayManager};
use crate::utils::sleep;

/// What happened to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameResult {
    /// No buffer was available, nothing was presented.
    Skipped,
    /// Shown with a synchronous mode set.
    Committed,
    /// Flipped, and the kernel confirmed the flip.
    Flipped,
    /// Flipped, but no confirmation arrived in time.
    FlipTimedOut,
    /// The flip was refused and the frame was committed synchronously instead.
    FellBack,
    /// The buffer couldn't be shown at all.
    Failed,
}

#[derive(Debug, Clone)]
pub struct PresentSettings {
    pub flip_timeout: Duration,
    pub cache_size: usize,
    pub acquire_failure_limit: u32,
    pub flip_summary_window: u32,
    /// Pause after a failed acquisition, giving the GPU time to free memory.
    pub acquire_retry_delay: Duration,
}

impl From<&marquee_config::Presentation> for PresentSettings {
    fn from(config: &marquee_config::Presentation) -> Self {
        Self {
            flip_timeout: config.flip_timeout(),
            cache_size: config.scanout_cache_size,
            acquire_failure_limit: config.acquire_failure_limit,
            flip_summary_window: config.flip_summary_window,
            acquire_retry_delay: Duration::from_millis(10),
        }
    }
}

pub struct PresentationPipeline<P: BufferPool> {
    pool: P,
    cache: ScanoutCache,
    state: PresentationState,
    /// Buffer presented last frame, released at the start of the next one.
    previous: Option<P::Buffer>,
    /// Pool slot whose framebuffer is on screen.
    displayed: Option<BufferId>,
    settings: PresentSettings,
}

impl<P: BufferPool> PresentationPipeline<P> {
    pub fn new(pool: P, settings: PresentSettings) -> Self {
        Self {
            pool,
            cache: ScanoutCache::new(settings.cache_size),
            state: PresentationState::default(),
            previous: None,
            displayed: None,
            settings,
        }
    }

    /// Shows the newest rendered buffer.
    ///
    /// Never fails: every problem is logged and reflected in the returned [`FrameResult`].
    pub fn present_frame<D: DisplayDevice>(
        &mut self,
        display: &mut DisplayManager<D>,
    ) -> FrameResult {
        let _span = tracy_client::span!("PresentationPipeline::present_frame");

        // Release before acquiring: the pool only has two or three slots.
        if let Some(previous) = self.previous.take() {
            self.pool.release(previous);
        }

        for fb in self.cache.evict_over(self.cache.capacity(), self.displayed) {
            display.remove_framebuffer(fb);
        }

        let buffer = match self.pool.acquire() {
            Ok(buffer) => {
                self.state.record_acquire_success();
                buffer
            }
            Err(err) => {
                self.on_acquire_failure(display, err);
                return FrameResult::Skipped;
            }
        };

        let id = self.pool.id(&buffer);
        let Some(fb) = self.framebuffer_for(display, id, &buffer) else {
            self.pool.release(buffer);
            return FrameResult::Failed;
        };

        let result = if self.state.take_sync_frame() {
            match display.commit(fb) {
                Ok(()) => FrameResult::Committed,
                Err(err) => {
                    warn!("error committing frame: {err:?}");
                    FrameResult::Failed
                }
            }
        } else {
            self.flip(display, fb)
        };

        if result != FrameResult::Failed {
            self.displayed = Some(id);
        }
        self.previous = Some(buffer);

        result
    }

    fn framebuffer_for<D: DisplayDevice>(
        &mut self,
        display: &mut DisplayManager<D>,
        id: BufferId,
        buffer: &P::Buffer,
    ) -> Option<framebuffer::Handle> {
        if let Some(fb) = self.cache.get(id) {
            return Some(fb);
        }

        for fb in self.cache.make_room(self.displayed) {
            display.remove_framebuffer(fb);
        }

        let source = self.pool.scanout_source(buffer);
        match display.add_framebuffer(&source) {
            Ok(fb) => {
                trace!("registered {fb:?} for {id:?}");
                self.cache.insert(id, fb);
                Some(fb)
            }
            Err(err) => {
                warn!("error creating framebuffer for {id:?}: {err:?}");
                None
            }
        }
    }

    fn flip<D: DisplayDevice>(
        &mut self,
        display: &mut DisplayManager<D>,
        fb: framebuffer::Handle,
    ) -> FrameResult {
        let ticket = match display.queue_flip(fb) {
            Ok(ticket) => ticket,
            Err(err) => {
                self.state.record_flip_failure();
                if self.state.flip_failures.is_power_of_two() {
                    warn!(
                        "error queueing flip ({} this window), committing instead: {err:?}",
                        self.state.flip_failures
                    );
                }

                return match display.commit(fb) {
                    Ok(()) => FrameResult::FellBack,
                    Err(err) => {
                        warn!("error committing frame after failed flip: {err:?}");
                        FrameResult::Failed
                    }
                };
            }
        };

        match display.wait_for_flip(ticket, self.settings.flip_timeout) {
            Ok(Some(event)) => {
                trace!("flip {} completed at {:?}", event.sequence, event.time);
                if let Some(summary) = self
                    .state
                    .record_flip_success(self.settings.flip_summary_window)
                {
                    if summary.failures > 0 {
                        info!(
                            "{} flip(s) failed over the last {} frames",
                            summary.failures, summary.successes
                        );
                    } else {
                        trace!("{} flips without failure", summary.successes);
                    }
                }
                FrameResult::Flipped
            }
            Ok(None) => {
                debug!(
                    "flip not confirmed within {:?}, moving on",
                    self.settings.flip_timeout
                );
                FrameResult::FlipTimedOut
            }
            Err(err) => {
                warn!("error waiting for flip: {err:?}");
                FrameResult::FlipTimedOut
            }
        }
    }

    /// Past the failure limit the whole scan-out cache goes, except the displayed framebuffer.
    fn on_acquire_failure<D: DisplayDevice>(
        &mut self,
        display: &mut DisplayManager<D>,
        err: PoolError,
    ) {
        let limit = self.settings.acquire_failure_limit;
        let failures = self.state.acquire_failures + 1;
        if failures.is_power_of_two() {
            warn!("error acquiring buffer ({failures} in a row): {err:?}");
        }

        if self.state.record_acquire_failure(limit) {
            warn!("buffer acquisition failed more than {limit} times, dropping scan-out cache");

            // The displayed framebuffer stays: removing it would switch the CRTC off.
            for fb in self.cache.evict_over(0, self.displayed) {
                display.remove_framebuffer(fb);
            }
            if let Some(previous) = self.previous.take() {
                self.pool.release(previous);
            }
        }

        sleep(self.settings.acquire_retry_delay);
    }

    /// Starts over after someone else had the display.
    ///
    /// The next `frames` frames (at least one) are committed synchronously, and every cached
    /// framebuffer is destroyed since the other master may have invalidated them.
    pub fn force_resynchronize<D: DisplayDevice>(
        &mut self,
        display: &mut DisplayManager<D>,
        frames: u32,
    ) {
        let _span = tracy_client::span!("PresentationPipeline::force_resynchronize");

        self.state.resynchronize(frames);

        for fb in self.cache.drain() {
            display.remove_framebuffer(fb);
        }
        self.displayed = None;

        if let Some(previous) = self.previous.take() {
            self.pool.release(previous);
        }

        debug!("resynchronizing, next {} frame(s) use mode sets", frames.max(1));
    }

    /// Tears down the pipeline's framebuffers and returns the pool.
    pub fn shutdown<D: DisplayDevice>(mut self, display: &mut DisplayManager<D>) -> P {
        if let Some(previous) = self.previous.take() {
            self.pool.release(previous);
        }

        for fb in self.cache.drain() {
            display.remove_framebuffer(fb);
        }

        self.pool
    }

    pub fn pool_mut(&mut self) -> &mut P {
        &mut self.pool
    }

    pub fn state(&self) -> &PresentationState {
        &self.state
    }

    pub fn set_acquire_retry_delay(&mut self, delay: Duration) {
        self.settings.acquire_retry_delay = delay;
    }
}
