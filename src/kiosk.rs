//! The main loop.
//!
//! Everything runs on one thread. Each iteration drains signals and input, draws the next frame
//! and presents it; the flip wait paces the loop to the display. A handoff blocks the loop for as
//! long as the external program runs.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use calloop::signals::{Signal, Signals};
use calloop::EventLoop;
use marquee_config::Config;
use sd_notify::NotifyState;

use crate::backend::kms::DisplayManager;
use crate::backend::present::{DumbBufferPool, FrameResult, PresentSettings, PresentationPipeline};
use crate::handoff::{
    HandoffCoordinator, HandoffSettings, HandoffTargets, MediaCollaborator, NoMedia,
    ProcessLauncher, RenderContextListener,
};
use crate::input::{KioskAction, LibinputInput};
use crate::utils::sleep;

const SEAT: &str = "seat0";

/// How often to try getting master back when a handoff ended without it.
const MASTER_RECOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// Idle time when nothing could be shown, so a lost display doesn't spin the CPU.
const IDLE_DELAY: Duration = Duration::from_millis(16);

#[derive(Debug, Default)]
struct LoopState {
    stop: bool,
}

pub struct Kiosk {
    config: Config,
    display: DisplayManager,
    pipeline: PresentationPipeline<DumbBufferPool>,
    input: LibinputInput,
    media: Box<dyn MediaCollaborator>,
    test_card: TestCard,
    coordinator: HandoffCoordinator,
    event_loop: EventLoop<'static, LoopState>,
    state: LoopState,
    last_master_attempt: Option<Instant>,
}

impl Kiosk {
    /// Claims the display and input and sets the initial mode.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("Kiosk::new");

        let mut display = DisplayManager::open(&config.display.devices)
            .context("error opening a display device")?;
        let topology = display
            .discover_topology()
            .context("error discovering the display topology")?;
        let connector_name = topology.connector_name.clone();

        let requested = config.display.mode.map(|mode| (mode.width, mode.height));
        let fallbacks: Vec<_> = config
            .display
            .fallback_modes
            .iter()
            .map(|mode| (mode.width, mode.height))
            .collect();
        let mode = display
            .set_mode_with_fallback(requested, &fallbacks)
            .context("error setting the initial mode")?
            .clone();
        let path = display.path();
        info!(
            "driving {connector_name} on {:?} at {} ({}.{:03} Hz)",
            path,
            mode.name,
            mode.refresh_mhz / 1000,
            mode.refresh_mhz % 1000,
        );
        let size = (u32::from(mode.width), u32::from(mode.height));

        let pool = DumbBufferPool::new(display.device(), size, config.presentation.buffers)?;
        let pipeline =
            PresentationPipeline::new(pool, PresentSettings::from(&config.presentation));

        let input = LibinputInput::new(SEAT).context("error initializing input")?;

        let event_loop: EventLoop<'static, LoopState> =
            EventLoop::try_new().context("error creating the event loop")?;
        let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])
            .context("error creating the signal source")?;
        event_loop
            .handle()
            .insert_source(signals, |event, _, state| {
                info!("received {:?}, shutting down", event.signal());
                state.stop = true;
            })
            .map_err(|err| anyhow!("error inserting the signal source: {}", err.error))?;

        let coordinator =
            HandoffCoordinator::new(HandoffSettings::from_config(&config), ProcessLauncher);

        if let Err(err) = sd_notify::notify(false, &[NotifyState::Ready]) {
            warn!("error notifying systemd: {err:?}");
        }

        Ok(Self {
            config,
            display,
            pipeline,
            input,
            media: Box::new(NoMedia),
            test_card: TestCard::new(),
            coordinator,
            event_loop,
            state: LoopState::default(),
            last_master_attempt: None,
        })
    }

    /// Runs until a signal or the quit key arrives, then lets go of the display.
    pub fn run(mut self, launch_now: bool) -> anyhow::Result<()> {
        if launch_now {
            self.launch_external();
        }

        while !self.state.stop {
            let _span = tracy_client::span!("Kiosk::iteration");

            self.event_loop
                .dispatch(Some(Duration::ZERO), &mut self.state)
                .context("error dispatching the event loop")?;

            self.media.poll();

            for action in self.input.dispatch() {
                match action {
                    KioskAction::Launch => {
                        self.launch_external();
                        break;
                    }
                    KioskAction::Quit => {
                        info!("quit requested");
                        self.state.stop = true;
                        break;
                    }
                }
            }
            if self.state.stop {
                break;
            }

            if !self.display.is_master() && !self.recover_master() {
                sleep(IDLE_DELAY);
                continue;
            }

            self.render();
            if self.pipeline.present_frame(&mut self.display) == FrameResult::Failed {
                sleep(IDLE_DELAY);
            }
        }

        self.shutdown();
        Ok(())
    }

    fn render(&mut self) {
        let test_card = &mut self.test_card;
        let result = self
            .pipeline
            .pool_mut()
            .draw(self.display.device(), |pixels, pitch, size| {
                test_card.draw(pixels, pitch, size)
            });

        if let Err(err) = result {
            trace!("error drawing frame: {err:?}");
        }
    }

    fn launch_external(&mut self) {
        let command = &self.config.handoff.command;
        if command.is_empty() {
            warn!("no handoff command configured");
            return;
        }

        match serde_json::to_string(self.pipeline.state()) {
            Ok(json) => debug!("presentation state before handoff: {json}"),
            Err(err) => debug!("error serializing presentation state: {err:?}"),
        }

        let report = self.coordinator.run(
            command,
            HandoffTargets {
                display: &mut self.display,
                pipeline: &mut self.pipeline,
                media: self.media.as_mut(),
                input: &mut self.input,
                render_context: &mut self.test_card,
            },
        );

        if !report.master_reacquired {
            error!(
                "DRM master still lost after {} attempts, will keep trying",
                report.master_attempts
            );
            self.last_master_attempt = Some(Instant::now());
        }
    }

    /// Retries taking master back at a slow pace. Returns whether we hold it now.
    fn recover_master(&mut self) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_master_attempt {
            if now.duration_since(last) < MASTER_RECOVERY_INTERVAL {
                return false;
            }
        }
        self.last_master_attempt = Some(now);

        if let Err(err) = self.display.acquire_master() {
            trace!("error reacquiring DRM master: {err:?}");
            return false;
        }

        info!("got DRM master back");
        if let Err(err) = self.display.reapply_mode() {
            warn!("error restoring the mode: {err:?}");
        }
        self.pipeline
            .force_resynchronize(&mut self.display, self.config.presentation.resync_frames);
        self.test_card.reset_render_context();
        true
    }

    fn shutdown(self) {
        let _span = tracy_client::span!("Kiosk::shutdown");

        let Self {
            config,
            mut display,
            pipeline,
            mut media,
            ..
        } = self;

        media.stop_and_release();
        let pool = pipeline.shutdown(&mut display);
        pool.destroy(display.device());
        display.close(config.display.restore_mode_on_exit);
    }
}

/// SMPTE-style color bars with a white band sweeping down, so a stalled display is obvious.
const BARS: [u32; 8] = [
    0x00c0c0c0, 0x00c0c000, 0x0000c0c0, 0x0000c000, 0x00c000c0, 0x00c00000, 0x000000c0, 0x00101010,
];
const BAND: u32 = 0x00ffffff;
const BAND_HEIGHT: u32 = 8;
const BAND_SPEED: u64 = 4;

/// The built-in renderer.
#[derive(Debug, Default)]
pub struct TestCard {
    frame: u64,
}

impl TestCard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws one frame into XRGB8888 `pixels` with rows `pitch` bytes apart.
    pub fn draw(&mut self, pixels: &mut [u8], pitch: u32, (width, height): (u32, u32)) {
        let _span = tracy_client::span!("TestCard::draw");

        if width == 0 {
            return;
        }

        let travel = u64::from(height.saturating_sub(BAND_HEIGHT)).max(1);
        let band_top = (self.frame.wrapping_mul(BAND_SPEED) % travel) as u32;
        let band = band_top..band_top + BAND_HEIGHT;

        for y in 0..height {
            let start = y as usize * pitch as usize;
            let Some(row) = pixels.get_mut(start..start + width as usize * 4) else {
                break;
            };

            for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
                let color = if band.contains(&y) {
                    BAND
                } else {
                    BARS[x * BARS.len() / width as usize]
                };
                pixel.copy_from_slice(&color.to_le_bytes());
            }
        }

        self.frame = self.frame.wrapping_add(1);
    }
}

impl RenderContextListener for TestCard {
    fn reset_render_context(&mut self) {
        // Nothing lives on the GPU, restarting the sweep is enough.
        self.frame = 0;
        debug!("test card reset");
    }
}
