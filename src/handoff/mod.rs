//! Handing the display and input to an external program and taking them back.
//!
//! The handoff is a fixed sequence of phases:
//!
//! ```text
//! Normal -> StoppingInternal -> DisplayReleased -> ExternalRunning
//!        -> DisplayReclaiming -> RenderContextReset -> Normal
//! ```
//!
//! The way back always runs to the end once the program exits. Every step on it is best-effort:
//! failures are logged and the next step runs anyway, since a degraded kiosk is better than a
//! stuck one. The external program touches the same CRTC and GPU context we use, so nothing is
//! assumed to have survived; each resource is explicitly reclaimed or rebuilt.

mod collaborators;
mod process;
mod session;

use std::process::ExitStatus;
use std::time::Duration;

pub use collaborators::{
    InputCollaborator, MediaCollaborator, NoMedia, RenderContextListener,
};
pub use process::{Launcher, ProcessLauncher};
pub use session::{HandoffSession, ProcessState};

use crate::backend::kms::{DisplayDevice, DisplayManager};
use crate::backend::present::{BufferPool, PresentationPipeline};
use crate::utils::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffPhase {
    Normal,
    StoppingInternal,
    DisplayReleased,
    ExternalRunning,
    DisplayReclaiming,
    RenderContextReset,
}

#[derive(Debug, Clone)]
pub struct HandoffSettings {
    pub disable_crtc: bool,
    /// Pause after the program exits before touching the display.
    pub settle: Duration,
    pub master_retries: u32,
    pub master_retry_delay: Duration,
    pub input_retries: u32,
    pub input_retry_delay: Duration,
    /// Synchronous frames after taking the display back.
    pub resync_frames: u32,
}

impl HandoffSettings {
    pub fn from_config(config: &marquee_config::Config) -> Self {
        let handoff = &config.handoff;
        Self {
            disable_crtc: handoff.disable_crtc,
            settle: handoff.settle(),
            master_retries: handoff.master_retries.max(1),
            master_retry_delay: handoff.master_retry_delay(),
            input_retries: handoff.input_retries.max(1),
            input_retry_delay: handoff.input_retry_delay(),
            resync_frames: config.presentation.resync_frames,
        }
    }
}

/// Everything a handoff acts on.
pub struct HandoffTargets<'a, D: DisplayDevice, P: BufferPool> {
    pub display: &'a mut DisplayManager<D>,
    pub pipeline: &'a mut PresentationPipeline<P>,
    pub media: &'a mut dyn MediaCollaborator,
    pub input: &'a mut dyn InputCollaborator,
    pub render_context: &'a mut dyn RenderContextListener,
}

/// Outcome of one handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffReport {
    pub exit_status: Option<ExitStatus>,
    pub master_attempts: u32,
    pub master_reacquired: bool,
    pub mode_restored: bool,
    pub input_restored: bool,
    pub phases: Vec<HandoffPhase>,
}

pub struct HandoffCoordinator<L = ProcessLauncher> {
    settings: HandoffSettings,
    launcher: L,
    phase: HandoffPhase,
}

impl<L: Launcher> HandoffCoordinator<L> {
    pub fn new(settings: HandoffSettings, launcher: L) -> Self {
        Self {
            settings,
            launcher,
            phase: HandoffPhase::Normal,
        }
    }

    pub fn phase(&self) -> HandoffPhase {
        self.phase
    }

    /// Runs `command` with the display and input handed over, then takes everything back.
    ///
    /// Blocks for as long as the program runs.
    pub fn run<D: DisplayDevice, P: BufferPool>(
        &mut self,
        command: &[String],
        mut targets: HandoffTargets<'_, D, P>,
    ) -> HandoffReport {
        let _span = tracy_client::span!("HandoffCoordinator::run");

        let mut session = HandoffSession::new();
        let mut report = HandoffReport {
            exit_status: None,
            master_attempts: 0,
            master_reacquired: false,
            mode_restored: false,
            input_restored: false,
            phases: vec![self.phase],
        };

        self.release(&mut session, &mut targets, &mut report);
        self.launch(command, &mut session, &mut report);
        self.reclaim(command, &mut session, &mut targets, &mut report);

        info!(
            "handoff done: exit status {:?}, master {}, mode {}, input {}",
            report.exit_status,
            if report.master_reacquired { "back" } else { "LOST" },
            if report.mode_restored { "restored" } else { "not restored" },
            if report.input_restored { "back" } else { "LOST" },
        );

        report
    }

    fn enter(&mut self, phase: HandoffPhase, report: &mut HandoffReport) {
        debug!("handoff: {:?} -> {phase:?}", self.phase);
        self.phase = phase;
        report.phases.push(phase);
    }

    fn release<D: DisplayDevice, P: BufferPool>(
        &mut self,
        session: &mut HandoffSession,
        targets: &mut HandoffTargets<'_, D, P>,
        report: &mut HandoffReport,
    ) {
        let _span = tracy_client::span!("HandoffCoordinator::release");

        self.enter(HandoffPhase::StoppingInternal, report);
        targets.media.stop_and_release();

        // The mode stays as it is: forcing one here breaks the next master on some drivers.
        match targets.display.drop_master(self.settings.disable_crtc) {
            Ok(()) => session.master_held = false,
            Err(err) => warn!("error dropping DRM master, the program may fail to start: {err:?}"),
        }
        self.enter(HandoffPhase::DisplayReleased, report);

        targets.input.release_grabs();
        session.input_grabbed = false;
        targets.input.wake();
    }

    fn launch(
        &mut self,
        command: &[String],
        session: &mut HandoffSession,
        report: &mut HandoffReport,
    ) {
        let _span = tracy_client::span!("HandoffCoordinator::launch");

        self.enter(HandoffPhase::ExternalRunning, report);
        session.process = ProcessState::Running;

        session.process = match self.launcher.run(command) {
            Ok(status) => {
                info!("{command:?} exited with {status}");
                ProcessState::Exited(status)
            }
            Err(err) => {
                warn!("error running {command:?}: {err:?}");
                ProcessState::FailedToStart
            }
        };
        report.exit_status = session.exit_status();
    }

    fn reclaim<D: DisplayDevice, P: BufferPool>(
        &mut self,
        command: &[String],
        session: &mut HandoffSession,
        targets: &mut HandoffTargets<'_, D, P>,
        report: &mut HandoffReport,
    ) {
        let _span = tracy_client::span!("HandoffCoordinator::reclaim");

        self.enter(HandoffPhase::DisplayReclaiming, report);

        let stray = self.launcher.kill_stray(command);
        if stray > 0 {
            warn!("killed {stray} leftover instance(s) of {command:?}");
        }

        // The previous master needs a moment to let go of its kernel resources.
        sleep(self.settings.settle);

        let retries = self.settings.master_retries;
        for attempt in 1..=retries {
            report.master_attempts = attempt;
            match targets.display.acquire_master() {
                Ok(()) => {
                    session.master_held = true;
                    break;
                }
                Err(err) => {
                    warn!("error reacquiring DRM master (attempt {attempt}/{retries}): {err:?}");
                    if attempt < retries {
                        sleep(self.settings.master_retry_delay);
                    }
                }
            }
        }
        report.master_reacquired = session.master_held;
        if !session.master_held {
            error!("could not reacquire DRM master, the display will likely stay dark");
        }

        match targets.display.reapply_mode() {
            Ok(mode) => {
                debug!("restored mode {}", mode.name);
                report.mode_restored = true;
            }
            Err(err) => warn!("error restoring mode after handoff: {err:?}"),
        }

        let retries = self.settings.input_retries;
        for attempt in 1..=retries {
            targets.input.wake();
            if targets.input.reinitialize() {
                session.input_grabbed = true;
                break;
            }

            warn!("error reinitializing input (attempt {attempt}/{retries})");
            if attempt < retries {
                sleep(self.settings.input_retry_delay);
            }
        }
        report.input_restored = session.input_grabbed;

        self.enter(HandoffPhase::RenderContextReset, report);
        targets.render_context.reset_render_context();
        targets
            .pipeline
            .force_resynchronize(targets.display, self.settings.resync_frames);

        if !targets.media.is_initialized() {
            if let Err(err) = targets.media.initialize() {
                warn!("error reinitializing media after handoff: {err:?}");
            }
        }

        self.enter(HandoffPhase::Normal, report);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::backend::present::PresentSettings;
    use crate::testing::{
        EventLog, FakeDevice, FakeInput, FakeLauncher, FakeMedia, FakePool, FakeRenderContext,
    };

    struct Harness {
        log: EventLog,
        display: DisplayManager<FakeDevice>,
        pipeline: PresentationPipeline<FakePool>,
        media: FakeMedia,
        input: FakeInput,
        render_context: FakeRenderContext,
        coordinator: HandoffCoordinator<FakeLauncher>,
    }

    impl Harness {
        fn new() -> Self {
            let log = EventLog::default();

            let device = FakeDevice::with_log(log.clone());
            let mut display = DisplayManager::new(device, PathBuf::from("/dev/dri/card0"));
            display.discover_topology().unwrap();
            display.set_mode(0, 0).unwrap();

            let pipeline = PresentationPipeline::new(
                FakePool::new(3),
                PresentSettings {
                    flip_timeout: Duration::from_millis(100),
                    cache_size: 4,
                    acquire_failure_limit: 5,
                    flip_summary_window: 100,
                    acquire_retry_delay: Duration::ZERO,
                },
            );

            let settings = HandoffSettings {
                disable_crtc: false,
                settle: Duration::ZERO,
                master_retries: 5,
                master_retry_delay: Duration::ZERO,
                input_retries: 3,
                input_retry_delay: Duration::ZERO,
                resync_frames: 10,
            };

            log.borrow_mut().clear();

            Self {
                media: FakeMedia::new(log.clone()),
                input: FakeInput::new(log.clone()),
                render_context: FakeRenderContext::new(log.clone()),
                coordinator: HandoffCoordinator::new(settings, FakeLauncher::new(log.clone())),
                log,
                display,
                pipeline,
            }
        }

        fn run(&mut self) -> HandoffReport {
            let command = vec![String::from("retroarch"), String::from("-f")];
            self.coordinator.run(
                &command,
                HandoffTargets {
                    display: &mut self.display,
                    pipeline: &mut self.pipeline,
                    media: &mut self.media,
                    input: &mut self.input,
                    render_context: &mut self.render_context,
                },
            )
        }
    }

    #[test]
    fn full_handoff_in_order() {
        let mut h = Harness::new();
        let report = h.run();

        assert!(report.exit_status.unwrap().success());
        assert_eq!(report.master_attempts, 1);
        assert!(report.master_reacquired);
        assert!(report.mode_restored);
        assert!(report.input_restored);
        assert_eq!(h.coordinator.phase(), HandoffPhase::Normal);

        insta::assert_debug_snapshot!(report.phases, @r"
        [
            Normal,
            StoppingInternal,
            DisplayReleased,
            ExternalRunning,
            DisplayReclaiming,
            RenderContextReset,
            Normal,
        ]
        ");

        assert_eq!(
            *h.log.borrow(),
            [
                "media stop_and_release",
                "release_master",
                "input release_grabs",
                "input wake",
                "launch retroarch -f",
                "kill_stray retroarch",
                "acquire_master",
                "set_crtc crtc=40 fb=90 mode=1920x1080",
                "input wake",
                "input reinitialize ok",
                "render_context reset",
                "media initialize",
            ]
        );
    }

    #[test]
    fn master_comes_back_on_fifth_attempt() {
        let mut h = Harness::new();
        h.display.device().fail_master(4);

        let report = h.run();

        assert_eq!(report.master_attempts, 5);
        assert!(report.master_reacquired);
        assert!(report.mode_restored);
        assert_eq!(report.phases.last(), Some(&HandoffPhase::Normal));
    }

    #[test]
    fn handoff_completes_without_master() {
        let mut h = Harness::new();
        h.display.device().fail_master(5);

        let report = h.run();

        assert_eq!(report.master_attempts, 5);
        assert!(!report.master_reacquired);
        assert!(!report.mode_restored);
        assert!(report.input_restored);
        assert_eq!(report.phases.last(), Some(&HandoffPhase::Normal));
        assert!(h.log.borrow().contains(&String::from("render_context reset")));
    }

    #[test]
    fn input_wakes_before_every_attempt() {
        let mut h = Harness::new();
        h.input.fail_reinitialize(2);

        let report = h.run();
        assert!(report.input_restored);

        let input: Vec<String> = h
            .log
            .borrow()
            .iter()
            .filter(|entry| entry.starts_with("input"))
            .cloned()
            .collect();
        assert_eq!(
            input,
            [
                "input release_grabs",
                "input wake",
                "input wake",
                "input reinitialize failed",
                "input wake",
                "input reinitialize failed",
                "input wake",
                "input reinitialize ok",
            ]
        );
    }

    #[test]
    fn input_gives_up_after_retries() {
        let mut h = Harness::new();
        h.input.fail_reinitialize(3);

        let report = h.run();
        assert!(!report.input_restored);
        assert_eq!(report.phases.last(), Some(&HandoffPhase::Normal));
    }

    #[test]
    fn reclaim_runs_when_program_fails_to_start() {
        let mut h = Harness::new();
        h.coordinator.launcher.fail_spawn = true;

        let report = h.run();
        assert_eq!(report.exit_status, None);
        assert!(report.master_reacquired);
        assert!(report.mode_restored);
    }

    #[test]
    fn pipeline_resynchronizes_after_handoff() {
        let mut h = Harness::new();
        for _ in 0..3 {
            h.pipeline.present_frame(&mut h.display);
        }
        assert!(!h.pipeline.state().first_frame);

        h.run();

        let state = h.pipeline.state();
        assert!(state.first_frame);
        assert_eq!(state.forced_sync_frames, 10);
        assert_eq!(state.flip_successes, 0);
    }

    #[test]
    fn media_left_alone_when_still_initialized() {
        let mut h = Harness::new();
        h.media.keep_initialized = true;

        h.run();
        assert!(!h.log.borrow().contains(&String::from("media initialize")));
    }
}
