//! Configuration for the marquee kiosk.
//!
//! The config is a KDL document with three sections: `display`, `presentation` and `handoff`.
//! Every field has a default, so an empty file (or no file at all) is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::{miette, Context, IntoDiagnostic};
use tracing::debug;

mod mode;

pub use mode::ModeSize;

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Config {
    #[knuffel(child, default)]
    pub display: Display,
    #[knuffel(child, default)]
    pub presentation: Presentation,
    #[knuffel(child, default)]
    pub handoff: Handoff,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Display {
    /// Candidate DRM devices, probed in order.
    #[knuffel(child, unwrap(arguments), default = default_devices())]
    pub devices: Vec<PathBuf>,
    /// Requested mode. `None` means the connector's preferred mode.
    #[knuffel(child, unwrap(argument))]
    pub mode: Option<ModeSize>,
    /// Sizes to try, in order, when the requested mode isn't offered by the connector.
    #[knuffel(child, unwrap(arguments), default = default_fallback_modes())]
    pub fallback_modes: Vec<ModeSize>,
    /// Put back the CRTC configuration found at startup when exiting.
    #[knuffel(child)]
    pub restore_mode_on_exit: bool,
}

impl Default for Display {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            mode: None,
            fallback_modes: default_fallback_modes(),
            restore_mode_on_exit: false,
        }
    }
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Presentation {
    #[knuffel(child, unwrap(argument), default = 100)]
    pub flip_timeout_ms: u64,
    /// Number of frames committed synchronously after taking the display back.
    #[knuffel(child, unwrap(argument), default = 10)]
    pub resync_frames: u32,
    #[knuffel(child, unwrap(argument), default = 4)]
    pub scanout_cache_size: usize,
    #[knuffel(child, unwrap(argument), default = 3)]
    pub buffers: usize,
    /// Consecutive buffer acquisition failures before the scan-out cache is dropped.
    #[knuffel(child, unwrap(argument), default = 5)]
    pub acquire_failure_limit: u32,
    /// Successful flips after which flip statistics are reported and reset.
    #[knuffel(child, unwrap(argument), default = 100)]
    pub flip_summary_window: u32,
}

impl Default for Presentation {
    fn default() -> Self {
        Self {
            flip_timeout_ms: 100,
            resync_frames: 10,
            scanout_cache_size: 4,
            buffers: 3,
            acquire_failure_limit: 5,
            flip_summary_window: 100,
        }
    }
}

impl Presentation {
    pub fn flip_timeout(&self) -> Duration {
        Duration::from_millis(self.flip_timeout_ms)
    }
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Handoff {
    /// Program and arguments of the external full-screen process.
    #[knuffel(child, unwrap(arguments), default)]
    pub command: Vec<String>,
    /// Disable the CRTC before dropping master.
    ///
    /// Off by default: on several drivers a disabled CRTC breaks the first frame of the process
    /// that takes over.
    #[knuffel(child)]
    pub disable_crtc: bool,
    #[knuffel(child, unwrap(argument), default = 1000)]
    pub settle_ms: u64,
    #[knuffel(child, unwrap(argument), default = 5)]
    pub master_retries: u32,
    #[knuffel(child, unwrap(argument), default = 500)]
    pub master_retry_delay_ms: u64,
    #[knuffel(child, unwrap(argument), default = 3)]
    pub input_retries: u32,
    #[knuffel(child, unwrap(argument), default = 200)]
    pub input_retry_delay_ms: u64,
}

impl Default for Handoff {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            disable_crtc: false,
            settle_ms: 1000,
            master_retries: 5,
            master_retry_delay_ms: 500,
            input_retries: 3,
            input_retry_delay_ms: 200,
        }
    }
}

impl Handoff {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn master_retry_delay(&self) -> Duration {
        Duration::from_millis(self.master_retry_delay_ms)
    }

    pub fn input_retry_delay(&self) -> Duration {
        Duration::from_millis(self.input_retry_delay_ms)
    }
}

fn default_devices() -> Vec<PathBuf> {
    (0..3)
        .map(|i| PathBuf::from(format!("/dev/dri/card{i}")))
        .collect()
}

fn default_fallback_modes() -> Vec<ModeSize> {
    vec![ModeSize::new(1920, 1080), ModeSize::new(1280, 720)]
}

impl Config {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let _span = tracy_client::span!("Config::load");

        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("config.kdl");

        let config = Self::parse(filename, &contents).context("error parsing")?;
        config.validate()?;

        debug!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        let _span = tracy_client::span!("Config::parse");
        knuffel::parse(filename, text)
    }

    /// Checks the constraints knuffel can't express.
    pub fn validate(&self) -> miette::Result<()> {
        let presentation = &self.presentation;

        if !(2..=3).contains(&presentation.buffers) {
            return Err(miette!(
                "presentation.buffers must be 2 or 3, got {}",
                presentation.buffers
            ));
        }

        if presentation.scanout_cache_size < 2 {
            return Err(miette!(
                "presentation.scanout-cache-size must be at least 2, got {}",
                presentation.scanout_cache_size
            ));
        }

        if presentation.flip_timeout_ms == 0 {
            return Err(miette!("presentation.flip-timeout-ms must be non-zero"));
        }

        Ok(())
    }
}
