//! Type definitions for the KMS display backend.
//!
//! Plain-data views of the DRM objects the display manager works with. They are built from the
//! kernel's answers by [`DrmCard`](super::DrmCard) and consumed by everything else, so the mode
//! and topology logic never touches an ioctl directly.

use std::io;
use std::time::Duration;

use smithay::reexports::drm::buffer::{self, DrmFourcc};
use smithay::reexports::drm::control::{self, connector, crtc, encoder, framebuffer, ModeTypeFlags};

use super::helpers::refresh_mhz;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    #[error("no usable display device among {tried} candidate(s)")]
    NoDisplayDevice { tried: usize },
    #[error("no connected connector with at least one mode")]
    NoConnector,
    #[error("no CRTC reachable from connector {connector}")]
    NoCrtc { connector: String },
    #[error("error setting mode {width}x{height}")]
    ModeSet {
        width: u16,
        height: u16,
        #[source]
        source: Option<io::Error>,
    },
    #[error("error acquiring DRM master")]
    MasterAcquire(#[source] io::Error),
    #[error("DRM ioctl failed")]
    Io(#[from] io::Error),
}

// =============================================================================
// Modes
// =============================================================================

/// A video mode offered by a connector.
#[derive(Debug, Clone)]
pub struct DisplayMode {
    pub width: u16,
    pub height: u16,
    /// Refresh rate in millihertz.
    pub refresh_mhz: u32,
    pub name: String,
    pub preferred: bool,
    pub drm: control::Mode,
}

impl DisplayMode {
    pub fn size(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    pub fn is_interlaced(&self) -> bool {
        self.drm.flags().contains(control::ModeFlags::INTERLACE)
    }
}

impl From<control::Mode> for DisplayMode {
    fn from(mode: control::Mode) -> Self {
        let (width, height) = mode.size();
        Self {
            width,
            height,
            refresh_mhz: refresh_mhz(mode),
            name: mode.name().to_string_lossy().into_owned(),
            preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
            drm: mode,
        }
    }
}

impl PartialEq for DisplayMode {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.refresh_mhz == other.refresh_mhz
            && self.name == other.name
    }
}

// =============================================================================
// Topology
// =============================================================================

#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub handle: connector::Handle,
    /// Name like `HDMI-A-1`.
    pub name: String,
    pub connected: bool,
    pub modes: Vec<control::Mode>,
    pub current_encoder: Option<encoder::Handle>,
    pub encoders: Vec<encoder::Handle>,
}

#[derive(Debug, Clone)]
pub struct EncoderInfo {
    pub handle: encoder::Handle,
    /// The CRTC currently driving this encoder, if any.
    pub crtc: Option<crtc::Handle>,
    /// CRTCs the encoder declares itself compatible with.
    pub possible_crtcs: Vec<crtc::Handle>,
}

/// Snapshot of a CRTC's configuration.
#[derive(Debug, Clone)]
pub struct CrtcState {
    pub handle: crtc::Handle,
    pub framebuffer: Option<framebuffer::Handle>,
    pub mode: Option<control::Mode>,
    pub position: (u32, u32),
}

/// The display path chosen at startup.
///
/// Stays fixed until the display manager is reinitialized.
#[derive(Debug, Clone)]
pub struct DisplayTopology {
    pub connector: connector::Handle,
    pub connector_name: String,
    pub encoder: encoder::Handle,
    pub crtc: crtc::Handle,
    /// The CRTC as we found it, for restoring on exit.
    pub saved_crtc: CrtcState,
    pub modes: Vec<DisplayMode>,
}

// =============================================================================
// Scan-out
// =============================================================================

/// Everything the kernel needs to wrap a buffer into a framebuffer.
#[derive(Debug, Clone, Copy)]
pub struct ScanoutSource {
    pub size: (u32, u32),
    pub format: DrmFourcc,
    pub pitch: u32,
    pub handle: buffer::Handle,
}

impl ScanoutSource {
    /// Legacy `(depth, bpp)` pair for `ADDFB`.
    pub fn depth_bpp(&self) -> (u32, u32) {
        match self.format {
            DrmFourcc::Argb8888 | DrmFourcc::Abgr8888 => (32, 32),
            DrmFourcc::Rgb565 => (16, 16),
            _ => (24, 32),
        }
    }
}

impl buffer::Buffer for ScanoutSource {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn pitch(&self) -> u32 {
        self.pitch
    }

    fn handle(&self) -> buffer::Handle {
        self.handle
    }
}

/// Completion of a page flip, as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub sequence: u32,
    pub time: Duration,
}

/// Handle for one page flip submission.
///
/// Tickets are numbered in submission order so completions that arrive late (after a timed-out
/// wait) are never credited to a newer flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlipTicket(pub(super) u64);
