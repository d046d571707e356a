//! Pure helper functions for the KMS backend.
//!
//! Stateless computations over modes and topology records, kept apart from the ioctl plumbing
//! so they can be tested without hardware.

use std::time::Duration;

use smithay::reexports::drm::control::{self, connector, crtc, ModeFlags};

use super::types::{ConnectorInfo, DisplayMode, EncoderInfo};

/// Kernel drivers that only do rendering and have no display engine.
///
/// Some SoCs (the Raspberry Pi among them) expose the GPU and the display controller as two
/// separate cards, and the render-only one tends to come first.
pub(super) const RENDER_ONLY_DRIVERS: &[&str] =
    &["v3d", "etnaviv", "lima", "panfrost", "panthor", "vgem", "asahi"];

pub(super) fn is_render_only_driver(driver: &str) -> bool {
    RENDER_ONLY_DRIVERS.contains(&driver)
}

pub fn format_connector_name(interface: connector::Interface, id: u32) -> String {
    format!("{}-{id}", interface.as_str())
}

// =============================================================================
// Mode Calculations
// =============================================================================

/// Calculate the refresh interval from a DRM mode.
pub fn refresh_interval(mode: control::Mode) -> Duration {
    let clock = mode.clock() as u64;
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;

    let mut numerator = htotal * vtotal * 1_000_000;
    let mut denominator = clock;

    if mode.flags().contains(ModeFlags::INTERLACE) {
        denominator *= 2;
    }

    if mode.flags().contains(ModeFlags::DBLSCAN) {
        numerator *= 2;
    }

    if mode.vscan() > 1 {
        numerator *= mode.vscan() as u64;
    }

    if denominator == 0 {
        return Duration::ZERO;
    }

    let refresh_interval = (numerator + denominator / 2) / denominator;
    Duration::from_nanos(refresh_interval)
}

/// Refresh rate in millihertz, or 0 when the timings are unusable.
pub(crate) fn refresh_mhz(mode: control::Mode) -> u32 {
    let interval = refresh_interval(mode).as_nanos();
    if interval == 0 {
        return 0;
    }

    let mhz = (1_000_000_000_000u128 + interval / 2) / interval;
    u32::try_from(mhz).unwrap_or(u32::MAX)
}

/// Pick a mode from a connector's list.
///
/// `(0, 0)` means "whatever the display wants": the preferred mode, or the first listed one if
/// none is marked preferred. Any other size must match exactly; among several matches the
/// highest refresh rate wins.
pub(super) fn pick_mode(modes: &[DisplayMode], width: u16, height: u16) -> Option<&DisplayMode> {
    if width == 0 && height == 0 {
        return modes.iter().find(|m| m.preferred).or_else(|| modes.first());
    }

    let mut mode: Option<&DisplayMode> = None;
    for m in modes {
        if m.size() != (width, height) {
            continue;
        }

        // Interlaced modes don't appear to work.
        if m.is_interlaced() {
            continue;
        }

        match mode {
            Some(curr) if curr.refresh_mhz >= m.refresh_mhz => (),
            _ => mode = Some(m),
        }
    }

    mode
}

/// Pick the connector to drive: the first connected one that offers any mode.
pub(super) fn pick_connector(connectors: &[ConnectorInfo]) -> Option<&ConnectorInfo> {
    connectors
        .iter()
        .find(|conn| conn.connected && !conn.modes.is_empty())
}

/// Resolve a CRTC for an encoder.
///
/// The CRTC currently bound to the encoder wins; otherwise the first CRTC the encoder declares
/// compatible.
pub(super) fn crtc_for_encoder(encoder: &EncoderInfo) -> Option<crtc::Handle> {
    encoder
        .crtc
        .or_else(|| encoder.possible_crtcs.first().copied())
}
