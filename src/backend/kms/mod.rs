//! Bare KMS display backend.
//!
//! [`DisplayManager`] owns the DRM card: it claims master, picks the connector, encoder and CRTC
//! to drive, sets the mode and keeps track of the framebuffer on screen. It can give master away
//! and take it back without closing the device, which is what the handoff relies on.
//!
//! The manager is generic over [`DisplayDevice`] so mode and topology logic can be exercised
//! without hardware.

mod device;
mod helpers;
mod types;

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use smithay::reexports::drm::control::{connector, crtc, framebuffer};

pub use device::{DisplayDevice, DrmCard};
pub use helpers::{format_connector_name, refresh_interval};
pub use types::{
    ConnectorInfo, CrtcState, DisplayError, DisplayMode, DisplayTopology, EncoderInfo, FlipEvent,
    FlipTicket, ScanoutSource,
};
use helpers::{crtc_for_encoder, is_render_only_driver, pick_connector, pick_mode};

pub struct DisplayManager<D = DrmCard> {
    device: D,
    path: PathBuf,
    topology: Option<DisplayTopology>,
    mode: Option<DisplayMode>,
    /// Framebuffer last handed to the CRTC, used as the placeholder for mode sets.
    scanout_fb: Option<framebuffer::Handle>,
    master: bool,
    flips_submitted: u64,
    flips_completed: u64,
    last_flip: Option<FlipEvent>,
}

impl DisplayManager<DrmCard> {
    /// Opens the first candidate that is a display controller and lets us become master.
    pub fn open(candidates: &[PathBuf]) -> Result<Self, DisplayError> {
        Self::open_with(candidates, DrmCard::open)
    }
}

impl<D: DisplayDevice> DisplayManager<D> {
    pub fn open_with(
        candidates: &[PathBuf],
        mut open: impl FnMut(&Path) -> io::Result<D>,
    ) -> Result<Self, DisplayError> {
        let _span = tracy_client::span!("DisplayManager::open");

        for path in candidates {
            let device = match open(path) {
                Ok(device) => device,
                Err(err) => {
                    debug!("error opening {path:?}: {err:?}");
                    continue;
                }
            };

            match device.driver_name() {
                Ok(driver) if is_render_only_driver(&driver) => {
                    debug!("skipping {path:?}: {driver} has no display engine");
                    continue;
                }
                Ok(driver) => debug!("{path:?} is driven by {driver}"),
                Err(err) => debug!("error querying driver of {path:?}: {err:?}"),
            }

            if let Err(err) = device.acquire_master() {
                warn!("error becoming DRM master on {path:?}: {err:?}");
                continue;
            }

            info!("using display device {path:?}");
            return Ok(Self::new(device, path.clone()));
        }

        Err(DisplayError::NoDisplayDevice {
            tried: candidates.len(),
        })
    }

    /// Wraps an already opened device on which master is held.
    pub fn new(device: D, path: PathBuf) -> Self {
        Self {
            device,
            path,
            topology: None,
            mode: None,
            scanout_fb: None,
            master: true,
            flips_submitted: 0,
            flips_completed: 0,
            last_flip: None,
        }
    }

    // === Topology ===

    /// Picks the connector, encoder and CRTC to drive and saves the CRTC's current state.
    pub fn discover_topology(&mut self) -> Result<&DisplayTopology, DisplayError> {
        let _span = tracy_client::span!("DisplayManager::discover_topology");

        let connectors = self.device.connectors()?;
        for conn in &connectors {
            trace!(
                "connector {}: connected={}, {} mode(s)",
                conn.name,
                conn.connected,
                conn.modes.len()
            );
        }

        let conn = pick_connector(&connectors).ok_or(DisplayError::NoConnector)?;

        // Prefer the encoder already attached to the connector, then whatever it lists first.
        let encoder_handles = conn
            .current_encoder
            .into_iter()
            .chain(conn.encoders.iter().copied().filter(|e| Some(*e) != conn.current_encoder));

        let mut chosen = None;
        for handle in encoder_handles {
            let encoder = match self.device.encoder(handle) {
                Ok(encoder) => encoder,
                Err(err) => {
                    debug!("error querying encoder {handle:?}: {err:?}");
                    continue;
                }
            };

            if let Some(crtc) = crtc_for_encoder(&encoder) {
                chosen = Some((encoder.handle, crtc));
                break;
            }
        }

        let Some((encoder, crtc)) = chosen else {
            return Err(DisplayError::NoCrtc {
                connector: conn.name.clone(),
            });
        };

        let saved_crtc = self.device.crtc(crtc)?;
        let modes: Vec<DisplayMode> = conn.modes.iter().copied().map(DisplayMode::from).collect();

        debug!(
            "driving {} through {encoder:?} on {crtc:?}, found {:?} at {:?}",
            conn.name, saved_crtc.framebuffer, saved_crtc.position
        );

        // Nothing of ours is on the CRTC yet.
        self.scanout_fb = None;

        Ok(self.topology.insert(DisplayTopology {
            connector: conn.handle,
            connector_name: conn.name.clone(),
            encoder,
            crtc,
            saved_crtc,
            modes,
        }))
    }

    // === Modes ===

    /// Sets a mode of exactly `width`×`height`, or the preferred one for `(0, 0)`.
    pub fn set_mode(&mut self, width: u16, height: u16) -> Result<&DisplayMode, DisplayError> {
        let _span = tracy_client::span!("DisplayManager::set_mode");

        let topology = self.topology.as_ref().ok_or(DisplayError::NoConnector)?;
        let mode = pick_mode(&topology.modes, width, height)
            .cloned()
            .ok_or(DisplayError::ModeSet {
                width,
                height,
                source: None,
            })?;

        self.apply_mode(mode)
            .map_err(|source| DisplayError::ModeSet {
                width,
                height,
                source: Some(source),
            })
    }

    /// Sets the requested mode, or the first offered fallback size, or the preferred mode.
    pub fn set_mode_with_fallback(
        &mut self,
        requested: Option<(u16, u16)>,
        fallbacks: &[(u16, u16)],
    ) -> Result<&DisplayMode, DisplayError> {
        let sizes = requested
            .into_iter()
            .chain(fallbacks.iter().copied())
            .chain([(0, 0)]);

        let mut last_err = None;
        for (width, height) in sizes {
            match self.set_mode(width, height) {
                Ok(_) => {
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("error setting {width}x{height}, trying the next mode: {err:?}");
                    last_err = Some(err);
                }
            }
        }

        if let Some(err) = last_err {
            return Err(err);
        }

        self.mode.as_ref().ok_or(DisplayError::NoConnector)
    }

    /// Puts the mode we had set back on the CRTC.
    ///
    /// Used after another process has been master and may have left its own mode behind.
    pub fn reapply_mode(&mut self) -> Result<&DisplayMode, DisplayError> {
        let _span = tracy_client::span!("DisplayManager::reapply_mode");

        let Some(mode) = self.mode.clone() else {
            return self.set_mode(0, 0);
        };

        let (width, height) = mode.size();
        self.apply_mode(mode)
            .map_err(|source| DisplayError::ModeSet {
                width,
                height,
                source: Some(source),
            })
    }

    fn apply_mode(&mut self, mode: DisplayMode) -> io::Result<&DisplayMode> {
        let (crtc, connector) = self.path_handles()?;
        let saved_fb = self
            .topology
            .as_ref()
            .and_then(|topology| topology.saved_crtc.framebuffer);
        let placeholder = self.scanout_fb;

        let first = self
            .device
            .set_crtc(crtc, placeholder, &[connector], Some(mode.drm));

        match (first, placeholder, saved_fb) {
            // The framebuffer found on the CRTC is the only thing we can show until we render.
            (Err(err), None, Some(fb)) => {
                debug!("mode set without a framebuffer failed ({err:?}), retrying with {fb:?}");
                self.device
                    .set_crtc(crtc, Some(fb), &[connector], Some(mode.drm))?;
                self.scanout_fb = Some(fb);
            }
            (result, _, _) => result?,
        }

        info!(
            "set mode {} ({}x{}@{:.3})",
            mode.name,
            mode.width,
            mode.height,
            mode.refresh_mhz as f64 / 1000.
        );

        Ok(self.mode.insert(mode))
    }

    // === Master ===

    /// Gives up master while keeping the device open.
    ///
    /// With `disable_crtc` the CRTC is switched off first. Leave it off unless the hardware is
    /// known to cope: several drivers fail the next master's first frame on a disabled CRTC.
    pub fn drop_master(&mut self, disable_crtc: bool) -> Result<(), DisplayError> {
        let _span = tracy_client::span!("DisplayManager::drop_master");

        if !self.master {
            debug!("not DRM master, nothing to drop");
            return Ok(());
        }

        if disable_crtc {
            if let Some(topology) = &self.topology {
                match self.device.set_crtc(topology.crtc, None, &[], None) {
                    Ok(()) => self.scanout_fb = None,
                    Err(err) => warn!("error disabling {:?}: {err:?}", topology.crtc),
                }
            }
        }

        self.device.release_master()?;
        self.master = false;

        debug!("dropped DRM master");
        Ok(())
    }

    /// Takes master back. Safe to call repeatedly.
    pub fn acquire_master(&mut self) -> Result<(), DisplayError> {
        let _span = tracy_client::span!("DisplayManager::acquire_master");

        self.device
            .acquire_master()
            .map_err(DisplayError::MasterAcquire)?;

        // Flips from before the handoff stay outstanding: their events may still be queued on
        // the fd and are settled by the next queue_flip.
        self.master = true;

        debug!("acquired DRM master");
        Ok(())
    }

    /// Closes the device, optionally putting back the CRTC state found at startup.
    ///
    /// Without `restore_mode` the CRTC is left as it is. Forcing a mode on the way out has been
    /// seen to leave the CRTC unusable for whoever opens the card next.
    pub fn close(self, restore_mode: bool) {
        let _span = tracy_client::span!("DisplayManager::close");

        if restore_mode {
            if let Some(topology) = &self.topology {
                let saved = &topology.saved_crtc;
                let connectors: &[connector::Handle] = if saved.mode.is_some() {
                    &[topology.connector]
                } else {
                    &[]
                };

                match self
                    .device
                    .set_crtc(saved.handle, saved.framebuffer, connectors, saved.mode)
                {
                    Ok(()) => debug!("restored the startup configuration of {:?}", saved.handle),
                    Err(err) => warn!("error restoring {:?}: {err:?}", saved.handle),
                }
            }
        }

        if self.master {
            if let Err(err) = self.device.release_master() {
                warn!("error dropping DRM master on close: {err:?}");
            }
        }

        debug!("closed {:?}", self.path);
    }

    // === Scan-out ===

    pub fn add_framebuffer(&self, source: &ScanoutSource) -> io::Result<framebuffer::Handle> {
        self.device.add_framebuffer(source)
    }

    pub fn remove_framebuffer(&mut self, fb: framebuffer::Handle) {
        if self.scanout_fb == Some(fb) {
            self.scanout_fb = None;
        }

        if let Err(err) = self.device.destroy_framebuffer(fb) {
            debug!("error destroying {fb:?}: {err:?}");
        }
    }

    /// Shows `fb` right away with a full mode set.
    pub fn commit(&mut self, fb: framebuffer::Handle) -> io::Result<()> {
        let _span = tracy_client::span!("DisplayManager::commit");

        let (crtc, connector) = self.path_handles()?;
        let mode = self.mode.as_ref().map(|mode| mode.drm);

        self.device.set_crtc(crtc, Some(fb), &[connector], mode)?;
        self.scanout_fb = Some(fb);

        Ok(())
    }

    /// Queues a flip to `fb` at the next vblank.
    ///
    /// The kernel only accepts a flip once the previous one on the CRTC has completed, so every
    /// older flip is settled here. Their completion events that are already queued on the fd are
    /// read and dropped, so they can't be mistaken for this flip's.
    pub fn queue_flip(&mut self, fb: framebuffer::Handle) -> io::Result<FlipTicket> {
        let (crtc, _) = self.path_handles()?;

        self.device.page_flip(crtc, fb)?;
        self.scanout_fb = Some(fb);

        self.drain_flip_events(crtc);
        self.flips_completed = self.flips_submitted;
        self.flips_submitted += 1;

        Ok(FlipTicket(self.flips_submitted))
    }

    /// Reads completion events that are already queued, without waiting.
    fn drain_flip_events(&mut self, crtc: crtc::Handle) {
        loop {
            match self.device.wait_for_flip(crtc, Duration::ZERO) {
                Ok(Some(event)) => {
                    trace!("dropping stale completion of flip {}", event.sequence);
                    self.flips_completed = (self.flips_completed + 1).min(self.flips_submitted);
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("error draining flip events: {err:?}");
                    break;
                }
            }
        }
    }

    /// Waits until the flip behind `ticket` has completed, for at most `timeout`.
    ///
    /// A completion that arrives after its wait timed out is credited to that older flip, never
    /// to a newer one.
    pub fn wait_for_flip(
        &mut self,
        ticket: FlipTicket,
        timeout: Duration,
    ) -> io::Result<Option<FlipEvent>> {
        let _span = tracy_client::span!("DisplayManager::wait_for_flip");

        let (crtc, _) = self.path_handles()?;
        let deadline = Instant::now() + timeout;

        while self.flips_completed < ticket.0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(event) = self.device.wait_for_flip(crtc, remaining)? else {
                return Ok(None);
            };

            self.flips_completed = (self.flips_completed + 1).min(self.flips_submitted);
            self.last_flip = Some(event);
        }

        Ok(self.last_flip)
    }

    fn path_handles(&self) -> io::Result<(crtc::Handle, connector::Handle)> {
        let topology = self
            .topology
            .as_ref()
            .ok_or_else(|| io::Error::other("display topology has not been discovered"))?;
        Ok((topology.crtc, topology.connector))
    }

    // === Accessors ===

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn topology(&self) -> Option<&DisplayTopology> {
        self.topology.as_ref()
    }

    /// The mode last set successfully.
    pub fn mode(&self) -> Option<&DisplayMode> {
        self.mode.as_ref()
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn scanout_framebuffer(&self) -> Option<framebuffer::Handle> {
        self.scanout_fb
    }
}
