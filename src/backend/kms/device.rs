//! The seam between the display manager and the kernel.
//!
//! [`DisplayDevice`] is the set of DRM operations the display manager and the presentation
//! pipeline need. [`DrmCard`] implements it on an opened `/dev/dri/card*` node.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use smithay::reexports::drm::control::{
    self, connector, crtc, dumbbuffer::DumbBuffer, encoder, framebuffer, PageFlipFlags,
};
use smithay::reexports::drm::{self, buffer::DrmFourcc};

use super::helpers::format_connector_name;
use super::types::{ConnectorInfo, CrtcState, EncoderInfo, FlipEvent, ScanoutSource};

/// DRM operations used by the display manager.
pub trait DisplayDevice {
    fn driver_name(&self) -> io::Result<String>;

    fn acquire_master(&self) -> io::Result<()>;
    fn release_master(&self) -> io::Result<()>;

    fn connectors(&self) -> io::Result<Vec<ConnectorInfo>>;
    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo>;
    fn crtc(&self, handle: crtc::Handle) -> io::Result<CrtcState>;

    /// Legacy modeset. `framebuffer: None` with `mode: None` disables the CRTC.
    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        connectors: &[connector::Handle],
        mode: Option<control::Mode>,
    ) -> io::Result<()>;

    fn add_framebuffer(&self, source: &ScanoutSource) -> io::Result<framebuffer::Handle>;
    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()>;

    /// Queues a flip to `fb` at the next vblank, asking for a completion event.
    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> io::Result<()>;

    /// Blocks until a flip completes on `crtc` or `timeout` runs out.
    ///
    /// Completion events for other CRTCs are consumed and dropped.
    fn wait_for_flip(
        &self,
        crtc: crtc::Handle,
        timeout: Duration,
    ) -> io::Result<Option<FlipEvent>>;
}

/// An opened DRM card node.
#[derive(Debug)]
pub struct DrmCard {
    file: File,
    /// Completions read from the fd in a batch but not handed out yet.
    flips: RefCell<VecDeque<(crtc::Handle, FlipEvent)>>,
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl drm::Device for DrmCard {}
impl control::Device for DrmCard {}

impl DrmCard {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;

        Ok(Self {
            file,
            flips: RefCell::new(VecDeque::new()),
        })
    }

    pub fn create_dumb_buffer(&self, size: (u32, u32)) -> io::Result<DumbBuffer> {
        control::Device::create_dumb_buffer(self, size, DrmFourcc::Xrgb8888, 32)
    }

    pub fn destroy_dumb_buffer(&self, buffer: DumbBuffer) -> io::Result<()> {
        control::Device::destroy_dumb_buffer(self, buffer)
    }

    /// Pops the oldest buffered completion for `crtc`, dropping those for other CRTCs.
    fn take_buffered_flip(&self, crtc: crtc::Handle) -> Option<FlipEvent> {
        let mut flips = self.flips.borrow_mut();
        while let Some((event_crtc, event)) = flips.pop_front() {
            if event_crtc == crtc {
                return Some(event);
            }
            trace!("ignoring flip event for {event_crtc:?}");
        }
        None
    }

    /// Waits for the DRM fd to become readable.
    ///
    /// Returns `false` if `deadline` passed first.
    fn poll_readable(&self, deadline: Instant) -> io::Result<bool> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as i32;

            let mut fds = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: fds points to one valid pollfd for the duration of the call.
            let ret = unsafe { libc::poll(&mut fds, 1, timeout_ms) };

            match ret {
                0 => return Ok(false),
                n if n > 0 => return Ok(true),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                }
            }
        }
    }
}

impl DisplayDevice for DrmCard {
    fn driver_name(&self) -> io::Result<String> {
        let driver = drm::Device::get_driver(self)?;
        Ok(driver.name().to_string_lossy().into_owned())
    }

    fn acquire_master(&self) -> io::Result<()> {
        drm::Device::acquire_master_lock(self)
    }

    fn release_master(&self) -> io::Result<()> {
        drm::Device::release_master_lock(self)
    }

    fn connectors(&self) -> io::Result<Vec<ConnectorInfo>> {
        let resources = control::Device::resource_handles(self)?;

        let mut connectors = Vec::with_capacity(resources.connectors().len());
        for &handle in resources.connectors() {
            let info = match control::Device::get_connector(self, handle, false) {
                Ok(info) => info,
                Err(err) => {
                    debug!("error querying connector {handle:?}: {err:?}");
                    continue;
                }
            };

            connectors.push(ConnectorInfo {
                handle,
                name: format_connector_name(info.interface(), info.interface_id()),
                connected: info.state() == connector::State::Connected,
                modes: info.modes().to_vec(),
                current_encoder: info.current_encoder(),
                encoders: info.encoders().to_vec(),
            });
        }

        Ok(connectors)
    }

    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo> {
        let resources = control::Device::resource_handles(self)?;
        let info = control::Device::get_encoder(self, handle)?;

        Ok(EncoderInfo {
            handle,
            crtc: info.crtc(),
            possible_crtcs: resources.filter_crtcs(info.possible_crtcs()),
        })
    }

    fn crtc(&self, handle: crtc::Handle) -> io::Result<CrtcState> {
        let info = control::Device::get_crtc(self, handle)?;

        Ok(CrtcState {
            handle,
            framebuffer: info.framebuffer(),
            mode: info.mode(),
            position: info.position(),
        })
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        connectors: &[connector::Handle],
        mode: Option<control::Mode>,
    ) -> io::Result<()> {
        control::Device::set_crtc(self, crtc, framebuffer, (0, 0), connectors, mode)
    }

    fn add_framebuffer(&self, source: &ScanoutSource) -> io::Result<framebuffer::Handle> {
        let (depth, bpp) = source.depth_bpp();
        control::Device::add_framebuffer(self, source, depth, bpp)
    }

    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        control::Device::destroy_framebuffer(self, fb)
    }

    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> io::Result<()> {
        control::Device::page_flip(self, crtc, fb, PageFlipFlags::EVENT, None)
    }

    fn wait_for_flip(
        &self,
        crtc: crtc::Handle,
        timeout: Duration,
    ) -> io::Result<Option<FlipEvent>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(event) = self.take_buffered_flip(crtc) {
                return Ok(Some(event));
            }

            if !self.poll_readable(deadline)? {
                return Ok(None);
            }

            let events = match control::Device::receive_events(self) {
                Ok(events) => events,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            };

            let mut flips = self.flips.borrow_mut();
            for event in events {
                if let control::Event::PageFlip(event) = event {
                    flips.push_back((
                        event.crtc,
                        FlipEvent {
                            sequence: event.frame,
                            time: event.duration,
                        },
                    ));
                }
            }
        }
    }
}
