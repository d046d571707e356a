//! Scriptable stand-ins for the hardware and the collaborators.
//!
//! Everything that changes state appends a line to a shared [`EventLog`], so tests can check
//! the exact order of operations across components.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::iter::zip;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::rc::Rc;
use std::time::Duration;

use smithay::reexports::drm::buffer::DrmFourcc;
use smithay::reexports::drm::control::{self, connector, crtc, encoder, framebuffer};

use crate::backend::kms::{
    ConnectorInfo, CrtcState, DisplayDevice, EncoderInfo, FlipEvent, ScanoutSource,
};
use crate::backend::present::{BufferId, BufferPool, PoolError};
use crate::handoff::{InputCollaborator, Launcher, MediaCollaborator, RenderContextListener};

pub type EventLog = Rc<RefCell<Vec<String>>>;

pub fn handle<T: From<control::RawResourceHandle>>(raw: u32) -> T {
    control::from_u32(raw).unwrap()
}

pub fn fb(raw: u32) -> framebuffer::Handle {
    handle(raw)
}

fn raw(handle: impl Into<control::RawResourceHandle>) -> u32 {
    handle.into().get()
}

fn mode_name(name: &str) -> [core::ffi::c_char; 32] {
    let mut buf: [core::ffi::c_char; 32] = [0; 32];
    for (a, b) in zip(&mut buf[..31], name.as_bytes()) {
        *a = *b as _;
    }
    buf
}

fn modeinfo(width: u16, height: u16, clock: u32) -> drm_ffi::drm_mode_modeinfo {
    drm_ffi::drm_mode_modeinfo {
        clock,
        hdisplay: width,
        hsync_start: width + 48,
        hsync_end: width + 80,
        htotal: width + 160,
        hskew: 0,
        vdisplay: height,
        vsync_start: height + 3,
        vsync_end: height + 8,
        vtotal: height + 45,
        vscan: 0,
        vrefresh: 0,
        flags: 0,
        type_: drm_ffi::DRM_MODE_TYPE_DRIVER,
        name: mode_name(&format!("{width}x{height}")),
    }
}

pub fn test_mode_with_clock(width: u16, height: u16, clock: u32) -> control::Mode {
    control::Mode::from(modeinfo(width, height, clock))
}

/// A mode with plausible timings for `refresh` Hz.
pub fn test_mode(width: u16, height: u16, refresh: u32, preferred: bool) -> control::Mode {
    let htotal = (width + 160) as u64;
    let vtotal = (height + 45) as u64;
    let clock = (htotal * vtotal * refresh as u64 + 500) / 1000;

    let mut info = modeinfo(width, height, clock as u32);
    info.vrefresh = refresh;
    if preferred {
        info.type_ |= drm_ffi::DRM_MODE_TYPE_PREFERRED;
    }
    control::Mode::from(info)
}

pub fn connected(
    conn: u32,
    name: &str,
    encoder: u32,
    modes: Vec<control::Mode>,
) -> ConnectorInfo {
    ConnectorInfo {
        handle: handle(conn),
        name: name.to_owned(),
        connected: true,
        modes,
        current_encoder: Some(handle(encoder)),
        encoders: vec![handle(encoder)],
    }
}

// =============================================================================
// Display device
// =============================================================================

/// A display device with one HDMI connector, one encoder and two CRTCs.
///
/// CRTC 40 starts out showing framebuffer 90 at 1920x1080. Framebuffers we create are numbered
/// from 100.
pub struct FakeDevice {
    pub driver: String,
    pub log: EventLog,
    pub connectors: Vec<ConnectorInfo>,
    pub encoders: Vec<EncoderInfo>,
    pub crtcs: Vec<CrtcState>,
    /// Reject mode sets without a framebuffer, like real drivers do.
    pub reject_set_crtc_without_fb: Cell<bool>,
    pub fail_set_crtc: Cell<bool>,
    master: Cell<bool>,
    master_failures: Cell<u32>,
    flip_failures: Cell<u32>,
    delayed_flips: Cell<u32>,
    flips: Cell<u32>,
    next_fb: Cell<u32>,
    /// Flips waiting for the next vblank.
    pending_flips: RefCell<VecDeque<FlipEvent>>,
    /// Completion events readable from the fd.
    events: RefCell<VecDeque<FlipEvent>>,
    delayed_events: RefCell<Vec<FlipEvent>>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self {
            driver: String::from("vc4"),
            log: EventLog::default(),
            connectors: vec![connected(
                10,
                "HDMI-A-1",
                30,
                vec![
                    test_mode(1920, 1080, 60, true),
                    test_mode(1280, 720, 60, false),
                ],
            )],
            encoders: vec![EncoderInfo {
                handle: handle(30),
                crtc: Some(handle(40)),
                possible_crtcs: vec![handle(40), handle(41)],
            }],
            crtcs: vec![
                CrtcState {
                    handle: handle(40),
                    framebuffer: Some(fb(90)),
                    mode: Some(test_mode(1920, 1080, 60, true)),
                    position: (0, 0),
                },
                CrtcState {
                    handle: handle(41),
                    framebuffer: None,
                    mode: None,
                    position: (0, 0),
                },
            ],
            reject_set_crtc_without_fb: Cell::new(true),
            fail_set_crtc: Cell::new(false),
            master: Cell::new(true),
            master_failures: Cell::new(0),
            flip_failures: Cell::new(0),
            delayed_flips: Cell::new(0),
            flips: Cell::new(0),
            next_fb: Cell::new(100),
            pending_flips: RefCell::new(VecDeque::new()),
            events: RefCell::new(VecDeque::new()),
            delayed_events: RefCell::new(Vec::new()),
        }
    }
}

impl FakeDevice {
    pub fn with_log(log: EventLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn with_driver(self, driver: &str) -> Self {
        Self {
            driver: driver.to_owned(),
            ..self
        }
    }

    /// Makes the next `count` master acquisitions fail.
    pub fn fail_master(&self, count: u32) {
        self.master_failures.set(count);
    }

    /// Makes the next `count` page flips fail to queue.
    pub fn fail_flips(&self, count: u32) {
        self.flip_failures.set(count);
    }

    /// Holds back the completion events of the next `count` page flips until
    /// [`Self::release_delayed_flip_events`].
    pub fn delay_flip_events(&self, count: u32) {
        self.delayed_flips.set(count);
    }

    pub fn release_delayed_flip_events(&self) {
        let delayed = std::mem::take(&mut *self.delayed_events.borrow_mut());
        self.events.borrow_mut().extend(delayed);
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.log.borrow_mut().clear();
    }

    fn record(&self, call: String, ok: bool) {
        let call = if ok { call } else { format!("{call} failed") };
        self.log.borrow_mut().push(call);
    }

    fn take_one(counter: &Cell<u32>) -> bool {
        let left = counter.get();
        if left == 0 {
            return false;
        }
        counter.set(left - 1);
        true
    }
}

impl DisplayDevice for FakeDevice {
    fn driver_name(&self) -> io::Result<String> {
        Ok(self.driver.clone())
    }

    fn acquire_master(&self) -> io::Result<()> {
        if Self::take_one(&self.master_failures) {
            self.record(String::from("acquire_master"), false);
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }

        self.master.set(true);
        self.record(String::from("acquire_master"), true);
        Ok(())
    }

    fn release_master(&self) -> io::Result<()> {
        self.master.set(false);
        self.record(String::from("release_master"), true);
        Ok(())
    }

    fn connectors(&self) -> io::Result<Vec<ConnectorInfo>> {
        Ok(self.connectors.clone())
    }

    fn encoder(&self, handle: encoder::Handle) -> io::Result<EncoderInfo> {
        self.encoders
            .iter()
            .find(|e| e.handle == handle)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn crtc(&self, handle: crtc::Handle) -> io::Result<CrtcState> {
        self.crtcs
            .iter()
            .find(|c| c.handle == handle)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        framebuffer: Option<framebuffer::Handle>,
        _connectors: &[connector::Handle],
        mode: Option<control::Mode>,
    ) -> io::Result<()> {
        let fb = framebuffer.map_or_else(|| String::from("none"), |fb| raw(fb).to_string());
        let mode_desc = mode.map_or_else(
            || String::from("none"),
            |mode| format!("{}x{}", mode.size().0, mode.size().1),
        );
        let call = format!("set_crtc crtc={} fb={fb} mode={mode_desc}", raw(crtc));

        let ok = !self.fail_set_crtc.get()
            && self.master.get()
            && !(self.reject_set_crtc_without_fb.get() && framebuffer.is_none() && mode.is_some());
        self.record(call, ok);

        if ok {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
    }

    fn add_framebuffer(&self, source: &ScanoutSource) -> io::Result<framebuffer::Handle> {
        let id = self.next_fb.get();
        self.next_fb.set(id + 1);
        self.record(format!("add_fb {} -> {id}", raw(source.handle)), true);
        Ok(fb(id))
    }

    fn destroy_framebuffer(&self, framebuffer: framebuffer::Handle) -> io::Result<()> {
        self.record(format!("destroy_fb {}", raw(framebuffer)), true);
        Ok(())
    }

    fn page_flip(&self, crtc: crtc::Handle, framebuffer: framebuffer::Handle) -> io::Result<()> {
        let call = format!("page_flip crtc={} fb={}", raw(crtc), raw(framebuffer));

        if !self.master.get() || Self::take_one(&self.flip_failures) {
            self.record(call, false);
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.record(call, true);

        let sequence = self.flips.get() + 1;
        self.flips.set(sequence);
        let event = FlipEvent {
            sequence,
            time: Duration::from_millis(16 * sequence as u64),
        };

        if Self::take_one(&self.delayed_flips) {
            self.delayed_events.borrow_mut().push(event);
        } else {
            self.pending_flips.borrow_mut().push_back(event);
        }

        Ok(())
    }

    /// A non-zero wait lets one vblank pass, completing the oldest pending flip.
    fn wait_for_flip(
        &self,
        _crtc: crtc::Handle,
        timeout: Duration,
    ) -> io::Result<Option<FlipEvent>> {
        let mut events = self.events.borrow_mut();
        if events.is_empty() && !timeout.is_zero() {
            if let Some(event) = self.pending_flips.borrow_mut().pop_front() {
                events.push_back(event);
            }
        }
        Ok(events.pop_front())
    }
}

// =============================================================================
// Buffer pool
// =============================================================================

/// A pool whose buffers are numbered from 1 and always ready, handed out round-robin.
pub struct FakePool {
    slots: u32,
    next: u32,
    outstanding: BTreeSet<u32>,
    max_outstanding: usize,
    acquire_failures: u32,
}

impl FakePool {
    pub fn new(slots: u32) -> Self {
        Self {
            slots,
            next: 0,
            outstanding: BTreeSet::new(),
            max_outstanding: 0,
            acquire_failures: 0,
        }
    }

    pub fn fail_acquires(&mut self, count: u32) {
        self.acquire_failures += count;
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }
}

impl BufferPool for FakePool {
    type Buffer = u32;

    fn acquire(&mut self) -> Result<u32, PoolError> {
        if self.acquire_failures > 0 {
            self.acquire_failures -= 1;
            return Err(PoolError::Exhausted);
        }

        for i in 0..self.slots {
            let index = (self.next + i) % self.slots;
            let id = index + 1;
            if self.outstanding.insert(id) {
                self.next = index + 1;
                self.max_outstanding = self.max_outstanding.max(self.outstanding.len());
                return Ok(id);
            }
        }

        Err(PoolError::Exhausted)
    }

    fn release(&mut self, buffer: u32) {
        assert!(
            self.outstanding.remove(&buffer),
            "buffer {buffer} released while not acquired"
        );
    }

    fn id(&self, buffer: &u32) -> BufferId {
        BufferId(*buffer)
    }

    fn scanout_source(&self, buffer: &u32) -> ScanoutSource {
        ScanoutSource {
            size: (1920, 1080),
            format: DrmFourcc::Xrgb8888,
            pitch: 1920 * 4,
            handle: handle(*buffer),
        }
    }
}

// =============================================================================
// Collaborators
// =============================================================================

pub struct FakeMedia {
    log: EventLog,
    initialized: bool,
    /// Only stop on `stop_and_release`, leaving the pipeline object alive.
    pub keep_initialized: bool,
}

impl FakeMedia {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            initialized: true,
            keep_initialized: false,
        }
    }
}

impl MediaCollaborator for FakeMedia {
    fn stop_and_release(&mut self) {
        self.log.borrow_mut().push(String::from("media stop_and_release"));
        if !self.keep_initialized {
            self.initialized = false;
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn initialize(&mut self) -> anyhow::Result<()> {
        self.log.borrow_mut().push(String::from("media initialize"));
        self.initialized = true;
        Ok(())
    }
}

pub struct FakeInput {
    log: EventLog,
    reinitialize_failures: u32,
}

impl FakeInput {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            reinitialize_failures: 0,
        }
    }

    pub fn fail_reinitialize(&mut self, count: u32) {
        self.reinitialize_failures = count;
    }
}

impl InputCollaborator for FakeInput {
    fn release_grabs(&mut self) {
        self.log.borrow_mut().push(String::from("input release_grabs"));
    }

    fn reinitialize(&mut self) -> bool {
        let ok = self.reinitialize_failures == 0;
        self.reinitialize_failures = self.reinitialize_failures.saturating_sub(1);

        let entry = if ok { "input reinitialize ok" } else { "input reinitialize failed" };
        self.log.borrow_mut().push(String::from(entry));
        ok
    }

    fn wake(&mut self) {
        self.log.borrow_mut().push(String::from("input wake"));
    }
}

pub struct FakeRenderContext {
    log: EventLog,
}

impl FakeRenderContext {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl RenderContextListener for FakeRenderContext {
    fn reset_render_context(&mut self) {
        self.log.borrow_mut().push(String::from("render_context reset"));
    }
}

pub struct FakeLauncher {
    log: EventLog,
    pub fail_spawn: bool,
}

impl FakeLauncher {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            fail_spawn: false,
        }
    }
}

impl Launcher for FakeLauncher {
    fn run(&mut self, command: &[String]) -> io::Result<ExitStatus> {
        let call = format!("launch {}", command.join(" "));

        if self.fail_spawn {
            self.log.borrow_mut().push(format!("{call} failed"));
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }

        self.log.borrow_mut().push(call);
        Ok(ExitStatus::from_raw(0))
    }

    fn kill_stray(&mut self, command: &[String]) -> usize {
        let name = command.first().map(String::as_str).unwrap_or_default();
        self.log.borrow_mut().push(format!("kill_stray {name}"));
        0
    }
}
