//! Keyboard and controller input through libinput.
//!
//! There is no seat manager on a kiosk, so devices are opened directly. While an external
//! program runs, libinput is suspended, which closes every device so the program can grab them.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::anyhow;
use smithay::reexports::input::event::keyboard::{KeyState, KeyboardEventTrait};
use smithay::reexports::input::event::{Event, KeyboardEvent};
use smithay::reexports::input::{Libinput, LibinputInterface};

use crate::handoff::InputCollaborator;

const KEY_ESC: u32 = 1;
const KEY_ENTER: u32 = 28;
const KEY_KPENTER: u32 = 96;

const SYS_CLASS_INPUT: &str = "/sys/class/input";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KioskAction {
    /// Hand the display to the configured program.
    Launch,
    Quit,
}

/// Opens evdev nodes directly, without logind or seatd.
struct DirectInterface;

impl LibinputInterface for DirectInterface {
    fn open_restricted(&mut self, path: &Path, flags: i32) -> Result<OwnedFd, i32> {
        let access = flags & libc::O_ACCMODE;

        OpenOptions::new()
            .custom_flags(flags)
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .open(path)
            .map(OwnedFd::from)
            .map_err(|err| {
                debug!("error opening {path:?}: {err:?}");
                err.raw_os_error().unwrap_or(libc::EIO)
            })
    }

    fn close_restricted(&mut self, fd: OwnedFd) {
        drop(File::from(fd));
    }
}

pub struct LibinputInput {
    libinput: Libinput,
    suspended: bool,
}

impl LibinputInput {
    pub fn new(seat: &str) -> anyhow::Result<Self> {
        let mut libinput = Libinput::new_with_udev(DirectInterface);
        let assigned = {
            let _span = tracy_client::span!("Libinput::udev_assign_seat");
            libinput.udev_assign_seat(seat)
        };
        assigned.map_err(|()| anyhow!("error assigning seat {seat} to libinput"))?;

        Ok(Self {
            libinput,
            suspended: false,
        })
    }

    /// Reads pending events and turns key presses into actions.
    pub fn dispatch(&mut self) -> Vec<KioskAction> {
        if self.suspended {
            return Vec::new();
        }

        if let Err(err) = self.libinput.dispatch() {
            warn!("error dispatching libinput events: {err:?}");
            return Vec::new();
        }

        let mut actions = Vec::new();
        for event in &mut self.libinput {
            match event {
                Event::Keyboard(KeyboardEvent::Key(event))
                    if event.key_state() == KeyState::Pressed =>
                {
                    if let Some(action) = action_for_key(event.key()) {
                        actions.push(action);
                    }
                }
                _ => (),
            }
        }

        actions
    }
}

impl InputCollaborator for LibinputInput {
    fn release_grabs(&mut self) {
        if !self.suspended {
            self.libinput.suspend();
            self.suspended = true;
            debug!("suspended libinput");
        }
    }

    fn reinitialize(&mut self) -> bool {
        if !self.suspended {
            return true;
        }

        if self.libinput.resume().is_err() {
            warn!("error resuming libinput");
            return false;
        }

        self.suspended = false;
        debug!("resumed libinput");
        true
    }

    fn wake(&mut self) {
        let woken = wake_input_devices(Path::new(SYS_CLASS_INPUT));
        trace!("sent change uevents to {woken} input device(s)");
    }
}

fn action_for_key(key: u32) -> Option<KioskAction> {
    match key {
        KEY_ENTER | KEY_KPENTER => Some(KioskAction::Launch),
        KEY_ESC => Some(KioskAction::Quit),
        _ => None,
    }
}

/// Asks udev to re-announce every evdev device under `root`.
///
/// Controllers that went to sleep wake up from the resulting probe. Returns the number of devices
/// poked.
pub fn wake_input_devices(root: &Path) -> usize {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("error reading {root:?}: {err:?}");
            return 0;
        }
    };

    let mut woken = 0;
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with("event") {
            continue;
        }

        let uevent = entry.path().join("uevent");
        match write_change(&uevent) {
            Ok(()) => woken += 1,
            Err(err) => trace!("error writing {uevent:?}: {err:?}"),
        }
    }

    woken
}

fn write_change(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(b"change")
}
