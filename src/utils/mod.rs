use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;

/// Sleeps the main thread, skipping zero durations.
pub fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    let _span = tracy_client::span!("sleep");
    std::thread::sleep(duration);
}

/// `$XDG_CONFIG_HOME/marquee/config.kdl`.
pub fn default_config_path() -> Option<PathBuf> {
    let dirs = BaseDirs::new()?;
    Some(dirs.config_dir().join("marquee").join("config.kdl"))
}

/// Sends `SIGKILL` to every process whose `comm` is `name`. Returns how many were signalled.
pub fn kill_processes_named(name: &str) -> usize {
    let own_pid = std::process::id();

    let mut killed = 0;
    for pid in find_processes_named(Path::new("/proc"), name) {
        if pid == own_pid {
            continue;
        }

        // SAFETY: kill has no memory safety requirements.
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if ret == 0 {
            debug!("killed stray {name} (pid {pid})");
            killed += 1;
        } else {
            let err = std::io::Error::last_os_error();
            debug!("error killing {name} (pid {pid}): {err:?}");
        }
    }

    killed
}

/// Scans a procfs-like directory for processes whose `comm` equals `name`.
fn find_processes_named(proc_root: &Path, name: &str) -> Vec<u32> {
    let entries = match fs::read_dir(proc_root) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("error reading {proc_root:?}: {err:?}");
            return Vec::new();
        }
    };

    let mut pids: Vec<u32> = entries
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            let comm = fs::read_to_string(entry.path().join("comm")).ok()?;
            (comm.trim_end() == name).then_some(pid)
        })
        .collect();
    pids.sort_unstable();
    pids
}
