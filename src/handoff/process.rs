use std::io;
use std::path::Path;
use std::process::{Command, ExitStatus};

use crate::utils::kill_processes_named;

/// Runs the external full-screen program.
pub trait Launcher {
    /// Starts `command` and blocks until it exits.
    fn run(&mut self, command: &[String]) -> io::Result<ExitStatus>;

    /// Kills leftover instances of `command`. Returns how many were found.
    fn kill_stray(&mut self, command: &[String]) -> usize;
}

#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn run(&mut self, command: &[String]) -> io::Result<ExitStatus> {
        let Some((program, args)) = command.split_first() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no command configured",
            ));
        };

        info!("running {command:?}");

        // std resets the signal mask and dispositions in the child, so blocking SIGINT and
        // SIGTERM for our signal source doesn't leak into the program.
        Command::new(program).args(args).status()
    }

    fn kill_stray(&mut self, command: &[String]) -> usize {
        let Some(name) = command.first().and_then(|program| process_name(program)) else {
            return 0;
        };

        kill_processes_named(&name)
    }
}

/// Name of the program as the kernel reports it in `/proc/<pid>/comm`.
///
/// The kernel keeps at most 15 bytes of it.
fn process_name(program: &str) -> Option<String> {
    let name = Path::new(program).file_name()?.to_str()?;
    let mut end = name.len().min(15);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    Some(name[..end].to_owned())
}
