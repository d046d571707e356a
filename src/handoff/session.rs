use std::process::ExitStatus;

/// Lifecycle of the external program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Exited(ExitStatus),
    FailedToStart,
}

/// What we own while a handoff is in progress.
///
/// Lives from the start of a handoff until control is fully back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffSession {
    pub master_held: bool,
    pub input_grabbed: bool,
    pub process: ProcessState,
}

impl HandoffSession {
    pub fn new() -> Self {
        Self {
            master_held: true,
            input_grabbed: true,
            process: ProcessState::NotStarted,
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self.process {
            ProcessState::Exited(status) => Some(status),
            _ => None,
        }
    }
}
