use std::fmt;
use std::path::PathBuf;

use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// 1-based source position extracted from a diagnostic line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DiagnosticLocation {
    pub line: u32,
    pub column: u32,
}

/// A line as read from one of the child's pipes, before sequencing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedLine {
    pub stream: StreamKind,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLine {
    pub session_id: SessionId,
    pub sequence: u64,
    pub stream: StreamKind,
    pub text: String,
    pub diagnostic: Option<DiagnosticLocation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Exited { code: i32 },
    Stopped,
    LaunchFailed { reason: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => f.write_str("running"),
            RunStatus::Exited { code } => write!(f, "exited with code {}", code),
            RunStatus::Stopped => f.write_str("stopped"),
            RunStatus::LaunchFailed { reason } => write!(f, "failed to launch: {}", reason),
        }
    }
}

/// Everything a caller observes about a run, in delivery order.
/// `Finished` is always last and sent exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunEvent {
    Started { pid: Option<u32> },
    Output(OutputLine),
    Finished(RunStatus),
}

/// Resolved absolute path of an interpreter or compiler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolchainHandle {
    pub path: PathBuf,
}

impl ToolchainHandle {
    pub fn new<T: Into<PathBuf>>(path: T) -> Self {
        ToolchainHandle { path: path.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// What the supervisor spawns. `fallback` is tried once if `primary`
/// is refused with a permission error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchPlan {
    pub primary: Invocation,
    pub fallback: Option<Invocation>,
    pub working_dir: PathBuf,
}
