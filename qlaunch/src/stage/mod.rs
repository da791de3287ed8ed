//! Stage processes.
//!
//! A stage is one externally spawned OS process: the build phase or the run
//! phase of a session. Each stage exposes two signals instead of a listener
//! object:
//!
//! ```text
//! StageProcess::spawn(kind, Command)
//!     ├─► reader tasks (stdout, stderr)  ──► mpsc<OutputChunk>
//!     └─► monitor task (wait | kill)     ──► oneshot<exit code>
//! ```
//!
//! [`StageProcess::next_event`] merges the two so that every chunk a stage
//! produced is observed before its exit.

mod process;

use std::fmt;

pub use process::StageProcess;

/// Which phase a stage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Build,
    Run,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Build => f.write_str("build"),
            StageKind::Run => f.write_str("run"),
        }
    }
}

/// Which stream a chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Stdout,
    Stderr,
}

/// Text read from a stage stream, relayed as it arrives.
///
/// Chunks are not line-aligned. Invalid UTF-8 is replaced with U+FFFD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stage: StageKind,
    pub kind: OutputKind,
    pub text: String,
}

/// Lifecycle event of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    Output(OutputChunk),
    Exited(i32),
}
