//! qlaunch - build-and-run supervisor for QEMU virtual machines.
//!
//! A [`Launcher`] starts [`Session`]s. Each session optionally builds a
//! disk image, boots it in QEMU, relays the output of both phases on one
//! stream, and reports a single [`SessionOutcome`]. Sessions that do not
//! allow parallel runs kill the previously launched VM through a shared
//! [`PidMarker`].

pub mod build;
pub mod command;
pub mod config;
pub mod launcher;
pub mod marker;
pub mod session;
pub mod stage;
pub mod util;

pub use build::{BuildBackend, BuildDispatcher, BuildJob, BuildProject, CmakeBackend};
pub use command::RunCommandLine;
pub use config::{
    BuildTargetRef, DebugOptions, DiskImageSource, LauncherOptions, RunConfigFile, SessionConfig,
};
pub use launcher::Launcher;
pub use marker::PidMarker;
pub use session::{Session, SessionOutcome, SessionOutput, SessionPhase};
pub use stage::{OutputChunk, OutputKind, StageKind};
pub use util::{default_home_dir, find_qemu_executables, init_logging};

pub use qlaunch_shared::{QlaunchError, QlaunchResult};
