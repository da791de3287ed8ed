//! Single-instance guard backed by a PID marker file.
//!
//! The marker holds the decimal pid of the most recently started run-phase
//! process. Sessions that disallow parallel runs read it and kill whatever
//! it names before launching their own VM. The same path is also handed to
//! QEMU through `-pidfile`.
//!
//! ## Lifecycle
//!
//! ```text
//! PidMarker::host()          created once per launcher process (temp file)
//!     ├─► kill_previously_active()   read + best-effort SIGKILL
//!     └─► record_active(pid)         atomic overwrite on every run start
//! ```
//!
//! Missing files, garbage content and pids that no longer exist all mean
//! "nothing to kill". None of these conditions is an error.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use qlaunch_shared::{QlaunchError, QlaunchResult};

use crate::util::{is_killable_pid, is_marker_owner, is_process_alive, kill_process};

/// Host-lifetime marker path. `None` when creation failed.
static HOST_MARKER: OnceLock<Option<PathBuf>> = OnceLock::new();

const MARKER_PREFIX: &str = "qlaunch-qemu-";
const MARKER_SUFFIX: &str = ".pid";

/// Handle to the persisted PID marker.
///
/// Cheap to clone; clones share the same path. A disabled marker (no path)
/// never records and never kills.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidMarker {
    path: Option<PathBuf>,
}

impl PidMarker {
    /// The marker shared by every session of this process.
    ///
    /// The file is created lazily on first use. If it cannot be created the
    /// guard degrades to a disabled marker instead of failing the run.
    pub fn host() -> Self {
        let path = HOST_MARKER.get_or_init(|| match create_marker_file() {
            Ok(path) => {
                tracing::debug!(path = %path.display(), "Created PID marker");
                Some(path)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create PID marker, single-instance guard disabled");
                None
            }
        });

        Self { path: path.clone() }
    }

    /// A marker at an explicit path. The file need not exist yet.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A marker that never records or kills anything.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Overwrite the marker with `pid`.
    ///
    /// Writes a sibling temp file and renames it over the marker, so readers
    /// see either the old pid or the new one.
    pub fn record_active(&self, pid: u32) -> QlaunchResult<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut tmp = tempfile::Builder::new()
            .prefix(MARKER_PREFIX)
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| {
                QlaunchError::Storage(format!(
                    "Failed to stage PID marker in {}: {}",
                    dir.display(),
                    e
                ))
            })?;

        write!(tmp, "{pid}")?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| {
            QlaunchError::Storage(format!(
                "Failed to write PID marker {}: {}",
                path.display(),
                e.error
            ))
        })?;

        tracing::debug!(pid, path = %path.display(), "Recorded active run process");
        Ok(())
    }

    /// Read the recorded pid.
    ///
    /// Only the first whitespace-separated token counts; anything that is
    /// not a non-negative integer reads as `None`.
    pub fn read_active(&self) -> Option<u32> {
        let path = self.path.as_deref()?;
        let content = std::fs::read_to_string(path).ok()?;
        parse_pid(&content)
    }

    /// Kill the process named by the marker, if any.
    ///
    /// Only a process whose command line carries this marker path (the
    /// `-pidfile` argument we pass to QEMU) is killed, so a recycled pid is
    /// left alone. Best effort: stale pids, unsafe pids, foreign processes
    /// and failed kills are logged and otherwise ignored. Death is not
    /// awaited.
    ///
    /// # Returns
    /// * `true` - A kill signal was sent to a live process
    /// * `false` - Nothing was killed
    pub fn kill_previously_active(&self) -> bool {
        let Some(pid) = self.read_active() else {
            tracing::trace!("No previous run process recorded");
            return false;
        };

        if !is_killable_pid(pid) {
            tracing::warn!(pid, "Refusing to kill recorded pid");
            return false;
        }

        if !is_process_alive(pid) {
            tracing::debug!(pid, "Previous run process already gone");
            return false;
        }

        if let Some(path) = self.path.as_deref() {
            if !is_marker_owner(pid, path) {
                tracing::debug!(pid, path = %path.display(), "Recorded pid belongs to another process, not killing");
                return false;
            }
        }

        let killed = kill_process(pid);
        if killed {
            tracing::info!(pid, "Killed previous run process");
        } else {
            tracing::warn!(pid, "Failed to kill previous run process");
        }
        killed
    }
}

fn create_marker_file() -> std::io::Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix(MARKER_PREFIX)
        .suffix(MARKER_SUFFIX)
        .tempfile()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

fn parse_pid(content: &str) -> Option<u32> {
    content.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use crate::util::test_support::{ChildGuard, spawn_marker_owner};
    use tempfile::TempDir;

    fn marker_in(dir: &TempDir) -> PidMarker {
        PidMarker::at(dir.path().join("qemu.pid"))
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let marker = marker_in(&dir);

        marker.record_active(4242).unwrap();
        assert_eq!(marker.read_active(), Some(4242));

        marker.record_active(17).unwrap();
        assert_eq!(marker.read_active(), Some(17));
        assert_eq!(
            std::fs::read_to_string(marker.path().unwrap()).unwrap(),
            "17"
        );
    }

    #[test]
    fn test_missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let marker = marker_in(&dir);
        assert_eq!(marker.read_active(), None);
        assert!(!marker.kill_previously_active());
    }

    #[test]
    fn test_garbage_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let marker = marker_in(&dir);

        for content in ["", "   \n", "not-a-pid", "-12", "12abc"] {
            std::fs::write(marker.path().unwrap(), content).unwrap();
            assert_eq!(marker.read_active(), None, "content {content:?}");
            assert!(!marker.kill_previously_active());
        }
    }

    #[test]
    fn test_qemu_style_content_parses() {
        // QEMU's -pidfile writes the pid followed by a newline
        assert_eq!(parse_pid("1234\n"), Some(1234));
        assert_eq!(parse_pid("  99 trailing"), Some(99));
    }

    #[test]
    fn test_stale_pid_is_ignored() {
        let dir = TempDir::new().unwrap();
        let marker = marker_in(&dir);
        marker.record_active(999999999).unwrap();
        assert!(!marker.kill_previously_active());
    }

    #[test]
    fn test_own_pid_is_never_killed() {
        let dir = TempDir::new().unwrap();
        let marker = marker_in(&dir);
        marker.record_active(std::process::id()).unwrap();
        assert!(!marker.kill_previously_active());
    }

    #[cfg(unix)]
    #[test]
    fn test_kills_live_process() {
        let dir = TempDir::new().unwrap();
        let marker = marker_in(&dir);

        let mut owner = spawn_marker_owner(marker.path().unwrap());
        marker.record_active(owner.id()).unwrap();

        assert!(marker.kill_previously_active());
        assert!(!owner.child().wait().unwrap().success());
    }

    #[cfg(unix)]
    #[test]
    fn test_recycled_pid_is_not_killed() {
        let dir = TempDir::new().unwrap();
        let marker = marker_in(&dir);

        let mut unrelated = ChildGuard::new(
            std::process::Command::new("sleep")
                .arg("30")
                .spawn()
                .unwrap(),
        );
        marker.record_active(unrelated.id()).unwrap();

        assert!(!marker.kill_previously_active());
        assert!(is_process_alive(unrelated.id()));
        assert_eq!(unrelated.child().try_wait().unwrap(), None);
    }

    #[test]
    fn test_disabled_marker() {
        let marker = PidMarker::disabled();
        assert!(!marker.is_enabled());
        marker.record_active(4242).unwrap();
        assert_eq!(marker.read_active(), None);
        assert!(!marker.kill_previously_active());
    }

    #[test]
    fn test_host_marker_is_shared() {
        let first = PidMarker::host();
        let second = PidMarker::host();
        assert_eq!(first, second);
        if let Some(path) = first.path() {
            assert!(path.exists());
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with(MARKER_PREFIX));
            assert!(name.ends_with(MARKER_SUFFIX));
        }
    }
}
