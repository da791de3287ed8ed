//! QEMU executable discovery.
//!
//! Looks for `qemu-system-*` binaries in the usual install locations and
//! on `PATH`. The result only feeds pickers and the `executables` command;
//! sessions never re-validate the chosen path beyond a failed spawn.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// File name prefix shared by every QEMU system emulator.
pub const QEMU_SYSTEM_PREFIX: &str = "qemu-system-";

/// Install locations checked in addition to `PATH`.
const SEARCH_DIRS: &[&str] = &[
    // Linux
    "/usr/bin",
    // macOS (Intel Homebrew and Apple Silicon Homebrew)
    "/usr/local/bin",
    "/opt/homebrew/bin",
    // Windows
    "C:\\Program Files\\qemu",
];

/// Find every QEMU system emulator in the standard locations and on `PATH`.
///
/// Results are deduplicated and sorted.
pub fn find_qemu_executables() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = SEARCH_DIRS.iter().map(PathBuf::from).collect();
    dirs.extend(path_dirs());
    find_qemu_executables_in(&dirs)
}

/// Find QEMU system emulators directly inside the given directories.
pub fn find_qemu_executables_in(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();

    for dir in dirs.iter().filter(|d| d.is_dir()) {
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            let is_qemu = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(QEMU_SYSTEM_PREFIX))
                .is_some_and(|arch| !arch.is_empty());

            if is_qemu && is_executable(entry.path()) {
                found.insert(entry.path().to_path_buf());
            }
        }
    }

    tracing::debug!(count = found.len(), "Discovered QEMU executables");
    found.into_iter().collect()
}

/// Check whether `name` resolves to an executable file on `PATH`.
pub fn can_execute(name: &str) -> bool {
    path_dirs().any(|dir| is_executable(&dir.join(name)))
}

fn path_dirs() -> impl Iterator<Item = PathBuf> {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_finds_only_executable_qemu_system_binaries() {
        let dir = TempDir::new().unwrap();
        let x86 = touch(dir.path(), "qemu-system-x86_64", 0o755);
        let arm = touch(dir.path(), "qemu-system-aarch64", 0o755);
        touch(dir.path(), "qemu-system-riscv64", 0o644);
        touch(dir.path(), "qemu-img", 0o755);
        touch(dir.path(), "qemu-system-", 0o755);

        let found = find_qemu_executables_in(&[dir.path().to_path_buf()]);
        assert_eq!(found, vec![arm, x86]);
    }

    #[test]
    fn test_skips_missing_dirs_and_dedups() {
        let dir = TempDir::new().unwrap();
        let x86 = touch(dir.path(), "qemu-system-x86_64", 0o755);

        let found = find_qemu_executables_in(&[
            dir.path().join("missing"),
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
        ]);
        assert_eq!(found, vec![x86]);
    }

    #[test]
    fn test_can_execute_sh() {
        assert!(can_execute("sh"));
        assert!(!can_execute("definitely-not-a-real-binary-qlaunch"));
    }
}
