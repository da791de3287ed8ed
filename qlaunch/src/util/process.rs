//! Process liveness checks and forced termination by PID.

use std::path::Path;

/// Returns `true` when `pid` may be signalled without hitting something
/// we must never kill: pid 0 and negative values address process groups,
/// pid 1 is init, and our own pid is the launcher itself.
pub fn is_killable_pid(pid: u32) -> bool {
    match i32::try_from(pid) {
        Ok(raw) => raw > 1 && pid != std::process::id(),
        Err(_) => false,
    }
}

/// Kill a process with SIGKILL.
///
/// Does not wait for the process to die.
///
/// # Returns
/// * `true` - Kill signal delivered, or the process doesn't exist
/// * `false` - Refused (unsafe pid) or failed to kill (permission denied)
#[cfg(unix)]
pub fn kill_process(pid: u32) -> bool {
    if !is_killable_pid(pid) {
        return false;
    }
    unsafe { libc::kill(pid as i32, libc::SIGKILL) == 0 || !is_process_alive(pid) }
}

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
///
/// # Returns
/// * `true` - Process exists
/// * `false` - Process does not exist or permission denied
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => unsafe { libc::kill(raw, 0) == 0 },
        _ => false,
    }
}

#[cfg(not(unix))]
pub fn kill_process(pid: u32) -> bool {
    use sysinfo::{Pid, System};

    if !is_killable_pid(pid) {
        return false;
    }

    let mut sys = System::new();
    let pid_obj = Pid::from_u32(pid);
    sys.refresh_process(pid_obj);

    match sys.process(pid_obj) {
        Some(process) => process.kill(),
        None => true,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    use sysinfo::{Pid, System};

    let mut sys = System::new();
    let pid_obj = Pid::from_u32(pid);
    sys.refresh_process(pid_obj)
}

/// Check whether `pid` is a process launched with `marker` on its command
/// line, i.e. a VM started by us with `-pidfile <marker>`.
///
/// Guards against killing an unrelated process that reuses a recorded pid.
///
/// # Returns
/// * `true` - Process exists and one of its arguments is `marker`
/// * `false` - Process is gone, unreadable, or not ours
#[cfg(target_os = "linux")]
pub fn is_marker_owner(pid: u32, marker: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let cmdline_path = format!("/proc/{}/cmdline", pid);
    let Ok(cmdline) = std::fs::read(&cmdline_path) else {
        return false;
    };

    let marker = marker.as_os_str().as_bytes();
    cmdline.split(|&b| b == 0).any(|arg| arg == marker)
}

#[cfg(not(target_os = "linux"))]
pub fn is_marker_owner(pid: u32, marker: &Path) -> bool {
    use sysinfo::{Pid, System};

    let mut sys = System::new();
    let pid_obj = Pid::from_u32(pid);
    sys.refresh_process(pid_obj);

    let marker = marker.to_string_lossy();
    match sys.process(pid_obj) {
        Some(process) => process.cmd().iter().any(|arg| *arg == marker),
        None => false,
    }
}

/// Map an exit status to a single integer code.
///
/// Signal deaths are reported shell-style as `128 + signal`, so a
/// force-terminated stage is always nonzero.
pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}
