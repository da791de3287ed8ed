//! Run-phase command line assembly.
//!
//! The argument order is a compatibility contract for tooling that inspects
//! the launched command line:
//!
//! ```text
//! <executable>
//! -cdrom <absolute image path>
//! [-s | -gdb tcp::<port>] [-S]        only when debugging is enabled
//! -pidfile <marker path>              only when the marker is enabled
//! [<extra arguments>]                 one verbatim token, omitted when empty
//! ```

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::{DebugOptions, SessionConfig};

/// QEMU flags used on the run-phase command line.
pub mod flags {
    /// Attach a disk image as a CD-ROM.
    pub const DISK_IMAGE: &str = "-cdrom";
    /// Shorthand for `-gdb tcp::1234`.
    pub const DEBUG_STUB_SHORT: &str = "-s";
    /// Open a gdb stub on an explicit address.
    pub const DEBUG_STUB: &str = "-gdb";
    /// Freeze the CPU at startup until a debugger continues it.
    pub const WAIT_FOR_DEBUGGER: &str = "-S";
    /// Have QEMU write its pid to a file.
    pub const PID_FILE: &str = "-pidfile";
}

/// Port QEMU's `-s` shorthand listens on.
pub const DEFAULT_DEBUG_STUB_PORT: u16 = 1234;

/// Fully assembled run-phase command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommandLine {
    program: PathBuf,
    args: Vec<OsString>,
}

impl RunCommandLine {
    /// Assemble the command line for `image`.
    ///
    /// `image` is used as given; callers pass an absolute path. No I/O
    /// happens here.
    pub fn build(config: &SessionConfig, image: &Path, marker: Option<&Path>) -> Self {
        let mut args: Vec<OsString> = Vec::new();

        args.push(flags::DISK_IMAGE.into());
        args.push(image.as_os_str().to_owned());

        push_debug_flags(&mut args, &config.debug);

        if let Some(marker) = marker {
            args.push(flags::PID_FILE.into());
            args.push(marker.as_os_str().to_owned());
        }

        if !config.arguments.is_empty() {
            args.push(config.arguments.clone().into());
        }

        Self {
            program: config.executable.clone(),
            args,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Whether `flag` appears as a standalone argument.
    pub fn has_arg(&self, flag: impl AsRef<OsStr>) -> bool {
        let flag = flag.as_ref();
        self.args.iter().any(|arg| arg == flag)
    }

    /// A ready-to-spawn command.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

fn push_debug_flags(args: &mut Vec<OsString>, debug: &DebugOptions) {
    if !debug.enabled {
        return;
    }

    if debug.tcp_port == DEFAULT_DEBUG_STUB_PORT {
        args.push(flags::DEBUG_STUB_SHORT.into());
    } else {
        args.push(flags::DEBUG_STUB.into());
        args.push(format!("tcp::{}", debug.tcp_port).into());
    }

    if debug.wait_for_attach {
        args.push(flags::WAIT_FOR_DEBUGGER.into());
    }
}

impl fmt::Display for RunCommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskImageSource;

    fn config(debug: DebugOptions, arguments: &str) -> SessionConfig {
        SessionConfig {
            allow_parallel: false,
            disk_image: DiskImageSource::DirectFile,
            build_target: None,
            direct_file: Some(PathBuf::from("/images/os.iso")),
            executable: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            arguments: arguments.to_string(),
            debug,
        }
    }

    fn debug(enabled: bool, tcp_port: u16, wait_for_attach: bool) -> DebugOptions {
        DebugOptions {
            enabled,
            tcp_port,
            wait_for_attach,
        }
    }

    fn args_of(line: &RunCommandLine) -> Vec<String> {
        line.args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_full_order() {
        let line = RunCommandLine::build(
            &config(debug(true, 4444, true), "-m 512M -nographic"),
            Path::new("/images/os.iso"),
            Some(Path::new("/tmp/qlaunch-qemu-1.pid")),
        );

        assert_eq!(line.program(), Path::new("/usr/bin/qemu-system-x86_64"));
        assert_eq!(
            args_of(&line),
            vec![
                "-cdrom",
                "/images/os.iso",
                "-gdb",
                "tcp::4444",
                "-S",
                "-pidfile",
                "/tmp/qlaunch-qemu-1.pid",
                "-m 512M -nographic",
            ]
        );
    }

    #[test]
    fn test_default_port_uses_short_flag() {
        let line = RunCommandLine::build(
            &config(debug(true, 1234, false), ""),
            Path::new("/images/os.iso"),
            Some(Path::new("/tmp/m.pid")),
        );

        assert!(line.has_arg("-s"));
        assert!(!line.has_arg("-gdb"));
        assert!(!line.has_arg("tcp::1234"));
        assert!(!line.has_arg("-S"));
    }

    #[test]
    fn test_custom_port_uses_address_form() {
        let line = RunCommandLine::build(
            &config(debug(true, 4444, false), ""),
            Path::new("/images/os.iso"),
            Some(Path::new("/tmp/m.pid")),
        );

        assert!(!line.has_arg("-s"));
        assert!(line.has_arg("-gdb"));
        assert!(line.has_arg("tcp::4444"));
    }

    #[test]
    fn test_debug_disabled_omits_stub_flags() {
        let line = RunCommandLine::build(
            &config(debug(false, 1234, true), ""),
            Path::new("/images/os.iso"),
            Some(Path::new("/tmp/m.pid")),
        );

        assert_eq!(
            args_of(&line),
            vec!["-cdrom", "/images/os.iso", "-pidfile", "/tmp/m.pid"]
        );
    }

    #[test]
    fn test_disabled_marker_omits_pidfile() {
        let line = RunCommandLine::build(
            &config(debug(false, 1234, false), "-snapshot"),
            Path::new("/images/os.iso"),
            None,
        );

        assert_eq!(
            args_of(&line),
            vec!["-cdrom", "/images/os.iso", "-snapshot"]
        );
    }

    #[test]
    fn test_display() {
        let line = RunCommandLine::build(
            &config(debug(true, 1234, true), ""),
            Path::new("/images/os.iso"),
            Some(Path::new("/tmp/m.pid")),
        );
        assert_eq!(
            line.to_string(),
            "/usr/bin/qemu-system-x86_64 -cdrom /images/os.iso -s -S -pidfile /tmp/m.pid"
        );
    }
}
