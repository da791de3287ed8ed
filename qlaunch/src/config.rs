//! Session and launcher configuration.
//!
//! `SessionConfig` is fully resolved and immutable by the time a session is
//! started. `RunConfigFile` is the on-disk TOML form used by the CLI:
//!
//! ```toml
//! executable = "/usr/bin/qemu-system-x86_64"
//! arguments = "-m 512M"
//! allow_parallel = false
//! disk_image = "build-target"
//! build_target = "kernel"
//!
//! [debug]
//! enabled = true
//! tcp_port = 2345
//! wait_for_attach = true
//!
//! [build]
//! build_dir = "cmake-build-debug"
//!
//! [[build.targets]]
//! name = "kernel"
//! product = "cmake-build-debug/kernel.iso"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use qlaunch_shared::{QlaunchError, QlaunchResult};
use serde::{Deserialize, Serialize};

use crate::build::BuildProject;

/// gdb stub port used when none is configured.
pub const DEFAULT_GDB_TCP_PORT: u16 = 2345;

/// Where the VM's disk image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiskImageSource {
    /// Build a target first and boot its product.
    #[default]
    BuildTarget,
    /// Boot an existing image file.
    DirectFile,
}

/// Opaque reference to a build target, resolved by the build backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildTargetRef(String);

impl BuildTargetRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildTargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// gdb stub settings for the run phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugOptions {
    pub enabled: bool,
    pub tcp_port: u16,
    /// Keep the guest CPU stopped until a debugger attaches.
    pub wait_for_attach: bool,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            tcp_port: DEFAULT_GDB_TCP_PORT,
            wait_for_attach: true,
        }
    }
}

/// Resolved configuration of one run session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep a previously launched VM running alongside the new one.
    pub allow_parallel: bool,
    pub disk_image: DiskImageSource,
    /// Required when `disk_image` is `build-target`.
    pub build_target: Option<BuildTargetRef>,
    /// Required when `disk_image` is `direct-file`.
    pub direct_file: Option<PathBuf>,
    /// QEMU system emulator to launch.
    pub executable: PathBuf,
    /// Extra arguments, passed to QEMU as one verbatim token.
    pub arguments: String,
    pub debug: DebugOptions,
}

impl SessionConfig {
    /// Session booting an existing image.
    pub fn direct_file(executable: impl Into<PathBuf>, image: impl Into<PathBuf>) -> Self {
        Self {
            disk_image: DiskImageSource::DirectFile,
            direct_file: Some(image.into()),
            executable: executable.into(),
            ..Self::default()
        }
    }

    /// Session building `target` and booting its product.
    pub fn build_target(executable: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            disk_image: DiskImageSource::BuildTarget,
            build_target: Some(BuildTargetRef::new(target)),
            executable: executable.into(),
            ..Self::default()
        }
    }

    /// Check the parts of the configuration that do not depend on the build
    /// backend.
    ///
    /// # Errors
    ///
    /// Returns `QlaunchError::Config` for a missing executable or a missing
    /// direct image file.
    pub fn validate(&self) -> QlaunchResult<()> {
        if self.executable.as_os_str().is_empty() {
            return Err(QlaunchError::Config("no QEMU executable configured".into()));
        }

        if self.disk_image == DiskImageSource::DirectFile && self.direct_file.is_none() {
            return Err(QlaunchError::Config(
                "disk image source is direct-file but no image file is set".into(),
            ));
        }

        Ok(())
    }
}

/// Options for a [`crate::Launcher`].
#[derive(Debug, Clone, Default)]
pub struct LauncherOptions {
    /// Explicit PID marker path. Must be absolute, since it is matched
    /// against the `-pidfile` argument of running VMs. `None` uses the
    /// host-lifetime temp marker.
    pub marker_path: Option<PathBuf>,
    /// Build project for `build-target` sessions.
    pub build: Option<BuildProject>,
}

/// On-disk run configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunConfigFile {
    #[serde(flatten)]
    pub session: SessionConfig,
    #[serde(default)]
    pub build: Option<BuildProject>,
}

impl RunConfigFile {
    /// Parse TOML without touching the filesystem.
    pub fn parse(content: &str) -> QlaunchResult<Self> {
        toml::from_str(content)
            .map_err(|e| QlaunchError::Config(format!("Invalid run configuration: {}", e)))
    }

    /// Load a run configuration file.
    ///
    /// Relative paths inside the file are resolved against the file's
    /// directory. A bare executable name is kept as-is so that it is looked
    /// up on `PATH` at spawn time.
    pub fn load(path: &Path) -> QlaunchResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            QlaunchError::Config(format!(
                "Failed to read run configuration {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut file = Self::parse(&content)?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        file.resolve_relative_to(base);

        tracing::debug!(path = %path.display(), "Loaded run configuration");
        Ok(file)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        if let Some(image) = self.session.direct_file.take() {
            self.session.direct_file = Some(resolve(base, image));
        }

        if self.session.executable.components().count() > 1 {
            let executable = std::mem::take(&mut self.session.executable);
            self.session.executable = resolve(base, executable);
        }

        if let Some(build) = self.build.as_mut() {
            let root = std::mem::take(&mut build.root);
            build.root = resolve(base, root);
        }
    }
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_plugin_defaults() {
        let config = SessionConfig::default();
        assert!(!config.allow_parallel);
        assert_eq!(config.disk_image, DiskImageSource::BuildTarget);
        assert!(config.debug.enabled);
        assert_eq!(config.debug.tcp_port, 2345);
        assert!(config.debug.wait_for_attach);
    }

    #[test]
    fn test_parse_full_file() {
        let file = RunConfigFile::parse(
            r#"
            executable = "/usr/bin/qemu-system-i386"
            arguments = "-m 64M"
            allow_parallel = true
            disk_image = "build-target"
            build_target = "kernel"

            [debug]
            enabled = true
            tcp_port = 1234
            wait_for_attach = false

            [build]
            build_dir = "out"

            [[build.targets]]
            name = "kernel"
            product = "out/kernel.iso"
            "#,
        )
        .unwrap();

        let session = &file.session;
        assert_eq!(session.executable, PathBuf::from("/usr/bin/qemu-system-i386"));
        assert_eq!(session.arguments, "-m 64M");
        assert!(session.allow_parallel);
        assert_eq!(session.disk_image, DiskImageSource::BuildTarget);
        assert_eq!(session.build_target, Some(BuildTargetRef::new("kernel")));
        assert_eq!(session.debug.tcp_port, 1234);
        assert!(!session.debug.wait_for_attach);

        let build = file.build.unwrap();
        assert_eq!(build.program, "cmake");
        assert_eq!(build.targets.len(), 1);
        assert_eq!(build.targets[0].name, "kernel");
    }

    #[test]
    fn test_parse_rejects_unknown_source() {
        let err = RunConfigFile::parse(r#"disk_image = "floppy""#).unwrap_err();
        assert!(matches!(err, QlaunchError::Config(_)));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            r#"
            executable = "qemu-system-x86_64"
            disk_image = "direct-file"
            direct_file = "images/os.iso"

            [build]
            build_dir = "out"
            "#,
        )
        .unwrap();

        let file = RunConfigFile::load(&path).unwrap();
        assert_eq!(file.session.executable, PathBuf::from("qemu-system-x86_64"));
        assert_eq!(
            file.session.direct_file,
            Some(dir.path().join("images/os.iso"))
        );
        assert_eq!(file.build.unwrap().root, dir.path().to_path_buf());
    }

    #[test]
    fn test_validate() {
        assert!(SessionConfig::direct_file("qemu", "/os.iso").validate().is_ok());
        assert!(SessionConfig::build_target("qemu", "kernel").validate().is_ok());

        let mut missing_image = SessionConfig::direct_file("qemu", "/os.iso");
        missing_image.direct_file = None;
        assert!(missing_image.validate().unwrap_err().is_configuration());

        let no_executable = SessionConfig::direct_file("", "/os.iso");
        assert!(no_executable.validate().unwrap_err().is_configuration());
    }
}
