//! Build-phase dispatch.
//!
//! ## Architecture
//!
//! - **BuildBackend**: resolves a target reference to a concrete
//!   configuration and starts it as a build stage
//! - **BuildDispatcher**: the session-facing entry point; distinguishes "no
//!   target selected" from "no configuration for that target"
//!
//! The backend owns how the artifact is produced. The session only sees a
//! build [`StageProcess`] and the product path it promises to leave behind.

mod cmake;

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use qlaunch_shared::{QlaunchError, QlaunchResult};
use tokio::process::Command;

use crate::config::BuildTargetRef;
use crate::stage::{StageKind, StageProcess};

pub use cmake::{BuildProject, BuildTargetSpec, CmakeBackend};

/// Concrete build invocation for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfiguration {
    pub target: BuildTargetRef,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    /// Absolute path of the disk image the build produces.
    pub product: PathBuf,
}

impl BuildConfiguration {
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// A started build.
#[derive(Debug)]
pub struct BuildJob {
    pub stage: StageProcess,
    pub product: PathBuf,
}

/// Trait for build systems that can produce a disk image.
#[async_trait::async_trait]
pub trait BuildBackend: Send + Sync {
    /// Map a target reference to its build configuration.
    ///
    /// # Errors
    /// - `QlaunchError::NoBuildConfiguration` if the target is unknown
    fn resolve(&self, target: &BuildTargetRef) -> QlaunchResult<BuildConfiguration>;

    /// Start the build as a [`StageKind::Build`] stage.
    async fn start(&self, config: &BuildConfiguration) -> QlaunchResult<StageProcess> {
        StageProcess::spawn(StageKind::Build, config.to_command())
    }
}

/// Resolves and starts builds for sessions.
#[derive(Clone, Default)]
pub struct BuildDispatcher {
    backend: Option<Arc<dyn BuildBackend>>,
}

impl std::fmt::Debug for BuildDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildDispatcher")
            .field("has_backend", &self.backend.is_some())
            .finish()
    }
}

impl BuildDispatcher {
    pub fn new(backend: Arc<dyn BuildBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// A dispatcher with no build system; every target is unconfigured.
    pub fn none() -> Self {
        Self { backend: None }
    }

    /// Resolve `target` and start its build. No retries.
    ///
    /// # Errors
    /// - `QlaunchError::NoTargetSelected` when `target` is `None`
    /// - `QlaunchError::NoBuildConfiguration` when nothing can build it
    /// - `QlaunchError::Spawn` when the build process cannot start
    pub async fn dispatch(&self, target: Option<&BuildTargetRef>) -> QlaunchResult<BuildJob> {
        let target = target.ok_or(QlaunchError::NoTargetSelected)?;

        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| QlaunchError::NoBuildConfiguration(target.to_string()))?;

        let config = backend.resolve(target)?;
        tracing::debug!(
            target = %target,
            product = %config.product.display(),
            "Resolved build configuration"
        );

        let stage = backend.start(&config).await?;
        Ok(BuildJob {
            stage,
            product: config.product,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        starts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl BuildBackend for CountingBackend {
        fn resolve(&self, target: &BuildTargetRef) -> QlaunchResult<BuildConfiguration> {
            if target.as_str() != "kernel" {
                return Err(QlaunchError::NoBuildConfiguration(target.to_string()));
            }
            Ok(BuildConfiguration {
                target: target.clone(),
                program: PathBuf::from("true"),
                args: Vec::new(),
                working_dir: None,
                product: PathBuf::from("/out/kernel.iso"),
            })
        }

        async fn start(&self, config: &BuildConfiguration) -> QlaunchResult<StageProcess> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            StageProcess::spawn(StageKind::Build, config.to_command())
        }
    }

    #[tokio::test]
    async fn test_no_target_selected() {
        let backend = Arc::new(CountingBackend::default());
        let dispatcher = BuildDispatcher::new(backend.clone());

        let err = dispatcher.dispatch(None).await.unwrap_err();
        assert!(matches!(err, QlaunchError::NoTargetSelected));
        assert_eq!(backend.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_target_has_no_configuration() {
        let backend = Arc::new(CountingBackend::default());
        let dispatcher = BuildDispatcher::new(backend.clone());

        let err = dispatcher
            .dispatch(Some(&BuildTargetRef::new("docs")))
            .await
            .unwrap_err();
        assert!(matches!(err, QlaunchError::NoBuildConfiguration(ref t) if t == "docs"));
        assert_eq!(backend.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_backend() {
        let err = BuildDispatcher::none()
            .dispatch(Some(&BuildTargetRef::new("kernel")))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dispatch_starts_build_stage() {
        let backend = Arc::new(CountingBackend::default());
        let dispatcher = BuildDispatcher::new(backend.clone());

        let mut job = dispatcher
            .dispatch(Some(&BuildTargetRef::new("kernel")))
            .await
            .unwrap();
        assert_eq!(job.product, PathBuf::from("/out/kernel.iso"));
        assert_eq!(job.stage.kind(), StageKind::Build);
        assert_eq!(job.stage.wait().await, 0);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
    }
}
