//! CMake build backend.
//!
//! Builds a target with `cmake --build <build_dir> --target <name>` and
//! boots the product file the project declares for it.

use std::path::{Path, PathBuf};

use qlaunch_shared::{QlaunchError, QlaunchResult};
use serde::{Deserialize, Serialize};

use super::{BuildBackend, BuildConfiguration};
use crate::config::BuildTargetRef;

fn default_program() -> String {
    "cmake".to_string()
}

/// A buildable target and the disk image it produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTargetSpec {
    pub name: String,
    /// Relative paths are resolved against the project root.
    pub product: PathBuf,
}

/// A configured CMake build tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProject {
    #[serde(default = "default_program")]
    pub program: String,
    /// Project root; empty means the current directory.
    #[serde(default)]
    pub root: PathBuf,
    pub build_dir: PathBuf,
    #[serde(default)]
    pub targets: Vec<BuildTargetSpec>,
}

impl BuildProject {
    pub fn new(root: impl Into<PathBuf>, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: default_program(),
            root: root.into(),
            build_dir: build_dir.into(),
            targets: Vec::new(),
        }
    }

    pub fn with_target(mut self, name: impl Into<String>, product: impl Into<PathBuf>) -> Self {
        self.targets.push(BuildTargetSpec {
            name: name.into(),
            product: product.into(),
        });
        self
    }

    fn root_dir(&self) -> &Path {
        if self.root.as_os_str().is_empty() {
            Path::new(".")
        } else {
            &self.root
        }
    }

    fn under_root(&self, path: &Path) -> QlaunchResult<PathBuf> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir().join(path)
        };
        Ok(std::path::absolute(&joined)?)
    }
}

/// [`BuildBackend`] driving `cmake --build`.
#[derive(Debug, Clone)]
pub struct CmakeBackend {
    project: BuildProject,
}

impl CmakeBackend {
    pub fn new(project: BuildProject) -> Self {
        Self { project }
    }

    pub fn project(&self) -> &BuildProject {
        &self.project
    }
}

#[async_trait::async_trait]
impl BuildBackend for CmakeBackend {
    fn resolve(&self, target: &BuildTargetRef) -> QlaunchResult<BuildConfiguration> {
        let spec = self
            .project
            .targets
            .iter()
            .find(|t| t.name == target.as_str())
            .ok_or_else(|| QlaunchError::NoBuildConfiguration(target.to_string()))?;

        let build_dir = self.project.under_root(&self.project.build_dir)?;
        let product = self.project.under_root(&spec.product)?;

        Ok(BuildConfiguration {
            target: target.clone(),
            program: PathBuf::from(&self.project.program),
            args: vec![
                "--build".into(),
                build_dir.into_os_string(),
                "--target".into(),
                spec.name.clone().into(),
            ],
            working_dir: Some(self.project.under_root(Path::new(""))?),
            product,
        })
    }
}
