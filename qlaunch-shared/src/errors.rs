//! Error taxonomy for qlaunch sessions.
//!
//! Configuration problems are detected before any process is spawned,
//! spawn problems while starting a stage, and stage failures after a
//! child exits with a nonzero status. The supervisor folds every one of
//! them into the session's failure latch; they only surface to callers
//! through `Result`s on the setup paths and as the recorded failure
//! reason of a finished session.

use thiserror::Error;

/// Result alias used throughout qlaunch.
pub type QlaunchResult<T> = Result<T, QlaunchError>;

#[derive(Debug, Error)]
pub enum QlaunchError {
    /// Invalid or incomplete session configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The session asked for a build but no target was selected.
    #[error("no build target selected")]
    NoTargetSelected,

    /// The selected target has no build configuration.
    #[error("no build configuration for target '{0}'")]
    NoBuildConfiguration(String),

    /// The OS refused to start a stage process.
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// A stage process exited with a nonzero code.
    #[error("{stage} stage exited with code {code}")]
    StageFailed { stage: String, code: i32 },

    /// The session was terminated on request.
    #[error("session cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl QlaunchError {
    /// Whether this error was raised before any process was spawned.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            QlaunchError::Config(_)
                | QlaunchError::NoTargetSelected
                | QlaunchError::NoBuildConfiguration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors() {
        assert!(QlaunchError::NoTargetSelected.is_configuration());
        assert!(QlaunchError::NoBuildConfiguration("kernel".into()).is_configuration());
        assert!(QlaunchError::Config("missing image".into()).is_configuration());
        assert!(!QlaunchError::Spawn("enoent".into()).is_configuration());
        assert!(!QlaunchError::Cancelled.is_configuration());
    }

    #[test]
    fn test_display() {
        let err = QlaunchError::StageFailed {
            stage: "build".into(),
            code: 2,
        };
        assert_eq!(err.to_string(), "build stage exited with code 2");
        assert_eq!(
            QlaunchError::NoBuildConfiguration("kernel".into()).to_string(),
            "no build configuration for target 'kernel'"
        );
    }
}
