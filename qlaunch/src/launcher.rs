//! Launcher - entry point that starts run sessions.

use std::sync::Arc;

use qlaunch_shared::{QlaunchError, QlaunchResult};
use tokio::sync::{mpsc, watch};

use crate::build::{BuildDispatcher, CmakeBackend};
use crate::config::{LauncherOptions, SessionConfig};
use crate::marker::PidMarker;
use crate::session::{Session, SessionOutput, SessionPhase, Supervisor};

/// Starts sessions that share one PID marker and one build dispatcher.
///
/// Every session started from the same launcher (or from launchers using
/// the host marker) takes part in the same single-instance guard.
#[derive(Debug, Clone)]
pub struct Launcher {
    marker: PidMarker,
    dispatcher: BuildDispatcher,
}

impl Launcher {
    /// Create a launcher from options.
    ///
    /// # Errors
    ///
    /// Returns `QlaunchError::Config` if `marker_path` is not absolute.
    pub fn new(options: LauncherOptions) -> QlaunchResult<Self> {
        let marker = match options.marker_path {
            Some(path) if !path.is_absolute() => {
                return Err(QlaunchError::Config(format!(
                    "marker_path must be an absolute path, got: {}",
                    path.display()
                )));
            }
            Some(path) => PidMarker::at(path),
            None => PidMarker::host(),
        };

        let dispatcher = match options.build {
            Some(project) => BuildDispatcher::new(Arc::new(CmakeBackend::new(project))),
            None => BuildDispatcher::none(),
        };

        tracing::debug!(marker = ?marker.path(), "Launcher created");

        Ok(Self::with_parts(marker, dispatcher))
    }

    /// Create a launcher from explicit collaborators.
    pub fn with_parts(marker: PidMarker, dispatcher: BuildDispatcher) -> Self {
        Self { marker, dispatcher }
    }

    pub fn marker(&self) -> &PidMarker {
        &self.marker
    }

    /// Start a session for `config`.
    ///
    /// Returns immediately; the session proceeds on a background task.
    /// Configuration problems surface as a `Failed` outcome, not as an error
    /// here. Must be called within a Tokio runtime.
    pub fn start(&self, config: SessionConfig) -> Session {
        let id = ulid::Ulid::new().to_string();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Init);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor::new(
            id.clone(),
            config.clone(),
            self.marker.clone(),
            self.dispatcher.clone(),
            command_rx,
            phase_tx,
            outcome_tx,
            output_tx,
        );
        tokio::spawn(supervisor.run());

        Session::new(
            id,
            config,
            command_tx,
            phase_rx,
            outcome_rx,
            SessionOutput::new(output_rx),
        )
    }
}
