//! Run sessions.
//!
//! A session sequences an optional build stage and a mandatory run stage,
//! relays their output, and reports one [`SessionOutcome`].
//!
//! ## Architecture
//!
//! ```text
//! Session (handle, Clone)
//!     ├── commands ──────────► Supervisor task (owns stages + state)
//!     ├── watch<SessionPhase> ◄──┤
//!     ├── watch<Outcome>      ◄──┤
//!     └── SessionOutput       ◄──┘ merged stdout/stderr of build + run
//! ```
//!
//! Dropping every handle requests termination. Output that nobody takes
//! stays queued until [`Session::discard_output`] is called.

mod state;
mod supervisor;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use qlaunch_shared::{QlaunchError, QlaunchResult};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub use state::{SessionOutcome, SessionPhase};
pub(crate) use supervisor::{SessionCommand, Supervisor};

use crate::config::SessionConfig;
use crate::stage::OutputChunk;

/// Merged output of a session, in arrival order.
///
/// Ends once the session outcome is about to be published.
pub struct SessionOutput {
    inner: UnboundedReceiverStream<OutputChunk>,
}

impl SessionOutput {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<OutputChunk>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

impl Stream for SessionOutput {
    type Item = OutputChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

struct SessionShared {
    id: String,
    config: SessionConfig,
    commands: mpsc::UnboundedSender<SessionCommand>,
    phase: watch::Receiver<SessionPhase>,
    outcome: watch::Receiver<Option<SessionOutcome>>,
    output: Mutex<Option<SessionOutput>>,
}

/// Handle to a run session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        id: String,
        config: SessionConfig,
        commands: mpsc::UnboundedSender<SessionCommand>,
        phase: watch::Receiver<SessionPhase>,
        outcome: watch::Receiver<Option<SessionOutcome>>,
        output: SessionOutput,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                id,
                config,
                commands,
                phase,
                outcome,
                output: Mutex::new(Some(output)),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        *self.shared.phase.borrow()
    }

    /// Receiver that observes every phase change.
    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.shared.phase.clone()
    }

    /// Whether the outcome has been published.
    pub fn is_terminated(&self) -> bool {
        self.shared.outcome.borrow().is_some()
    }

    /// Aggregate exit code, once terminated.
    pub fn exit_code(&self) -> Option<i32> {
        self.shared.outcome.borrow().as_ref().map(|o| o.exit_code)
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.shared.outcome.borrow().clone()
    }

    /// Request termination of the session and its active stage.
    ///
    /// Idempotent; a no-op once the session has terminated.
    pub fn terminate(&self) {
        if self.is_terminated() {
            return;
        }
        // A closed channel means the supervisor is already finishing
        let _ = self.shared.commands.send(SessionCommand::Terminate);
    }

    /// Take the merged output stream. Only the first call gets it.
    ///
    /// Until the stream is taken or discarded, output is buffered in full.
    /// Callers that do not consume it should call [`Session::discard_output`].
    pub fn take_output(&self) -> Option<SessionOutput> {
        self.shared.output.lock().take()
    }

    /// Drop the output stream so stage output is no longer buffered.
    ///
    /// Stages keep running and their pipes keep draining. A no-op once the
    /// stream has been taken.
    pub fn discard_output(&self) {
        drop(self.shared.output.lock().take());
    }

    /// Wait for the session outcome.
    ///
    /// # Errors
    ///
    /// Returns `QlaunchError::Internal` if the supervisor task went away
    /// without publishing an outcome.
    pub async fn wait(&self) -> QlaunchResult<SessionOutcome> {
        let mut outcome = self.shared.outcome.clone();
        let published = outcome
            .wait_for(|o| o.is_some())
            .await
            .map_err(|_| {
                QlaunchError::Internal(format!(
                    "session {} supervisor exited without an outcome",
                    self.shared.id
                ))
            })?;

        (*published)
            .clone()
            .ok_or_else(|| QlaunchError::Internal("session outcome missing".into()))
    }
}
