//! Session supervisor actor.
//!
//! One task per session owns every piece of mutable session state. Handles
//! talk to it through a command channel and observe it through `watch`
//! channels, so a child exit racing a termination request is serialized
//! here and yields exactly one outcome.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use qlaunch_shared::QlaunchError;
use tokio::sync::{mpsc, watch};

use super::state::{SessionOutcome, SessionPhase};
use crate::build::BuildDispatcher;
use crate::command::RunCommandLine;
use crate::config::{DiskImageSource, SessionConfig};
use crate::marker::PidMarker;
use crate::stage::{OutputChunk, StageEvent, StageKind, StageProcess};

/// How long a cancelled stage may take to report its exit.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Requests from session handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionCommand {
    Terminate,
}

pub(crate) struct Supervisor {
    id: String,
    config: SessionConfig,
    marker: PidMarker,
    dispatcher: BuildDispatcher,

    commands: mpsc::UnboundedReceiver<SessionCommand>,
    phase_tx: watch::Sender<SessionPhase>,
    outcome_tx: watch::Sender<Option<SessionOutcome>>,
    output_tx: Option<mpsc::UnboundedSender<OutputChunk>>,

    active: Option<StageProcess>,
    /// Product of a finished build, consumed by the run phase.
    product: Option<PathBuf>,
    failed: bool,
    failure: Option<String>,

    started_at: DateTime<Utc>,
    build_exit_code: Option<i32>,
    run_exit_code: Option<i32>,
    run_pid: Option<u32>,
}

/// What the event loop does after handling one event.
enum Step {
    Continue,
    Finish(SessionPhase),
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        config: SessionConfig,
        marker: PidMarker,
        dispatcher: BuildDispatcher,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        phase_tx: watch::Sender<SessionPhase>,
        outcome_tx: watch::Sender<Option<SessionOutcome>>,
        output_tx: mpsc::UnboundedSender<OutputChunk>,
    ) -> Self {
        Self {
            id,
            config,
            marker,
            dispatcher,
            commands,
            phase_tx,
            outcome_tx,
            output_tx: Some(output_tx),
            active: None,
            product: None,
            failed: false,
            failure: None,
            started_at: Utc::now(),
            build_exit_code: None,
            run_exit_code: None,
            run_pid: None,
        }
    }

    /// Drive the session to its outcome.
    pub(crate) async fn run(mut self) {
        tracing::info!(
            session_id = %self.id,
            source = ?self.config.disk_image,
            allow_parallel = self.config.allow_parallel,
            "Session started"
        );

        let mut step = self.start().await;
        while let Step::Continue = step {
            step = self.next_step().await;
        }

        if let Step::Finish(phase) = step {
            self.finish(phase);
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Init → Building | Running | Failed | Cancelled.
    async fn start(&mut self) -> Step {
        if self.termination_pending() {
            return self.cancel().await;
        }

        if let Err(e) = self.config.validate() {
            return self.fail(e);
        }

        match self.config.disk_image {
            DiskImageSource::BuildTarget => self.start_build().await,
            DiskImageSource::DirectFile => {
                let Some(image) = self.config.direct_file.clone() else {
                    return self.fail(QlaunchError::Config(
                        "no disk image file configured".into(),
                    ));
                };
                self.start_run(image)
            }
        }
    }

    async fn start_build(&mut self) -> Step {
        self.set_phase(SessionPhase::Building);

        let target = self.config.build_target.clone();
        match self.dispatcher.dispatch(target.as_ref()).await {
            Ok(job) => {
                tracing::info!(
                    session_id = %self.id,
                    pid = job.stage.pid(),
                    product = %job.product.display(),
                    command = %job.stage.command_line(),
                    "Build started"
                );
                self.product = Some(job.product);
                self.active = Some(job.stage);
                Step::Continue
            }
            Err(e) => self.fail(e),
        }
    }

    /// → Running. Kills the previously active VM unless parallel runs are
    /// allowed, then spawns and records the run stage. The phase changes
    /// only once the stage is alive and recorded.
    fn start_run(&mut self, image: PathBuf) -> Step {
        if self.termination_pending() {
            return self.cancelled();
        }

        let image = match std::path::absolute(&image) {
            Ok(image) => image,
            Err(e) => {
                return self.fail(QlaunchError::Config(format!(
                    "Invalid disk image path {}: {}",
                    image.display(),
                    e
                )));
            }
        };

        if !self.marker.is_enabled() {
            tracing::debug!(session_id = %self.id, "No PID marker, single-instance guard off");
        } else if !self.config.allow_parallel {
            self.marker.kill_previously_active();
        }

        let line = RunCommandLine::build(&self.config, &image, self.marker.path());
        let stage = match StageProcess::spawn(StageKind::Run, line.to_command()) {
            Ok(stage) => stage,
            Err(e) => return self.fail(e),
        };

        let pid = stage.pid();
        if let Err(e) = self.marker.record_active(pid) {
            tracing::warn!(session_id = %self.id, pid, error = %e, "Failed to record run process");
        }

        tracing::info!(
            session_id = %self.id,
            pid,
            image = %image.display(),
            command = %stage.command_line(),
            "VM started"
        );
        self.run_pid = Some(pid);
        self.active = Some(stage);
        self.set_phase(SessionPhase::Running);
        Step::Continue
    }

    /// Wait for the next command or stage event.
    async fn next_step(&mut self) -> Step {
        let Some(stage) = self.active.as_mut() else {
            return self.settled();
        };

        tokio::select! {
            biased;

            command = self.commands.recv() => {
                match command {
                    Some(SessionCommand::Terminate) => {
                        tracing::info!(session_id = %self.id, "Termination requested");
                    }
                    None => {
                        tracing::info!(session_id = %self.id, "All session handles dropped, terminating");
                    }
                }
                self.cancel().await
            }

            event = stage.next_event() => match event {
                Some(StageEvent::Output(chunk)) => {
                    self.relay(chunk);
                    Step::Continue
                }
                Some(StageEvent::Exited(code)) => self.on_stage_exit(code),
                None => self.on_stage_exit(-1),
            },
        }
    }

    fn on_stage_exit(&mut self, code: i32) -> Step {
        let Some(stage) = self.active.take() else {
            return self.settled();
        };
        let kind = stage.kind();
        drop(stage);

        tracing::info!(session_id = %self.id, stage = %kind, exit_code = code, "Stage exited");

        match kind {
            StageKind::Build => {
                self.build_exit_code = Some(code);
                if code != 0 {
                    return self.fail(QlaunchError::StageFailed {
                        stage: kind.to_string(),
                        code,
                    });
                }
                match self.product.take() {
                    Some(product) => self.start_run(product),
                    None => self.fail(QlaunchError::Internal(
                        "build finished without a product".into(),
                    )),
                }
            }
            StageKind::Run => {
                self.run_exit_code = Some(code);
                if code != 0 {
                    return self.fail(QlaunchError::StageFailed {
                        stage: kind.to_string(),
                        code,
                    });
                }
                Step::Finish(SessionPhase::Succeeded)
            }
        }
    }

    /// Terminate the active stage and wait briefly for it to report.
    ///
    /// Output produced while dying is still relayed.
    async fn cancel(&mut self) -> Step {
        let Some(mut stage) = self.active.take() else {
            return self.cancelled();
        };

        self.latch(QlaunchError::Cancelled);
        stage.terminate();

        let kind = stage.kind();
        let drained = tokio::time::timeout(CANCEL_GRACE, async {
            while let Some(event) = stage.next_event().await {
                match event {
                    StageEvent::Output(chunk) => self.relay(chunk),
                    StageEvent::Exited(code) => return Some(code),
                }
            }
            None
        })
        .await;

        match drained {
            Ok(Some(code)) => {
                tracing::info!(session_id = %self.id, stage = %kind, exit_code = code, "Stage terminated");
                match kind {
                    StageKind::Build => self.build_exit_code = Some(code),
                    StageKind::Run => self.run_exit_code = Some(code),
                }
            }
            Ok(None) => {}
            Err(_) => {
                tracing::warn!(session_id = %self.id, stage = %kind, "Stage did not exit within grace period");
            }
        }

        Step::Finish(SessionPhase::Cancelled)
    }

    /// Cancelled with nothing running.
    fn cancelled(&mut self) -> Step {
        self.latch(QlaunchError::Cancelled);
        Step::Finish(SessionPhase::Cancelled)
    }

    fn fail(&mut self, error: QlaunchError) -> Step {
        self.latch(error);
        Step::Finish(SessionPhase::Failed)
    }

    /// No active stage and no pending transition.
    fn settled(&self) -> Step {
        if self.failed {
            Step::Finish(SessionPhase::Failed)
        } else {
            Step::Finish(SessionPhase::Succeeded)
        }
    }

    /// Publish the outcome. Closes the output stream first so that no chunk
    /// can be observed after the outcome.
    fn finish(&mut self, phase: SessionPhase) {
        self.output_tx = None;
        self.active = None;

        let exit_code = if self.failed { 1 } else { 0 };
        let outcome = SessionOutcome {
            session_id: self.id.clone(),
            phase,
            exit_code,
            failure: self.failure.clone(),
            build_exit_code: self.build_exit_code,
            run_exit_code: self.run_exit_code,
            run_pid: self.run_pid,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };

        self.set_phase(phase);
        tracing::info!(
            session_id = %self.id,
            phase = %phase,
            exit_code,
            failure = ?outcome.failure,
            "Session finished"
        );
        self.outcome_tx.send_replace(Some(outcome));
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Record a failure. The latch never resets; only the first reason is kept.
    fn latch(&mut self, error: QlaunchError) {
        if error.is_configuration() {
            tracing::warn!(session_id = %self.id, error = %error, "Session misconfigured");
        } else {
            tracing::warn!(session_id = %self.id, error = %error, "Session failed");
        }
        self.failed = true;
        if self.failure.is_none() {
            self.failure = Some(error.to_string());
        }
    }

    /// Forward a chunk to the output stream. Once the receiver is gone,
    /// later chunks are dropped here instead of queued.
    fn relay(&mut self, chunk: OutputChunk) {
        let Some(tx) = &self.output_tx else {
            return;
        };
        if tx.send(chunk).is_err() {
            tracing::debug!(session_id = %self.id, "Output receiver dropped, discarding stage output");
            self.output_tx = None;
        }
    }

    fn set_phase(&self, phase: SessionPhase) {
        let current = *self.phase_tx.borrow();
        if current == phase {
            return;
        }
        debug_assert!(current.can_transition_to(phase), "{current} -> {phase}");
        tracing::debug!(session_id = %self.id, from = %current, to = %phase, "Phase transition");
        self.phase_tx.send_replace(phase);
    }

    /// Whether a termination was requested before a stage could be spawned.
    /// A closed channel counts as a request.
    fn termination_pending(&mut self) -> bool {
        match self.commands.try_recv() {
            Ok(SessionCommand::Terminate) => true,
            Err(mpsc::error::TryRecvError::Disconnected) => true,
            Err(mpsc::error::TryRecvError::Empty) => false,
        }
    }
}
