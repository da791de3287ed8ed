//! Spawned stage process with output relay and exit notification.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use qlaunch_shared::{QlaunchError, QlaunchResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{OutputChunk, OutputKind, StageEvent, StageKind};
use crate::util::exit_code_of;

/// How long the monitor waits for the output readers after the child exits.
///
/// Grandchildren that inherited the pipes can keep them open forever; the
/// exit notification must not wait on them.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Read size for stage output. Each read is relayed as it arrives.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Exit code reported when the monitor vanished without a status.
const LOST_EXIT_CODE: i32 = -1;

/// One externally spawned OS process: the build or the run phase.
///
/// Dropping the handle kills the child.
pub struct StageProcess {
    kind: StageKind,
    command_line: String,
    pid: u32,
    kill_tx: Option<oneshot::Sender<()>>,
    output: mpsc::UnboundedReceiver<OutputChunk>,
    output_closed: bool,
    exit: oneshot::Receiver<i32>,
    finished: bool,
    terminated: Arc<AtomicBool>,
    exit_code: Arc<Mutex<Option<i32>>>,
}

impl fmt::Debug for StageProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageProcess")
            .field("kind", &self.kind)
            .field("pid", &self.pid)
            .field("command_line", &self.command_line)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl StageProcess {
    /// Spawn `command` as a stage with piped stdout/stderr.
    ///
    /// # Errors
    ///
    /// Returns `QlaunchError::Spawn` if the OS refuses to start the process
    /// (missing executable, permission denied, ...).
    pub fn spawn(kind: StageKind, mut command: Command) -> QlaunchResult<Self> {
        let command_line = describe(&command);

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            let err_msg = format!("{} stage `{}`: {}", kind, command_line, e);
            tracing::error!(stage = %kind, error = %e, "Failed to spawn stage process");
            QlaunchError::Spawn(err_msg)
        })?;

        let pid = child
            .id()
            .ok_or_else(|| QlaunchError::Internal(format!("{kind} stage exited before start")))?;

        let (output_tx, output) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(kind, OutputKind::Stdout, stdout, output_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(kind, OutputKind::Stderr, stderr, output_tx));
        }

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit) = oneshot::channel();
        let terminated = Arc::new(AtomicBool::new(false));
        let exit_code = Arc::new(Mutex::new(None));

        tracing::info!(stage = %kind, pid, command = %command_line, "Stage process started");

        {
            let terminated = Arc::clone(&terminated);
            let exit_code = Arc::clone(&exit_code);
            tokio::spawn(async move {
                // A dropped kill sender also resolves the receiver: the owner is gone.
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = &mut kill_rx => {
                        tracing::debug!(stage = %kind, pid, "Killing stage process");
                        if let Err(e) = child.start_kill() {
                            tracing::debug!(stage = %kind, pid, error = %e, "Kill request failed");
                        }
                        child.wait().await
                    }
                };

                let code = match status {
                    Ok(status) => exit_code_of(status),
                    Err(e) => {
                        tracing::warn!(stage = %kind, pid, error = %e, "Failed to wait for stage process");
                        LOST_EXIT_CODE
                    }
                };

                let drained = tokio::time::timeout(
                    OUTPUT_DRAIN_TIMEOUT,
                    futures::future::join_all(readers),
                )
                .await;
                if drained.is_err() {
                    tracing::debug!(stage = %kind, pid, "Output still open after exit, detaching readers");
                }

                *exit_code.lock() = Some(code);
                terminated.store(true, Ordering::SeqCst);
                tracing::info!(stage = %kind, pid, exit_code = code, "Stage process exited");
                let _ = exit_tx.send(code);
            });
        }

        Ok(Self {
            kind,
            command_line,
            pid,
            kill_tx: Some(kill_tx),
            output,
            output_closed: false,
            exit,
            finished: false,
            terminated,
            exit_code,
        })
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Human-readable command line, for logs and diagnostics.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Whether the process has exited.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Exit code, once the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Request forced termination.
    ///
    /// Idempotent; a no-op once the process has exited. The exit is still
    /// reported through [`StageProcess::next_event`].
    pub fn terminate(&mut self) {
        if self.is_terminated() {
            return;
        }
        if let Some(kill_tx) = self.kill_tx.take() {
            tracing::debug!(stage = %self.kind, pid = self.pid, "Termination requested");
            let _ = kill_tx.send(());
        }
    }

    /// Next lifecycle event.
    ///
    /// Yields every output chunk in production order, then exactly one
    /// `Exited`, then `None` forever. Cancel safe.
    pub async fn next_event(&mut self) -> Option<StageEvent> {
        loop {
            if self.finished {
                return None;
            }

            tokio::select! {
                biased;
                chunk = self.output.recv(), if !self.output_closed => match chunk {
                    Some(chunk) => return Some(StageEvent::Output(chunk)),
                    None => self.output_closed = true,
                },
                code = &mut self.exit => {
                    self.finished = true;
                    return Some(StageEvent::Exited(code.unwrap_or(LOST_EXIT_CODE)));
                }
            }
        }
    }

    /// Wait for the exit code, discarding any output not yet consumed.
    pub async fn wait(&mut self) -> i32 {
        loop {
            match self.next_event().await {
                Some(StageEvent::Exited(code)) => return code,
                Some(StageEvent::Output(_)) => continue,
                None => return self.exit_code().unwrap_or(LOST_EXIT_CODE),
            }
        }
    }
}

fn spawn_reader<R>(
    stage: StageKind,
    kind: OutputKind,
    mut stream: R,
    tx: mpsc::UnboundedSender<OutputChunk>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut pending = Vec::new();
        // Keep reading after the receiver is gone so the child never sees a closed pipe
        let mut relay = true;

        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(stage = %stage, stream = ?kind, error = %e, "Output read failed");
                    break;
                }
            };

            pending.extend_from_slice(&buf[..n]);
            let text = take_decodable(&mut pending);
            if relay && !text.is_empty() && tx.send(OutputChunk { stage, kind, text }).is_err() {
                relay = false;
            }
        }

        if relay && !pending.is_empty() {
            let text = String::from_utf8_lossy(&pending).into_owned();
            let _ = tx.send(OutputChunk { stage, kind, text });
        }
    })
}

/// Decode everything in `pending` except an incomplete UTF-8 sequence at
/// the end, which stays buffered for the next read. Invalid bytes become
/// U+FFFD.
fn take_decodable(pending: &mut Vec<u8>) -> String {
    let keep = incomplete_tail_len(pending);
    let tail = pending.split_off(pending.len() - keep);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = tail;
    text
}

/// Length of a truncated multi-byte sequence at the end of `bytes`.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let needed = match bytes[i] {
            0x80..=0xBF => continue,
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => 1,
        };
        let have = bytes.len() - i;
        return if needed > have { have } else { 0 };
    }
    0
}

fn describe(command: &Command) -> String {
    let std_command = command.as_std();
    let mut parts = vec![std_command.get_program().to_string_lossy().into_owned()];
    parts.extend(
        std_command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned()),
    );
    parts.join(" ")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    async fn collect(stage: &mut StageProcess) -> (Vec<OutputChunk>, i32) {
        let mut chunks = Vec::new();
        loop {
            match stage.next_event().await {
                Some(StageEvent::Output(chunk)) => chunks.push(chunk),
                Some(StageEvent::Exited(code)) => return (chunks, code),
                None => panic!("stage ended without exit event"),
            }
        }
    }

    fn text_of(chunks: &[OutputChunk], kind: OutputKind) -> String {
        chunks
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.text.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_relays_output_then_exit() {
        let mut stage = StageProcess::spawn(
            StageKind::Run,
            sh("echo one; echo two; echo oops 1>&2; exit 3"),
        )
        .unwrap();

        let (chunks, code) = collect(&mut stage).await;
        assert_eq!(code, 3);
        assert!(stage.is_terminated());
        assert_eq!(stage.exit_code(), Some(3));

        assert_eq!(text_of(&chunks, OutputKind::Stdout), "one\ntwo\n");
        assert_eq!(text_of(&chunks, OutputKind::Stderr), "oops\n");
        assert!(chunks.iter().all(|c| c.stage == StageKind::Run));

        assert!(stage.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_terminate_kills_and_is_idempotent() {
        let mut stage = StageProcess::spawn(StageKind::Build, sh("exec sleep 30")).unwrap();
        assert!(!stage.is_terminated());

        stage.terminate();
        stage.terminate();

        let code = stage.wait().await;
        assert_eq!(code, 128 + libc::SIGKILL);
        assert!(stage.is_terminated());

        // Terminating an exited stage is a no-op
        stage.terminate();
        assert!(stage.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_relay() {
        let mut stage = StageProcess::spawn(
            StageKind::Run,
            sh("echo before; printf '\\377\\n'; echo after"),
        )
        .unwrap();

        let (chunks, code) = collect(&mut stage).await;
        assert_eq!(code, 0);
        assert_eq!(
            text_of(&chunks, OutputKind::Stdout),
            "before\n\u{FFFD}\nafter\n"
        );
    }

    #[tokio::test]
    async fn test_partial_line_is_relayed_immediately() {
        let mut stage =
            StageProcess::spawn(StageKind::Run, sh("printf 'login: '; sleep 2; echo")).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), stage.next_event())
            .await
            .expect("prompt held back until newline");
        match first {
            Some(StageEvent::Output(chunk)) => assert_eq!(chunk.text, "login: "),
            other => panic!("unexpected event {other:?}"),
        }

        let (rest, code) = collect(&mut stage).await;
        assert_eq!(code, 0);
        assert_eq!(text_of(&rest, OutputKind::Stdout), "\n");
    }

    #[test]
    fn test_split_multibyte_sequence_is_carried_over() {
        // "é" is 0xC3 0xA9, "😀" is 0xF0 0x9F 0x98 0x80
        let mut pending = vec![b'a', 0xC3];
        assert_eq!(take_decodable(&mut pending), "a");
        assert_eq!(pending, vec![0xC3]);

        pending.extend_from_slice(&[0xA9, 0xF0, 0x9F]);
        assert_eq!(take_decodable(&mut pending), "é");
        assert_eq!(pending, vec![0xF0, 0x9F]);

        pending.extend_from_slice(&[0x98, 0x80, b'!']);
        assert_eq!(take_decodable(&mut pending), "😀!");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_invalid_trailing_byte_is_not_held() {
        let mut pending = vec![b'x', 0xFF];
        assert_eq!(take_decodable(&mut pending), "x\u{FFFD}");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = StageProcess::spawn(
            StageKind::Run,
            Command::new("/nonexistent/qemu-system-x86_64"),
        )
        .unwrap_err();
        assert!(matches!(err, QlaunchError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_command_line_description() {
        let mut cmd = Command::new("qemu-system-x86_64");
        cmd.args(["-cdrom", "/tmp/os.iso"]);
        assert_eq!(describe(&cmd), "qemu-system-x86_64 -cdrom /tmp/os.iso");
    }
}
