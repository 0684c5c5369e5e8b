/// The serialized GDB/MI command pipeline.
///
/// Generalizes the gdbadapter `communication` module: commands are still
/// tokenized and routed through a pending table exacted keyed by token
/// (`GdbCommunication::send_command`), but every send now carries a
/// deadline (the teacher has none) and the running-state error predicate
/// from spec §4.5 is exported as a free function so the execution state
/// machine and the handler can both gate on it without depending on this
/// module's internals.
use crate::mi::{parse_line, MiRecord, MiResult, ResultClass};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to write MI command: {0}")]
    Write(#[from] std::io::Error),
    #[error("gdb exited")]
    GdbExited,
    #[error("gdb returned an error: {0}")]
    Mi(String),
    #[error("gdb rejected the command because the target is running: {0}")]
    RunningState(String),
    #[error("command '{command}' (token {token}) timed out after {elapsed:?}; {pending} command(s) still pending")]
    Deadline {
        token: u32,
        command: String,
        elapsed: Duration,
        pending: usize,
    },
}

/// Phrases GDB is known to use when it rejects an MI command because the
/// selected thread (or the whole inferior) is running. Case-insensitive,
/// per §4.5. This is the single gate that may promote the execution state
/// machine from `Running` to `SyntheticStop`.
const RUNNING_STATE_PHRASES: &[&str] = &[
    "selected thread is running",
    "thread is running",
    "running thread is required",
    "cannot execute this command while",
];

pub fn is_running_state_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RUNNING_STATE_PHRASES.iter().any(|p| lower.contains(p))
}

/// Non-reply traffic the reader loop hands off: async records (exec or
/// notify), stream records, and result records that arrived without a
/// token (untracked console replies).
#[derive(Debug, Clone)]
pub enum MiEvent {
    Record(MiRecord),
}

struct PendingSlot {
    command: String,
    started: Instant,
    reply: oneshot::Sender<MiResult>,
}

pub struct MiPipeline<W> {
    stdin: Mutex<W>,
    token_counter: AtomicU32,
    pending: Arc<std::sync::Mutex<HashMap<u32, PendingSlot>>>,
    default_timeout: Duration,
    events: mpsc::UnboundedSender<MiEvent>,
}

impl<W: AsyncWrite + Unpin + Send> MiPipeline<W> {
    pub fn new(stdin: W, default_timeout: Duration, events: mpsc::UnboundedSender<MiEvent>) -> Self {
        Self {
            stdin: Mutex::new(stdin),
            token_counter: AtomicU32::new(1),
            pending: Arc::new(std::sync::Mutex::new(HashMap::new())),
            default_timeout,
            events,
        }
    }

    /// Sends one MI command and waits for its `^...` reply, honoring the
    /// per-command deadline (default if `timeout` is `None`). Commands are
    /// strictly serialized: the stdin lock is held across the write so a
    /// second concurrent caller cannot interleave bytes, but the lock is
    /// released before awaiting the reply so the reader task can keep
    /// draining stdout.
    pub async fn send(&self, command: &str, timeout: Option<Duration>) -> Result<MiResult> {
        let token = self.token_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(
                token,
                PendingSlot {
                    command: command.to_string(),
                    started: Instant::now(),
                    reply: tx,
                },
            );
        }

        let line = format!("{token}{command}\n");
        log::debug!("MI send[{token}]: {command}");
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().unwrap().remove(&token);
                return Err(e.into());
            }
            if let Err(e) = stdin.flush().await {
                self.pending.lock().unwrap().remove(&token);
                return Err(e.into());
            }
        }

        let deadline = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => self.classify(result),
            Ok(Err(_)) => Err(PipelineError::GdbExited),
            Err(_) => {
                let (elapsed, pending_count) = {
                    let mut pending = self.pending.lock().unwrap();
                    let started = pending
                        .get(&token)
                        .map(|s| s.started)
                        .unwrap_or_else(Instant::now);
                    pending.remove(&token);
                    (started.elapsed(), pending.len())
                };
                log::warn!("MI deadline[{token}]: '{command}' after {elapsed:?}, {pending_count} pending");
                Err(PipelineError::Deadline {
                    token,
                    command: command.to_string(),
                    elapsed,
                    pending: pending_count,
                })
            }
        }
    }

    /// Writes raw bytes directly to GDB's stdin, bypassing the token
    /// protocol entirely. Used for the stop-recovery Ctrl-C escalation
    /// (§4.4): a literal 0x03 byte on GDB's stdin, never a signal to the
    /// GDB process itself.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn classify(&self, result: MiResult) -> Result<MiResult> {
        if result.class == ResultClass::Error {
            let msg = result
                .results
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            if is_running_state_error(&msg) {
                return Err(PipelineError::RunningState(msg));
            }
            return Err(PipelineError::Mi(msg));
        }
        Ok(result)
    }

    /// Routes one parsed line from the GDB stdout reader task: a tokened
    /// result completes the matching pending send; everything else
    /// (async records, streams, untracked results) is forwarded on the
    /// event channel for the state machine / console sink to consume. A
    /// late reply for an already-abandoned (deadline-expired) token is
    /// silently dropped, per §4.5.
    pub fn route(&self, line: &str) {
        let Some(record) = parse_line(line) else {
            return;
        };
        if let MiRecord::Result(result) = &record {
            if let Some(token) = result.token {
                let slot = self.pending.lock().unwrap().remove(&token);
                if let Some(slot) = slot {
                    let _ = slot.reply.send(result.clone());
                    return;
                } else {
                    log::trace!("MI recv: no pending command for token {token} (late or already timed out)");
                }
            }
        }
        let _ = self.events.send(MiEvent::Record(record));
    }

    /// Rejects every pending command with "gdb exited" and drains the
    /// table. Called once GDB's stdout reader observes EOF or the
    /// shutdown sequence runs.
    pub fn reject_all_pending(&self) {
        let mut pending = self.pending.lock().unwrap();
        for (_, slot) in pending.drain() {
            drop(slot.reply); // dropping the sender fails the receiver with RecvError
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
