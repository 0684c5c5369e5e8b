/// GDB process lifecycle and supervision (§4.8): spawning GDB in MI2 mode,
/// wiring its stdout/stderr into the MI pipeline, the parent-pid-1
/// watchdog, and the shutdown sequence.
///
/// Grounded directly on the teacher's `process.rs` (`GdbProcess::start`,
/// `install_signal_protection`, the platform-specific interrupt) and
/// `lib.rs`'s reader-task pattern; the watchdog is new, modeled on the same
/// `tokio::spawn` + `Arc<Mutex<bool>>` gate the teacher uses for its
/// output reader.
use crate::pipeline::MiPipeline;
use crate::state::StateMachine;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to start gdb: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("gdb did not expose a stdio handle")]
    MissingStdio,
}

/// Installs the platform signal-protection the teacher's `process.rs`
/// carries, so that escalating a Ctrl+C to the simulator (never to this
/// process or to GDB, per §4.5/§9) can't accidentally self-terminate the
/// adapter on Windows.
#[cfg(windows)]
pub fn install_signal_protection() {
    unsafe {
        use winapi::shared::minwindef::{BOOL, DWORD, TRUE};
        use winapi::um::consoleapi::SetConsoleCtrlHandler;

        unsafe extern "system" fn ctrl_handler(ctrl_type: DWORD) -> BOOL {
            use winapi::um::wincon::{CTRL_BREAK_EVENT, CTRL_C_EVENT};
            match ctrl_type {
                CTRL_C_EVENT | CTRL_BREAK_EVENT => {
                    log::debug!("ignoring console ctrl event {ctrl_type} to avoid self-termination");
                    TRUE
                }
                _ => 0,
            }
        }

        if SetConsoleCtrlHandler(Some(ctrl_handler), TRUE) == 0 {
            log::warn!("failed to install console ctrl handler");
        }
    }
}

#[cfg(not(windows))]
pub fn install_signal_protection() {}

/// A running GDB child process plus the reader task that feeds its stdout
/// into the MI pipeline. Dropping this guarantees the child is killed,
/// even if the normal shutdown sequence was never run.
pub struct GdbProcess {
    child: Child,
    running: Arc<AtomicBool>,
}

impl GdbProcess {
    /// Spawns `gdb_path` in MI2 mode and starts the stderr reader task
    /// (just a console log sink). The stdout handle is returned to the
    /// caller rather than wired up here, since routing it into an
    /// `MiPipeline<W>` requires that pipeline to already own this same
    /// child's stdin as its writer `W` — a dependency `spawn` itself can't
    /// satisfy. Call `start_stdout_reader` once the pipeline exists.
    pub async fn spawn(gdb_path: &str) -> Result<(Self, ChildStdin, tokio::process::ChildStdout), LifecycleError> {
        install_signal_protection();

        let mut child = Command::new(gdb_path)
            .arg("--interpreter=mi2")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        log::debug!("gdb started, pid={:?}", child.id());

        let stdin = child.stdin.take().ok_or(LifecycleError::MissingStdio)?;
        let stdout = child.stdout.take().ok_or(LifecycleError::MissingStdio)?;
        let stderr = child.stderr.take().ok_or(LifecycleError::MissingStdio)?;

        let running = Arc::new(AtomicBool::new(true));
        spawn_stderr_reader(stderr, running.clone());

        Ok((Self { child, running }, stdin, stdout))
    }

    /// Starts the stdout reader task against an already-constructed
    /// pipeline. Must be called exactly once per `spawn`.
    pub fn start_stdout_reader<W: tokio::io::AsyncWrite + Unpin + Send + 'static>(
        &self,
        stdout: tokio::process::ChildStdout,
        pipeline: Arc<MiPipeline<W>>,
        state: Arc<StateMachine>,
    ) {
        spawn_stdout_reader(stdout, pipeline, state, self.running.clone());
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Sends SIGTERM (Unix) or a console ctrl event (Windows) to GDB,
    /// waiting up to `grace` before escalating to a hard kill. Never sends
    /// a signal to the simulator process; that is the assert-responder's
    /// job via its own stdin.
    pub async fn shutdown(&mut self, grace: Duration) -> std::io::Result<()> {
        self.running.store(false, Ordering::SeqCst);

        #[cfg(unix)]
        if let Some(pid) = self.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(windows)]
        if let Some(pid) = self.id() {
            unsafe {
                winapi::um::wincon::GenerateConsoleCtrlEvent(
                    winapi::um::wincon::CTRL_BREAK_EVENT,
                    pid,
                );
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                log::warn!("gdb did not exit within {grace:?}, killing");
                self.child.kill().await
            }
        }
    }
}

impl Drop for GdbProcess {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.child.start_kill();
    }
}

fn spawn_stdout_reader<W: tokio::io::AsyncWrite + Unpin + Send + 'static>(
    stdout: tokio::process::ChildStdout,
    pipeline: Arc<MiPipeline<W>>,
    state: Arc<StateMachine>,
    running: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        while running.load(Ordering::SeqCst) {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        pipeline.route(trimmed);
                    }
                }
                Err(e) => {
                    log::warn!("gdb stdout reader error: {e}");
                    break;
                }
            }
        }
        log::debug!("gdb stdout reader exiting");
        pipeline.reject_all_pending();
        state.on_gdb_exit();
    });
}

fn spawn_stderr_reader(stderr: tokio::process::ChildStderr, running: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        while running.load(Ordering::SeqCst) {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        log::debug!("gdb stderr: {trimmed}");
                    }
                }
                Err(_) => break,
            }
        }
    });
}

/// Spawns the 1s parent-pid-1 watchdog: on Unix, if this process is
/// reparented to init (ppid becomes 1), its original launching IDE has
/// died without a clean `disconnect`/`terminate`, so the adapter shuts
/// down rather than leak a GDB/simulator pair. A no-op on platforms
/// without a `getppid` concept.
pub fn spawn_parent_watchdog(on_orphaned: impl Fn() + Send + 'static) {
    #[cfg(unix)]
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if unsafe { libc::getppid() } == 1 {
                    log::warn!("parent process exited (reparented to init); shutting down");
                    on_orphaned();
                    break;
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = on_orphaned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_missing_binary_reports_error() {
        let result = GdbProcess::spawn("/definitely/not/a/real/gdb/binary").await;
        assert!(result.is_err());
    }
}
