/// Stop-recovery subsystem (§4.4): when a step/pause/continue is issued and
/// no `*stopped` arrives before its deadline, this probes GDB directly,
/// escalates, and — if GDB still won't answer — fabricates a synthetic
/// stop so the client is never left waiting forever.
///
/// No teacher analogue: `gdbadapter::GdbAdapter::interrupt()` fabricates a
/// synthetic `^done` immediately and never polls. This is grounded on the
/// teacher's reader-task shape (`start_output_reader`/`start_stdout_reader`
/// spawned once, gated by a running flag) generalized into a single-flight
/// poller guarded by one `Option<JoinHandle<_>>`, per the "one optional
/// active task" design note.
use crate::mi::MiResult;
use crate::pipeline::MiPipeline;
use crate::state::StateMachine;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const ESCALATION_ROUNDS: u32 = 3;
pub const ENTRY_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    Step,
    Pause,
    Continue,
}

impl RecoveryTrigger {
    pub fn deadline(self) -> Duration {
        match self {
            RecoveryTrigger::Step => Duration::from_secs(3),
            RecoveryTrigger::Pause => Duration::from_secs(2),
            RecoveryTrigger::Continue => Duration::from_secs(30),
        }
    }

    fn reason(self) -> &'static str {
        match self {
            RecoveryTrigger::Step => "step",
            RecoveryTrigger::Pause => "pause",
            RecoveryTrigger::Continue => "pause",
        }
    }
}

fn thread_reported_stopped(result: &MiResult, thread_id: i64) -> bool {
    let Some(threads) = result.results.get("threads") else {
        return false;
    };
    threads.as_tuple_list().iter().any(|t| {
        let matches_id = t
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok())
            == Some(thread_id);
        let stopped = t.get("state").and_then(|v| v.as_str()) == Some("stopped");
        matches_id && stopped
    })
}

/// Single-flight stop-recovery driver: at most one poll/escalate task runs
/// at a time, shared across every `arm` call, per the state machine's own
/// thread-id.
pub struct StopRecovery<W> {
    pipeline: Arc<MiPipeline<W>>,
    state: Arc<StateMachine>,
    active: Mutex<Option<JoinHandle<()>>>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> StopRecovery<W> {
    pub fn new(pipeline: Arc<MiPipeline<W>>, state: Arc<StateMachine>) -> Self {
        Self {
            pipeline,
            state,
            active: Mutex::new(None),
        }
    }

    /// True while a poll/escalate task is already in flight for this
    /// session. Arming again while this is true is a no-op: the MI
    /// read-blocked invariant forbids issuing a second probe loop anyway.
    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Starts the poll-then-escalate loop for `trigger`, unless one is
    /// already running. Resolves by calling `on_real_stop` (recovered) or
    /// `on_synthetic_stop` (escalation exhausted) on the shared state
    /// machine — never returns a value, since the caller has already
    /// replied to the DAP request that triggered this.
    pub fn arm(self: &Arc<Self>, trigger: RecoveryTrigger, thread_id: i64) {
        let mut active = self.active.lock().unwrap();
        if active.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let this = Arc::clone(self);
        *active = Some(tokio::spawn(async move {
            this.run(trigger, thread_id).await;
        }));
    }

    /// Cancels an in-flight poll, used when a real `*stopped` arrives
    /// through the normal event channel before recovery concludes on its
    /// own.
    pub fn cancel(&self) {
        if let Some(handle) = self.active.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn probe_stopped(&self, thread_id: i64) -> bool {
        match self
            .pipeline
            .send("-thread-info", Some(PROBE_TIMEOUT))
            .await
        {
            Ok(result) => thread_reported_stopped(&result, thread_id),
            Err(_) => false,
        }
    }

    async fn run(&self, trigger: RecoveryTrigger, thread_id: i64) {
        let deadline = trigger.deadline();
        let start = Instant::now();

        while start.elapsed() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            if self.probe_stopped(thread_id).await {
                self.state.on_real_stop(trigger.reason(), thread_id, None);
                return;
            }
        }

        for round in 1..=ESCALATION_ROUNDS {
            log::warn!("stop-recovery escalation round {round}/{ESCALATION_ROUNDS} for thread {thread_id}");
            let _ = self
                .pipeline
                .send("-exec-interrupt", Some(PROBE_TIMEOUT))
                .await;
            if self.probe_stopped(thread_id).await {
                self.state.on_real_stop("pause", thread_id, None);
                return;
            }
            if let Err(e) = self.pipeline.write_raw(&[0x03]).await {
                log::warn!("stop-recovery: failed writing Ctrl-C byte: {e}");
            }
            if self.probe_stopped(thread_id).await {
                self.state.on_real_stop("pause", thread_id, None);
                return;
            }
        }

        log::warn!("stop-recovery: escalation exhausted for thread {thread_id}, synthesizing stop");
        self.state.on_synthetic_stop(thread_id);
    }

    /// Entry-stop protocol (§4.4): probe, interrupt, plant a temporary
    /// breakpoint at the entry address, continue, then poll up to
    /// `ENTRY_DEADLINE` before synthesizing the entry stop regardless.
    pub async fn run_entry_stop(&self, thread_id: i64, entry_address: &str) {
        let start = Instant::now();

        if self.probe_stopped(thread_id).await {
            self.state.enter_stop(thread_id);
            return;
        }

        let _ = self
            .pipeline
            .send("-exec-interrupt", Some(PROBE_TIMEOUT))
            .await;
        let _ = self
            .pipeline
            .send(&format!("-break-insert -t {entry_address}"), Some(PROBE_TIMEOUT))
            .await;
        let _ = self
            .pipeline
            .send("-exec-continue", Some(PROBE_TIMEOUT))
            .await;

        while start.elapsed() < ENTRY_DEADLINE {
            tokio::time::sleep(POLL_INTERVAL).await;
            if self.probe_stopped(thread_id).await {
                self.state.enter_stop(thread_id);
                return;
            }
        }

        log::warn!("stop-recovery: entry stop not observed within {ENTRY_DEADLINE:?}, synthesizing");
        self.state.enter_stop(thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mi::MiValue;
    use std::collections::HashMap;
    use tokio::io::duplex;
    use tokio::sync::mpsc;

    fn stopped_thread_info(id: i64) -> String {
        format!(r#"1^done,threads=[{{id="{id}",state="stopped"}}]"#)
    }

    fn running_thread_info(id: i64) -> String {
        format!(r#"1^done,threads=[{{id="{id}",state="running"}}]"#)
    }

    fn harness() -> (Arc<MiPipeline<tokio::io::DuplexStream>>, Arc<StateMachine>) {
        let (client, _server) = duplex(8192);
        let (etx, _erx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(MiPipeline::new(client, Duration::from_secs(2), etx));
        let (stx, _srx) = mpsc::unbounded_channel();
        let state = Arc::new(StateMachine::new(stx));
        (pipeline, state)
    }

    #[test]
    fn thread_reported_stopped_matches_by_id_and_state() {
        let mut results = HashMap::new();
        results.insert(
            "threads".to_string(),
            MiValue::List(vec![MiValue::Tuple({
                let mut t = HashMap::new();
                t.insert("id".to_string(), MiValue::String("2".into()));
                t.insert("state".to_string(), MiValue::String("stopped".into()));
                t
            })]),
        );
        let result = MiResult {
            token: Some(1),
            class: crate::mi::ResultClass::Done,
            results,
        };
        assert!(thread_reported_stopped(&result, 2));
        assert!(!thread_reported_stopped(&result, 3));
    }

    #[tokio::test]
    async fn arm_is_single_flight() {
        let (pipeline, state) = harness();
        let recovery = Arc::new(StopRecovery::new(pipeline, state));
        recovery.arm(RecoveryTrigger::Pause, 1);
        assert!(recovery.is_active());
        // Second arm call while one is running must not spawn another task.
        recovery.arm(RecoveryTrigger::Pause, 1);
        recovery.cancel();
        assert!(!recovery.is_active());
    }

    #[tokio::test]
    async fn recovers_when_probe_reports_stopped() {
        let (client, mut server) = duplex(8192);
        let (etx, _erx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(MiPipeline::new(client, Duration::from_secs(2), etx));
        let (stx, mut srx) = mpsc::unbounded_channel();
        let state = Arc::new(StateMachine::new(stx));
        let recovery = Arc::new(StopRecovery::new(pipeline.clone(), state.clone()));

        let run = tokio::spawn({
            let recovery = recovery.clone();
            async move { recovery.run(RecoveryTrigger::Pause, 5).await }
        });

        use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
        let mut buf = [0u8; 256];
        let n = server.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("-thread-info"));
        pipeline.route(&stopped_thread_info(5));

        run.await.unwrap();
        match state.snapshot() {
            crate::state::ExecState::Stopped { thread_id, .. } => assert_eq!(thread_id, 5),
            other => panic!("unexpected {other:?}"),
        }
        let _ = srx.try_recv();
        let _ = server.write_all(b"").await;
    }

    #[tokio::test]
    async fn escalation_exhausted_synthesizes_stop() {
        let (client, mut server) = duplex(65536);
        let (etx, _erx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(MiPipeline::new(client, Duration::from_millis(50), etx));
        let (stx, _srx) = mpsc::unbounded_channel();
        let state = Arc::new(StateMachine::new(stx));
        let recovery = Arc::new(StopRecovery::new(pipeline.clone(), state.clone()));

        state.begin_running();

        let run = tokio::spawn({
            let recovery = recovery.clone();
            async move {
                recovery
                    .run(RecoveryTrigger::Pause, 9)
                    .await
            }
        });

        // Keep replying "running" to every -thread-info probe so nothing
        // ever recovers, forcing escalation to exhaust.
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout(Duration::from_millis(500), server.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(_)) => pipeline.route(&running_thread_info(9)),
            }
            if run.is_finished() {
                break;
            }
        }

        run.await.unwrap();
        assert_eq!(
            state.snapshot(),
            crate::state::ExecState::SyntheticStop {
                reason: "pause".into(),
                thread_id: 9
            }
        );
    }
}
