/// The top-level wiring object: one per DAP connection, composing the MI
/// pipeline, execution state machine, breakpoint/var-ref-backed request
/// handler, stop-recovery poller, the assert-prompt side channel, and GDB
/// process lifecycle into the single event loop described by §5.
///
/// Generalizes the teacher's top-level `GdbAdapter` (lib.rs), which held
/// the same rough set of pieces (process handle, pending-command table,
/// event channel) as fields on one struct with ad hoc methods; here each
/// concern is its own module and `Session` only owns the wiring between
/// them, per the design note in spec §9.
use crate::assert::{AssertParser, AssertPrompt, AutoResponder, ResponderAction};
use crate::dap::{encode, DapFramer, Event, RawRequest, Response, SeqCounter};
use crate::handler::Handler;
use crate::lifecycle::GdbProcess;
use crate::mi::MiRecord;
use crate::pipeline::{MiEvent, MiPipeline};
use crate::recovery::StopRecovery;
use crate::state::{DapEvent, StateMachine};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Drives one DAP connection end to end: reads framed requests from
/// `input`, dispatches them, and writes framed responses/events to
/// `output` until the client disconnects or GDB exits.
pub struct Session<O: AsyncWrite + Unpin + Send> {
    output: Mutex<O>,
    seq: SeqCounter,
    state: Arc<StateMachine>,
    handler: Handler<ChildStdin>,
    recovery: Arc<StopRecovery<ChildStdin>>,
    gdb: Mutex<Option<GdbProcess>>,
    simulator_child: Mutex<Option<tokio::process::Child>>,
    simulator_stdin: Mutex<Option<tokio::process::ChildStdin>>,
    auto_responder: Mutex<AutoResponder>,
    mi_events: Mutex<mpsc::UnboundedReceiver<MiEvent>>,
    dap_events: Mutex<mpsc::UnboundedReceiver<DapEvent>>,
    assert_prompts: Mutex<mpsc::UnboundedReceiver<AssertPrompt>>,
    assert_tx: mpsc::UnboundedSender<AssertPrompt>,
}

const DEFAULT_MI_TIMEOUT: Duration = Duration::from_secs(10);

impl<O: AsyncWrite + Unpin + Send> Session<O> {
    /// Builds a session around a GDB child process spawned at `gdb_path`.
    /// The returned session owns nothing of the DAP transport yet — call
    /// `run` with the framed stdin/stdout streams.
    pub async fn new(gdb_path: &str, output: O) -> Result<Self, SessionError> {
        Self::with_mi_timeout(gdb_path, output, DEFAULT_MI_TIMEOUT).await
    }

    /// Same as `new`, but overrides the per-command MI deadline (used by
    /// the binary entry point's `MIKRO_DAP_TIMEOUT_MS`).
    pub async fn with_mi_timeout(
        gdb_path: &str,
        output: O,
        mi_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let (gdb, stdin, stdout) = GdbProcess::spawn(gdb_path).await?;

        let (mi_tx, mi_rx) = mpsc::unbounded_channel();
        let (dap_tx, dap_rx) = mpsc::unbounded_channel();
        let (assert_tx, assert_rx) = mpsc::unbounded_channel();

        let pipeline = Arc::new(MiPipeline::new(stdin, mi_timeout, mi_tx));
        let state = Arc::new(StateMachine::new(dap_tx));
        gdb.start_stdout_reader(stdout, pipeline.clone(), state.clone());

        let recovery = Arc::new(StopRecovery::new(pipeline.clone(), state.clone()));
        let handler = Handler::new(pipeline, state.clone(), recovery.clone());

        Ok(Self {
            output: Mutex::new(output),
            seq: SeqCounter::new(),
            state,
            handler,
            recovery,
            gdb: Mutex::new(Some(gdb)),
            simulator_child: Mutex::new(None),
            simulator_stdin: Mutex::new(None),
            auto_responder: Mutex::new(AutoResponder {
                auto_reply_writes: true,
            }),
            mi_events: Mutex::new(mi_rx),
            dap_events: Mutex::new(dap_rx),
            assert_prompts: Mutex::new(assert_rx),
            assert_tx,
        })
    }

    /// Optionally wires a separately-spawned simulator's stdout/stdin into
    /// the assert-prompt side channel (§4.7). Call before `run` if
    /// `launch`'s `simulatorPath` names a binary.
    pub async fn attach_simulator(
        &self,
        stdout: impl AsyncRead + Unpin + Send + 'static,
        stdin: tokio::process::ChildStdin,
        auto_reply_writes: bool,
    ) {
        *self.simulator_stdin.lock().await = Some(stdin);
        self.auto_responder.lock().await.auto_reply_writes = auto_reply_writes;

        let tx = self.assert_tx.clone();
        tokio::spawn(async move {
            let mut reader = stdout;
            let mut parser = AssertParser::new();
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                        for prompt in parser.feed(&text) {
                            if tx.send(prompt).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    async fn send_message(&self, body: impl serde::Serialize) -> std::io::Result<()> {
        let bytes = encode(&body)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let mut out = self.output.lock().await;
        out.write_all(&bytes).await?;
        out.flush().await
    }

    async fn send_event(&self, event: &str, body: Option<serde_json::Value>) {
        let msg = Event::new(self.seq.next(), event, body);
        let _ = self.send_message(msg).await;
    }

    /// Spawns the simulator as its own child process (independent of GDB)
    /// so its stdout/stdin carry the assert-prompt protocol untouched by
    /// MI framing, per §4.7.
    async fn spawn_simulator(&self, path: &str, auto_reply_writes: bool) -> std::io::Result<()> {
        let mut child = tokio::process::Command::new(path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "simulator has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "simulator has no stdout"))?;
        *self.simulator_child.lock().await = Some(child);
        self.attach_simulator(stdout, stdin, auto_reply_writes).await;
        Ok(())
    }

    async fn handle_request(&self, req: RawRequest) {
        if req.command == "mikro.assertRespond" {
            self.handle_assert_respond(&req).await;
            return;
        }

        if req.command == "launch" {
            if let Ok(args) = req.args::<crate::dap::LaunchArgs>() {
                if let Some(path) = &args.simulator_path {
                    if let Err(e) = self.spawn_simulator(path, args.auto_reply_writes).await {
                        log::warn!("failed to spawn simulator '{path}': {e}");
                    }
                }
            }
        }

        let result = self.handler.handle(&req).await;
        let ok = result.is_ok();
        let response = match result {
            Ok(body) => Response::success(self.seq.next(), req.seq, &req.command, body),
            Err(message) => Response::failure(self.seq.next(), req.seq, &req.command, message),
        };
        let _ = self.send_message(response).await;

        if req.command == "initialize" && ok {
            self.send_event("initialized", None).await;
        }
    }

    async fn handle_assert_respond(&self, req: &RawRequest) {
        #[derive(serde::Deserialize)]
        struct Args {
            value: String,
        }
        let reply = req.args::<Args>().ok().map(|a| crate::assert::sanitize(&a.value));
        if let (Some(reply), Some(stdin)) = (reply, self.simulator_stdin.lock().await.as_mut()) {
            let line = format!("{reply}\n");
            let _ = stdin.write_all(line.as_bytes()).await;
            let _ = stdin.flush().await;
        }
        let response = Response::success(self.seq.next(), req.seq, &req.command, None);
        let _ = self.send_message(response).await;
    }

    async fn handle_mi_event(&self, event: MiEvent) {
        match event {
            MiEvent::Record(MiRecord::Stream(stream)) => {
                let category = match stream.kind {
                    crate::mi::StreamKind::Console => "console",
                    crate::mi::StreamKind::Target => "stdout",
                    crate::mi::StreamKind::Log => "log",
                };
                self.state.push_console(category, stream.text.clone());
                self.send_event(
                    "output",
                    Some(json!({ "category": category, "output": stream.text })),
                )
                .await;
            }
            MiEvent::Record(record) if record.is_stopped() => {
                self.recovery.cancel();
                let (reason, thread_id, bkpt) = extract_stop_fields(&record);
                self.state.on_real_stop(&reason, thread_id, bkpt);
            }
            MiEvent::Record(_) => {}
        }
    }

    async fn handle_dap_event(&self, event: DapEvent) {
        match event {
            DapEvent::Initialized => self.send_event("initialized", None).await,
            DapEvent::Stopped(body) => {
                self.send_event("stopped", Some(serde_json::to_value(body).unwrap())).await
            }
            DapEvent::Continued(body) => {
                self.send_event("continued", Some(serde_json::to_value(body).unwrap())).await
            }
            DapEvent::Terminated => self.send_event("terminated", None).await,
            DapEvent::Exited { exit_code } => {
                self.send_event("exited", Some(json!({ "exitCode": exit_code }))).await
            }
        }
    }

    async fn handle_assert_prompt(&self, prompt: AssertPrompt) {
        let action = self.auto_responder.lock().await.decide(&prompt);
        match action {
            ResponderAction::AutoReply(value) => {
                let sanitized = crate::assert::sanitize(&value);
                if let Some(stdin) = self.simulator_stdin.lock().await.as_mut() {
                    let line = format!("{sanitized}\n");
                    let _ = stdin.write_all(line.as_bytes()).await;
                    let _ = stdin.flush().await;
                }
            }
            ResponderAction::Surface => {
                self.send_event(
                    "mikro.assertPrompt",
                    Some(json!({
                        "kind": format!("{:?}", prompt.kind),
                        "address": prompt.address,
                        "size": prompt.size,
                        "pc": prompt.pc,
                        "register": prompt.register,
                        "peripheral": prompt.peripheral,
                        "reset": prompt.reset,
                        "fields": prompt.fields,
                        "value": prompt.value,
                        "hints": prompt.hints,
                        "decisions": prompt.decisions.iter().map(|d| json!({
                            "input": d.input,
                            "targetAddress": d.target_address,
                            "targetMnemonic": d.target_mnemonic,
                            "note": d.note,
                        })).collect::<Vec<_>>(),
                    })),
                )
                .await;
            }
        }
    }

    /// Runs the event loop to completion: reads framed DAP requests off
    /// `input` while concurrently draining the MI event, DAP event, and
    /// assert-prompt channels. Returns once the state machine observes
    /// `Terminated` and the input stream is drained.
    pub async fn run(&self, mut input: impl AsyncRead + Unpin + Send) -> std::io::Result<()> {
        let mut framer = DapFramer::default();
        let mut buf = [0u8; 4096];
        let mut input_open = true;

        loop {
            if self.state.snapshot().is_terminated() && !input_open {
                break;
            }

            tokio::select! {
                n = input.read(&mut buf), if input_open => {
                    match n {
                        Ok(0) => input_open = false,
                        Ok(n) => {
                            framer.feed(&buf[..n]);
                            while let Some(msg) = framer.pop() {
                                if let Ok(req) = serde_json::from_value::<RawRequest>(msg) {
                                    if req.is_request() {
                                        self.handle_request(req).await;
                                    }
                                }
                            }
                        }
                        Err(_) => input_open = false,
                    }
                }
                Some(event) = async { self.mi_events.lock().await.recv().await } => {
                    self.handle_mi_event(event).await;
                }
                Some(event) = async { self.dap_events.lock().await.recv().await } => {
                    self.handle_dap_event(event).await;
                }
                Some(prompt) = async { self.assert_prompts.lock().await.recv().await } => {
                    self.handle_assert_prompt(prompt).await;
                }
            }
        }

        if let Some(mut gdb) = self.gdb.lock().await.take() {
            let _ = gdb.shutdown(Duration::from_secs(1)).await;
        }
        if let Some(mut sim) = self.simulator_child.lock().await.take() {
            let _ = sim.kill().await;
        }
        Ok(())
    }
}

fn extract_stop_fields(record: &MiRecord) -> (String, i64, Option<Vec<u32>>) {
    let results = match record {
        MiRecord::Exec(a) | MiRecord::Notify(a) => &a.results,
        _ => return ("pause".to_string(), 1, None),
    };
    let reason = results
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("pause")
        .to_string();
    let thread_id = results
        .get("thread-id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(1);
    let bkpt = results
        .get("bkptno")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<u32>().ok())
        .map(|n| vec![n]);
    (reason, thread_id, bkpt)
}
