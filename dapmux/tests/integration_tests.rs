/// End-to-end-ish tests for the DAP <-> GDB/MI bridge: a `Handler` wired to
/// an in-memory duplex pipe stands in for GDB, with a small scripted
/// responder replying to whatever MI command it sees, mirroring the
/// teacher's own `tests/integration_tests.rs` style of driving real parsing
/// and dispatch code rather than mocking it away.
use dapmux::dap::RawRequest;
use dapmux::handler::Handler;
use dapmux::mi::ResultClass;
use dapmux::pipeline::{MiEvent, MiPipeline};
use dapmux::recovery::StopRecovery;
use dapmux::state::{ExecState, StateMachine};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;

fn raw_request(seq: i64, command: &str, arguments: serde_json::Value) -> RawRequest {
    serde_json::from_value(json!({
        "seq": seq,
        "type": "request",
        "command": command,
        "arguments": arguments,
    }))
    .unwrap()
}

/// Replies to whatever MI command the `Handler` under test sends, by
/// substring match on the command text. Good enough to drive every
/// request this adapter issues without modeling all of GDB/MI.
///
/// `thread_stopped` controls what `-thread-info` reports: most tests want
/// "running" so the background stop-recovery poller never silently
/// resolves the state out from under a test driving transitions by hand;
/// the entry-stop test wants "stopped" so the poller converges on its own.
fn spawn_fake_gdb(
    mut server: DuplexStream,
    pipeline: Arc<MiPipeline<DuplexStream>>,
    thread_stopped: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            let n = match server.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let text = String::from_utf8_lossy(&buf[..n]).into_owned();
            for line in text.lines().filter(|l| !l.is_empty()) {
                let token: String = line.chars().take_while(|c| c.is_ascii_digit()).collect();
                let reply = fake_reply(&token, line, thread_stopped);
                pipeline.route(&reply);
            }
        }
    })
}

fn fake_reply(token: &str, line: &str, thread_stopped: bool) -> String {
    if line.contains("-break-insert") {
        format!(
            r#"{token}^done,bkpt={{number="1",type="breakpoint",disp="keep",enabled="y",addr="0x1000",func="main",file="a.c",fullname="/tmp/a.c",line="5",times="0"}}"#
        )
    } else if line.contains("-break-delete") {
        format!("{token}^done")
    } else if line.contains("-break-watch") {
        format!(r#"{token}^done,wpt={{number="2",exp="x"}}"#)
    } else if line.contains("-thread-info") {
        let state = if thread_stopped { "stopped" } else { "running" };
        format!(r#"{token}^done,threads=[{{id="1",target-id="Thread 1",state="{state}"}}]"#)
    } else if line.contains("-exec-continue") || line.contains("-exec-run") {
        format!("{token}^running")
    } else if line.contains("-gdb-exit") {
        format!("{token}^exit")
    } else {
        format!("{token}^done")
    }
}

struct Harness {
    handler: Handler<DuplexStream>,
    state: Arc<StateMachine>,
    gdb_task: tokio::task::JoinHandle<()>,
    #[allow(dead_code)]
    mi_events: mpsc::UnboundedReceiver<MiEvent>,
}

/// `-thread-info` always reports "running" here so a test can drive
/// `*stopped` transitions by calling `state.on_real_stop` directly without
/// racing the background stop-recovery poller that `launch`/`continue`
/// arm on their own.
fn build_harness() -> Harness {
    let (client, server) = duplex(65536);
    let (mi_tx, mi_events) = mpsc::unbounded_channel();
    let pipeline = Arc::new(MiPipeline::new(client, Duration::from_secs(2), mi_tx));
    let gdb_task = spawn_fake_gdb(server, pipeline.clone(), false);

    let (dap_tx, _dap_rx) = mpsc::unbounded_channel();
    let state = Arc::new(StateMachine::new(dap_tx));
    let recovery = Arc::new(StopRecovery::new(pipeline.clone(), state.clone()));
    let handler = Handler::new(pipeline, state.clone(), recovery);

    Harness {
        handler,
        state,
        gdb_task,
        mi_events,
    }
}

#[tokio::test]
async fn initialize_reports_expected_capabilities() {
    let h = build_harness();
    let body = h
        .handler
        .handle(&raw_request(1, "initialize", json!({})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body["supportsConfigurationDoneRequest"], json!(true));
    assert_eq!(body["supportsDisassembleRequest"], json!(true));
    h.gdb_task.abort();
}

#[tokio::test]
async fn launch_without_stop_at_entry_reaches_running() {
    let h = build_harness();
    h.handler
        .handle(&raw_request(
            2,
            "launch",
            json!({ "program": "/tmp/a.elf", "stopAtEntry": false }),
        ))
        .await
        .unwrap();

    assert_eq!(h.state.snapshot(), ExecState::Running);
    h.gdb_task.abort();
}

#[tokio::test]
async fn launch_with_stop_at_entry_eventually_stops() {
    let (client, server) = duplex(65536);
    let (mi_tx, _mi_events) = mpsc::unbounded_channel();
    let pipeline = Arc::new(MiPipeline::new(client, Duration::from_secs(2), mi_tx));
    let gdb_task = spawn_fake_gdb(server, pipeline.clone(), true);
    let (dap_tx, _dap_rx) = mpsc::unbounded_channel();
    let state = Arc::new(StateMachine::new(dap_tx));
    let recovery = Arc::new(StopRecovery::new(pipeline.clone(), state.clone()));
    let handler = Handler::new(pipeline, state.clone(), recovery);

    handler
        .handle(&raw_request(
            2,
            "launch",
            json!({ "program": "/tmp/a.elf", "stopAtEntry": true }),
        ))
        .await
        .unwrap();

    // The entry-stop protocol runs in a spawned task; this fake GDB always
    // answers "stopped", so it should resolve quickly without hitting the
    // 5s synthesis fallback.
    for _ in 0..50 {
        if matches!(state.snapshot(), ExecState::Stopped { .. }) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(matches!(state.snapshot(), ExecState::Stopped { reason, .. } if reason == "entry"));
    gdb_task.abort();
}

#[tokio::test]
async fn set_breakpoints_then_continue_then_real_stop_reports_breakpoint_hit() {
    let h = build_harness();
    h.handler
        .handle(&raw_request(
            2,
            "launch",
            json!({ "program": "/tmp/a.elf", "stopAtEntry": false }),
        ))
        .await
        .unwrap();

    let body = h
        .handler
        .handle(&raw_request(
            3,
            "setBreakpoints",
            json!({
                "source": { "path": "/tmp/a.c" },
                "breakpoints": [{ "line": 5 }],
            }),
        ))
        .await
        .unwrap()
        .unwrap();
    let breakpoints = body["breakpoints"].as_array().unwrap();
    assert_eq!(breakpoints.len(), 1);
    assert_eq!(breakpoints[0]["verified"], json!(true));
    assert_eq!(breakpoints[0]["id"], json!(1));

    // Continue, then simulate GDB's own `*stopped` for the breakpoint hit
    // arriving asynchronously rather than through a synchronous MI reply.
    h.handler
        .handle(&raw_request(4, "continue", json!({})))
        .await
        .unwrap();
    assert_eq!(h.state.snapshot(), ExecState::Running);

    h.state.on_real_stop("breakpoint-hit", 1, Some(vec![1]));
    match h.state.snapshot() {
        ExecState::Stopped { reason, thread_id } => {
            assert_eq!(reason, "breakpoint");
            assert_eq!(thread_id, 1);
        }
        other => panic!("unexpected state {other:?}"),
    }
    h.gdb_task.abort();
}

#[tokio::test]
async fn conditional_breakpoint_sends_condition_flag() {
    let (client, mut server) = duplex(65536);
    let (mi_tx, _mi_events) = mpsc::unbounded_channel();
    let pipeline = Arc::new(MiPipeline::new(client, Duration::from_secs(2), mi_tx));
    let (dap_tx, _dap_rx) = mpsc::unbounded_channel();
    let state = Arc::new(StateMachine::new(dap_tx));
    let recovery = Arc::new(StopRecovery::new(pipeline.clone(), state.clone()));
    let handler = Handler::new(pipeline, state, recovery);

    let call = tokio::spawn(async move {
        handler
            .handle(&raw_request(
                2,
                "setBreakpoints",
                json!({
                    "source": { "path": "/tmp/a.c" },
                    "breakpoints": [{ "line": 5, "condition": "x == 3" }],
                }),
            ))
            .await
    });

    let mut buf = [0u8; 256];
    let n = server.read(&mut buf).await.unwrap();
    let sent = String::from_utf8_lossy(&buf[..n]).into_owned();
    assert!(sent.contains("-break-insert -c \"x == 3\" /tmp/a.c:5"));

    use tokio::io::AsyncWriteExt;
    server
        .write_all(
            br#"1^done,bkpt={number="7",type="breakpoint",disp="keep",enabled="y",addr="0x1000",func="main",file="a.c",fullname="/tmp/a.c",line="5",times="0"}
"#,
        )
        .await
        .unwrap();

    call.await.unwrap().unwrap();
}

#[tokio::test]
async fn pause_while_stopped_is_rejected() {
    let h = build_harness();
    // Fresh state machine starts in AwaitingConnect, not Running.
    let result = h.handler.handle(&raw_request(2, "pause", json!({}))).await;
    assert!(result.is_err());
    h.gdb_task.abort();
}

#[tokio::test]
async fn continue_during_synthetic_stop_does_not_issue_exec_continue() {
    let (client, mut server) = duplex(65536);
    let (mi_tx, _mi_events) = mpsc::unbounded_channel();
    let pipeline = Arc::new(MiPipeline::new(client, Duration::from_secs(2), mi_tx));
    let (dap_tx, mut dap_rx) = mpsc::unbounded_channel();
    let state = Arc::new(StateMachine::new(dap_tx));
    let recovery = Arc::new(StopRecovery::new(pipeline.clone(), state.clone()));
    let handler = Handler::new(pipeline, state.clone(), recovery);

    state.begin_running();
    state.on_synthetic_stop(1);
    let _ = dap_rx.try_recv();

    handler
        .handle(&raw_request(2, "continue", json!({})))
        .await
        .unwrap();

    assert_eq!(state.snapshot(), ExecState::Running);
    match dap_rx.try_recv().unwrap() {
        dapmux::state::DapEvent::Continued(body) => assert!(body.all_threads_continued),
        other => panic!("unexpected {other:?}"),
    }

    // No MI command should have reached "GDB": read must time out.
    let mut buf = [0u8; 16];
    let timed_out = tokio::time::timeout(Duration::from_millis(100), server.read(&mut buf))
        .await
        .is_err();
    assert!(timed_out, "continue from synthetic stop must not send -exec-continue");
}

#[tokio::test]
async fn disconnect_sends_gdb_exit() {
    let h = build_harness();
    let result = h.handler.handle(&raw_request(2, "disconnect", json!({}))).await;
    assert!(result.is_ok());
    h.gdb_task.abort();
}

#[tokio::test]
async fn read_memory_returns_running_placeholder_when_read_blocked() {
    let h = build_harness();
    h.state.begin_running();

    let body = h
        .handler
        .handle(&raw_request(
            2,
            "readMemory",
            json!({ "memoryReference": "0x1000", "count": 4 }),
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body["data"], json!("<running>"));
    h.gdb_task.abort();
}

#[tokio::test]
async fn evaluate_returns_running_placeholder_during_synthetic_stop() {
    let h = build_harness();
    h.state.begin_running();
    h.state.on_synthetic_stop(1);

    let body = h
        .handler
        .handle(&raw_request(2, "evaluate", json!({ "expression": "x" })))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body["result"], json!("<running>"));
    h.gdb_task.abort();
}

#[tokio::test]
async fn evaluate_repl_raw_mi_command_is_forwarded_verbatim() {
    let (client, mut server) = duplex(65536);
    let (mi_tx, _mi_events) = mpsc::unbounded_channel();
    let pipeline = Arc::new(MiPipeline::new(client, Duration::from_secs(2), mi_tx));
    let (dap_tx, _dap_rx) = mpsc::unbounded_channel();
    let state = Arc::new(StateMachine::new(dap_tx));
    state.begin_running();
    state.on_real_stop("breakpoint-hit", 1, None);
    let recovery = Arc::new(StopRecovery::new(pipeline.clone(), state.clone()));
    let handler = Handler::new(pipeline, state, recovery);

    let call = tokio::spawn(async move {
        handler
            .handle(&raw_request(
                2,
                "evaluate",
                json!({ "expression": "-data-evaluate-expression $pc", "context": "repl" }),
            ))
            .await
    });

    let mut buf = [0u8; 256];
    let n = server.read(&mut buf).await.unwrap();
    let sent = String::from_utf8_lossy(&buf[..n]).into_owned();
    assert!(sent.ends_with("-data-evaluate-expression $pc\n"));

    use tokio::io::AsyncWriteExt;
    server
        .write_all(br#"1^done,value="0x1000""#)
        .await
        .unwrap();
    server.write_all(b"\n").await.unwrap();

    let body = call.await.unwrap().unwrap().unwrap();
    assert_eq!(body["result"], json!("0x1000"));
}

#[tokio::test]
async fn evaluate_repl_monitor_passthrough_wraps_interpreter_exec() {
    let (client, mut server) = duplex(65536);
    let (mi_tx, _mi_events) = mpsc::unbounded_channel();
    let pipeline = Arc::new(MiPipeline::new(client, Duration::from_secs(2), mi_tx));
    let (dap_tx, _dap_rx) = mpsc::unbounded_channel();
    let state = Arc::new(StateMachine::new(dap_tx));
    state.begin_running();
    state.on_real_stop("breakpoint-hit", 1, None);
    let recovery = Arc::new(StopRecovery::new(pipeline.clone(), state.clone()));
    let handler = Handler::new(pipeline, state, recovery);

    let call = tokio::spawn(async move {
        handler
            .handle(&raw_request(
                2,
                "evaluate",
                json!({ "expression": "monitor reset", "context": "repl" }),
            ))
            .await
    });

    let mut buf = [0u8; 256];
    let n = server.read(&mut buf).await.unwrap();
    let sent = String::from_utf8_lossy(&buf[..n]).into_owned();
    assert!(sent.contains("-interpreter-exec console \"monitor reset\""));

    use tokio::io::AsyncWriteExt;
    server.write_all(b"1^done\n").await.unwrap();

    call.await.unwrap().unwrap();
}

#[tokio::test]
async fn get_registers_always_succeeds_and_reports_running_flags() {
    let h = build_harness();
    h.state.begin_running();
    h.state.on_synthetic_stop(1);
    h.state.set_registers(vec![("a0".into(), "0x2".into())]);

    let body = h
        .handler
        .handle(&raw_request(2, "mikro.getRegisters", json!({})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body["running"], json!(true));
    assert_eq!(body["syntheticStop"], json!(true));
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["registers"][0]["name"], json!("a0"));
    h.gdb_task.abort();
}

#[tokio::test]
async fn disassemble_returns_empty_when_read_blocked() {
    let h = build_harness();
    h.state.begin_running();

    let body = h
        .handler
        .handle(&raw_request(
            2,
            "disassemble",
            json!({ "memoryReference": "0x1000", "instructionCount": 4 }),
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body["instructions"], json!([]));
    h.gdb_task.abort();
}

#[tokio::test]
async fn set_instruction_breakpoints_sends_hardware_flag() {
    let (client, mut server) = duplex(65536);
    let (mi_tx, _mi_events) = mpsc::unbounded_channel();
    let pipeline = Arc::new(MiPipeline::new(client, Duration::from_secs(2), mi_tx));
    let (dap_tx, _dap_rx) = mpsc::unbounded_channel();
    let state = Arc::new(StateMachine::new(dap_tx));
    let recovery = Arc::new(StopRecovery::new(pipeline.clone(), state.clone()));
    let handler = Handler::new(pipeline, state, recovery);

    let call = tokio::spawn(async move {
        handler
            .handle(&raw_request(
                2,
                "setInstructionBreakpoints",
                json!({ "breakpoints": [{ "instructionReference": "0x1000" }] }),
            ))
            .await
    });

    let mut buf = [0u8; 256];
    let n = server.read(&mut buf).await.unwrap();
    let sent = String::from_utf8_lossy(&buf[..n]).into_owned();
    assert!(sent.contains("-break-insert -h *0x1000"));

    use tokio::io::AsyncWriteExt;
    server
        .write_all(
            br#"1^done,bkpt={number="9",type="hw breakpoint",disp="keep",enabled="y",addr="0x1000",func="main",file="a.c",fullname="/tmp/a.c",line="5",times="0"}
"#,
        )
        .await
        .unwrap();

    call.await.unwrap().unwrap();
}

#[tokio::test]
async fn set_instruction_breakpoints_caps_extras_beyond_hw_limit() {
    let h = build_harness();
    h.handler
        .handle(&raw_request(
            1,
            "launch",
            json!({
                "program": "/tmp/a.elf",
                "stopAtEntry": false,
                "serverCapabilities": { "hwBreakpointLimit": 1 },
            }),
        ))
        .await
        .unwrap();

    let body = h
        .handler
        .handle(&raw_request(
            2,
            "setInstructionBreakpoints",
            json!({
                "breakpoints": [
                    { "instructionReference": "0x1000" },
                    { "instructionReference": "0x2000" },
                ]
            }),
        ))
        .await
        .unwrap()
        .unwrap();
    let breakpoints = body["breakpoints"].as_array().unwrap();
    assert_eq!(breakpoints.len(), 2);
    assert_eq!(breakpoints[0]["verified"], json!(true));
    assert_eq!(breakpoints[1]["verified"], json!(false));
    assert!(breakpoints[1]["message"]
        .as_str()
        .unwrap()
        .contains("limit"));
    h.gdb_task.abort();
}

#[tokio::test]
async fn console_history_reflects_pushed_output() {
    let h = build_harness();
    h.state.push_console("console", "hello from gdb".to_string());
    h.state.push_console("target", "hello from sim".to_string());

    let body = h
        .handler
        .handle(&raw_request(2, "mikro.getConsoleHistory", json!({})))
        .await
        .unwrap()
        .unwrap();
    let lines = body["lines"].as_array().unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["output"], json!("hello from gdb"));
    assert_eq!(lines[1]["category"], json!("target"));
    h.gdb_task.abort();
}

#[test]
fn gdb_exit_result_class_parses_as_exit() {
    let record = dapmux::mi::parse_line("5^exit").unwrap();
    match record {
        dapmux::mi::MiRecord::Result(r) => assert_eq!(r.class, ResultClass::Exit),
        other => panic!("unexpected {other:?}"),
    }
}
