/// DAP request handler: maps every request §6 names onto an MI command
/// sequence, gated by the execution state machine's read-blocked
/// invariant.
///
/// Grounded on the teacher's `GdbCommands` (commands.rs) for the
/// MI-command-per-operation mapping and result-tuple extraction idiom
/// (`result.results.get("stack")` etc.), generalized from its
/// synchronous-looking per-call API onto the token pipeline, and on the
/// pack's `vitte-dap`/`headcrab-dap` examples for the request/response
/// envelope shape.
use crate::breakpoints::BreakpointRegistry;
use crate::dap::*;
use crate::mi::MiValue;
use crate::pipeline::{MiPipeline, PipelineError};
use crate::recovery::{RecoveryTrigger, StopRecovery};
use crate::state::{ExecState, StateMachine, VarRefKind, VarRefTable};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWrite;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("bad arguments: {0}")]
    BadArguments(#[from] serde_json::Error),
    #[error("missing field '{0}' in gdb reply")]
    MissingField(&'static str),
    #[error("the target is running")]
    TargetRunning,
    #[error("unsupported command: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, HandlerError>;

/// The single-consumer request dispatcher. Requests are handled strictly
/// in receive order by the session loop calling `handle` once per
/// incoming `RawRequest` and awaiting its result before reading the next
/// one off the framer — this struct does not itself queue anything.
pub struct Handler<W> {
    pipeline: Arc<MiPipeline<W>>,
    state: Arc<StateMachine>,
    recovery: Arc<StopRecovery<W>>,
    breakpoints: Mutex<BreakpointRegistry>,
    var_refs: Mutex<VarRefTable>,
    capabilities: Mutex<ServerCapabilities>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> Handler<W> {
    pub fn new(
        pipeline: Arc<MiPipeline<W>>,
        state: Arc<StateMachine>,
        recovery: Arc<StopRecovery<W>>,
    ) -> Self {
        Self {
            pipeline,
            state,
            recovery,
            breakpoints: Mutex::new(BreakpointRegistry::new()),
            var_refs: Mutex::new(VarRefTable::new()),
            capabilities: Mutex::new(ServerCapabilities::default()),
        }
    }

    /// Dispatches one DAP request and builds its `Response` directly
    /// (caller assigns `seq`).
    pub async fn handle(&self, req: &RawRequest) -> std::result::Result<Option<Value>, String> {
        let result = match req.command.as_str() {
            "initialize" => self.initialize(),
            "launch" => self.launch(req).await,
            "configurationDone" => Ok(None),
            "setBreakpoints" => self.set_breakpoints(req).await,
            "setExceptionBreakpoints" => Ok(Some(json!({ "breakpoints": [] }))),
            "setInstructionBreakpoints" => self.set_instruction_breakpoints(req).await,
            "setDataBreakpoints" => self.set_data_breakpoints(req).await,
            "dataBreakpointInfo" => self.data_breakpoint_info(req),
            "disassemble" => self.disassemble(req).await,
            "threads" => self.threads().await,
            "stackTrace" => self.stack_trace(req).await,
            "scopes" => self.scopes(req),
            "variables" => self.variables(req).await,
            "readMemory" => self.read_memory(req).await,
            "continue" => self.continue_(req).await,
            "pause" => self.pause(req).await,
            "next" => self.next(req).await,
            "stepIn" => self.step_in(req).await,
            "stepOut" => self.step_out(req).await,
            "evaluate" => self.evaluate(req).await,
            "disconnect" => self.disconnect().await,
            "terminate" => self.terminate().await,
            "mikro.getRegisters" => self.get_registers().await,
            "mikro.getConsoleHistory" => self.get_console_history(req),
            other => Err(HandlerError::Unsupported(other.to_string())),
        };
        result.map_err(|e| e.to_string())
    }

    fn initialize(&self) -> Result<Option<Value>> {
        Ok(Some(serde_json::to_value(Capabilities::default())?))
    }

    async fn launch(&self, req: &RawRequest) -> Result<Option<Value>> {
        let args: LaunchArgs = req.args()?;
        *self.capabilities.lock().unwrap() = args.server_capabilities.clone();

        self.pipeline
            .send("-gdb-set pagination off", None)
            .await?;
        self.pipeline
            .send("-gdb-set breakpoint pending on", None)
            .await?;
        self.pipeline
            .send("-gdb-set target-async on", None)
            .await?;
        self.pipeline
            .send(&format!("-file-exec-and-symbols \"{}\"", args.program), None)
            .await?;

        if let Some(addr) = &args.mi_debugger_server_address {
            self.pipeline
                .send(&format!("-target-select remote {addr}"), None)
                .await?;
        }

        if let Some(load_cmd) = &args.load_command {
            self.pipeline
                .send(&format!("-interpreter-exec console \"{load_cmd}\""), None)
                .await?;
        }

        for cmd in &args.post_connect_commands {
            self.pipeline
                .send(&format!("-interpreter-exec console \"{cmd}\""), None)
                .await?;
        }

        if args.stop_at_entry {
            self.state.handshake_complete_await_entry();
            let entry = args
                .entry_point
                .map(|a| format!("*0x{a:x}"))
                .unwrap_or_else(|| "main".to_string());
            let recovery = self.recovery.clone();
            tokio::spawn(async move {
                recovery.run_entry_stop(1, &entry).await;
            });
        } else {
            self.state.handshake_complete_run();
            self.pipeline.send("-exec-run", None).await?;
            self.recovery.arm(RecoveryTrigger::Continue, 1);
        }

        Ok(None)
    }

    async fn set_breakpoints(&self, req: &RawRequest) -> Result<Option<Value>> {
        let args: SetBreakpointsArgs = req.args()?;
        let path = args
            .source
            .path
            .clone()
            .or(args.source.name.clone())
            .unwrap_or_default();

        let old_ids = self.breakpoints.lock().unwrap().take_source(&path);
        if !old_ids.is_empty() {
            let list = old_ids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            self.pipeline
                .send(&format!("-break-delete {list}"), None)
                .await?;
        }

        let mut new_ids = Vec::with_capacity(args.breakpoints.len());
        let mut body = Vec::with_capacity(args.breakpoints.len());
        for bp in &args.breakpoints {
            let location = format!("{path}:{}", bp.line);
            let cmd = match &bp.condition {
                Some(cond) => format!("-break-insert -c \"{cond}\" {location}"),
                None => format!("-break-insert {location}"),
            };
            match self.pipeline.send(&cmd, None).await {
                Ok(result) => {
                    let bkpt = result
                        .results
                        .get("bkpt")
                        .and_then(MiValue::as_tuple)
                        .ok_or(HandlerError::MissingField("bkpt"))?;
                    let id = bkpt
                        .get("number")
                        .and_then(MiValue::as_u64)
                        .ok_or(HandlerError::MissingField("number"))?
                        as u32;
                    new_ids.push(id);
                    body.push(DapBreakpoint {
                        verified: true,
                        id: Some(id),
                        line: Some(bp.line),
                        message: None,
                    });
                }
                Err(e) => body.push(DapBreakpoint {
                    verified: false,
                    id: None,
                    line: Some(bp.line),
                    message: Some(e.to_string()),
                }),
            }
        }
        self.breakpoints.lock().unwrap().set_source(&path, new_ids);

        Ok(Some(json!({ "breakpoints": body })))
    }

    async fn set_instruction_breakpoints(&self, req: &RawRequest) -> Result<Option<Value>> {
        let args: SetInstructionBreakpointsArgs = req.args()?;
        let old_ids = self.breakpoints.lock().unwrap().take_instruction();
        if !old_ids.is_empty() {
            let list = old_ids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            self.pipeline
                .send(&format!("-break-delete {list}"), None)
                .await?;
        }

        let limit = self.capabilities.lock().unwrap().hw_breakpoint_limit;

        let mut new_ids = Vec::with_capacity(args.breakpoints.len());
        let mut body = Vec::with_capacity(args.breakpoints.len());
        for (i, ib) in args.breakpoints.iter().enumerate() {
            if let Some(limit) = limit {
                if i as u32 >= limit {
                    body.push(DapBreakpoint {
                        verified: false,
                        id: None,
                        line: None,
                        message: Some(format!(
                            "hardware breakpoint limit ({limit}) exceeded"
                        )),
                    });
                    continue;
                }
            }
            let cmd = match &ib.condition {
                Some(cond) => format!(
                    "-break-insert -h -c \"{cond}\" *{}",
                    ib.instruction_reference
                ),
                None => format!("-break-insert -h *{}", ib.instruction_reference),
            };
            match self.pipeline.send(&cmd, None).await {
                Ok(result) => {
                    let bkpt = result
                        .results
                        .get("bkpt")
                        .and_then(MiValue::as_tuple)
                        .ok_or(HandlerError::MissingField("bkpt"))?;
                    let id = bkpt
                        .get("number")
                        .and_then(MiValue::as_u64)
                        .ok_or(HandlerError::MissingField("number"))? as u32;
                    new_ids.push(id);
                    body.push(DapBreakpoint {
                        verified: true,
                        id: Some(id),
                        line: None,
                        message: None,
                    });
                }
                Err(e) => body.push(DapBreakpoint {
                    verified: false,
                    id: None,
                    line: None,
                    message: Some(e.to_string()),
                }),
            }
        }
        self.breakpoints
            .lock()
            .unwrap()
            .set_instruction(new_ids);

        Ok(Some(json!({ "breakpoints": body })))
    }

    async fn set_data_breakpoints(&self, req: &RawRequest) -> Result<Option<Value>> {
        let args: SetDataBreakpointsArgs = req.args()?;
        let old_ids = self.breakpoints.lock().unwrap().take_watch();
        if !old_ids.is_empty() {
            let list = old_ids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            self.pipeline
                .send(&format!("-break-delete {list}"), None)
                .await?;
        }

        let mut new_ids = Vec::with_capacity(args.breakpoints.len());
        let mut body = Vec::with_capacity(args.breakpoints.len());
        for db in &args.breakpoints {
            let flag = match db.access_type.as_deref() {
                Some("read") => "-r",
                Some("readWrite") => "-a",
                _ => "",
            };
            let cmd = format!("-break-watch {flag} {}", db.data_id)
                .replace("  ", " ");
            match self.pipeline.send(&cmd, None).await {
                Ok(result) => {
                    let wpt = result
                        .results
                        .iter()
                        .find_map(|(k, v)| (k.ends_with("wpt")).then_some(v))
                        .and_then(MiValue::as_tuple)
                        .ok_or(HandlerError::MissingField("wpt"))?;
                    let id = wpt
                        .get("number")
                        .and_then(MiValue::as_u64)
                        .ok_or(HandlerError::MissingField("number"))? as u32;
                    new_ids.push(id);
                    body.push(DapBreakpoint {
                        verified: true,
                        id: Some(id),
                        line: None,
                        message: None,
                    });
                }
                Err(e) => body.push(DapBreakpoint {
                    verified: false,
                    id: None,
                    line: None,
                    message: Some(e.to_string()),
                }),
            }
        }
        self.breakpoints.lock().unwrap().set_watch(new_ids);

        Ok(Some(json!({ "breakpoints": body })))
    }

    fn data_breakpoint_info(&self, req: &RawRequest) -> Result<Option<Value>> {
        let args: DataBreakpointInfoArgs = req.args()?;
        Ok(Some(json!({
            "dataId": args.name,
            "description": format!("watch {}", args.name),
            "accessTypes": ["read", "write", "readWrite"],
        })))
    }

    async fn disassemble(&self, req: &RawRequest) -> Result<Option<Value>> {
        let args: DisassembleArgs = req.args()?;
        let start = crate::mi::parse_numeric_literal(&args.memory_reference)
            .ok_or(HandlerError::MissingField("memoryReference"))?;
        let offset = args.instruction_offset.unwrap_or(0) * 4;
        let start = (start as i64 + offset).max(0) as u64;

        if self.state.snapshot().is_read_blocked() {
            return Ok(Some(json!({ "instructions": Vec::<Value>::new() })));
        }

        let end = start + (args.instruction_count as u64) * 4;
        let cmd = format!("-data-disassemble -s 0x{start:x} -e 0x{end:x} -- 0");
        let result = self.pipeline.send(&cmd, None).await?;
        let asm = result
            .results
            .get("asm_insns")
            .map(MiValue::as_tuple_list)
            .unwrap_or_default();
        let instructions: Vec<Value> = asm
            .iter()
            .map(|t| {
                json!({
                    "address": t.get("address").and_then(MiValue::as_str).unwrap_or_default(),
                    "instruction": t.get("inst").and_then(MiValue::as_str).unwrap_or_default(),
                })
            })
            .collect();
        Ok(Some(json!({ "instructions": instructions })))
    }

    async fn threads(&self) -> Result<Option<Value>> {
        let result = self.pipeline.send("-thread-info", None).await?;
        let threads = result
            .results
            .get("threads")
            .map(MiValue::as_tuple_list)
            .unwrap_or_default();
        let body: Vec<Thread> = threads
            .iter()
            .map(|t| Thread {
                id: t.get("id").and_then(MiValue::as_i64).unwrap_or(1),
                name: t
                    .get("target-id")
                    .and_then(MiValue::as_str)
                    .unwrap_or("target")
                    .to_string(),
            })
            .collect();
        let body = if body.is_empty() {
            vec![Thread {
                id: 1,
                name: "target".into(),
            }]
        } else {
            body
        };
        Ok(Some(json!({ "threads": body })))
    }

    async fn stack_trace(&self, req: &RawRequest) -> Result<Option<Value>> {
        let args: StackTraceArgs = req.args()?;
        let state = self.state.snapshot();
        let frames = if state.is_read_blocked() {
            self.state.cached_frames()
        } else {
            let result = self.pipeline.send("-stack-list-frames", None).await?;
            let raw = result
                .results
                .get("stack")
                .map(MiValue::as_tuple_list)
                .unwrap_or_default();
            let frames: Vec<DapStackFrame> = raw
                .iter()
                .map(|f| {
                    let file = f.get("file").and_then(MiValue::as_str).map(str::to_string);
                    let path = f
                        .get("fullname")
                        .and_then(MiValue::as_str)
                        .map(str::to_string)
                        .or_else(|| file.clone());
                    DapStackFrame {
                        id: f.get("level").and_then(MiValue::as_i64).unwrap_or(0),
                        name: f
                            .get("func")
                            .and_then(MiValue::as_str)
                            .unwrap_or("??")
                            .to_string(),
                        source: path.map(|p| DapSource {
                            name: file,
                            path: Some(p),
                        }),
                        line: f.get("line").and_then(MiValue::as_u64).unwrap_or(0) as u32,
                        column: 0,
                        instruction_pointer_reference: f
                            .get("addr")
                            .and_then(MiValue::as_str)
                            .map(str::to_string),
                    }
                })
                .collect();
            self.state.set_frames(frames.clone());
            frames
        };

        let start = args.start_frame.unwrap_or(0) as usize;
        let levels = args.levels.map(|l| l as usize);
        let slice: Vec<&DapStackFrame> = frames
            .iter()
            .skip(start)
            .take(levels.unwrap_or(frames.len()))
            .collect();

        Ok(Some(json!({
            "stackFrames": slice,
            "totalFrames": frames.len(),
        })))
    }

    fn scopes(&self, req: &RawRequest) -> Result<Option<Value>> {
        let args: ScopesArgs = req.args()?;
        let mut refs = self.var_refs.lock().unwrap();
        let locals_ref = refs.insert(VarRefKind::Locals {
            frame_id: args.frame_id,
        });
        let registers_ref = refs.insert(VarRefKind::Registers);
        Ok(Some(json!({
            "scopes": [
                DapScope { name: "Locals".into(), variables_reference: locals_ref, expensive: false },
                DapScope { name: "Registers".into(), variables_reference: registers_ref, expensive: false },
            ]
        })))
    }

    async fn variables(&self, req: &RawRequest) -> Result<Option<Value>> {
        let args: VariablesArgs = req.args()?;
        let kind = self
            .var_refs
            .lock()
            .unwrap()
            .resolve(args.variables_reference)
            .cloned();
        let read_blocked = self.state.snapshot().is_read_blocked();

        let variables = match kind {
            Some(VarRefKind::Locals { frame_id }) => {
                if read_blocked {
                    Vec::new()
                } else {
                    self.pipeline
                        .send(&format!("-stack-select-frame {frame_id}"), None)
                        .await?;
                    let result = self
                        .pipeline
                        .send("-stack-list-variables --all-values", None)
                        .await?;
                    let raw = result
                        .results
                        .get("variables")
                        .map(MiValue::as_tuple_list)
                        .unwrap_or_default();
                    raw.iter()
                        .map(|v| DapVariable {
                            name: v.get("name").and_then(MiValue::as_str).unwrap_or("").to_string(),
                            value: v.get("value").and_then(MiValue::as_str).unwrap_or("").to_string(),
                            r#type: v.get("type").and_then(MiValue::as_str).map(str::to_string),
                            variables_reference: 0,
                        })
                        .collect()
                }
            }
            Some(VarRefKind::Registers) => {
                let pairs = if read_blocked {
                    self.state.cached_registers()
                } else {
                    self.fetch_live_registers().await?
                };
                pairs
                    .into_iter()
                    .map(|(name, value)| DapVariable {
                        name,
                        value,
                        r#type: None,
                        variables_reference: 0,
                    })
                    .collect()
            }
            Some(VarRefKind::MemoryWindow { address, length }) => {
                if read_blocked {
                    vec![DapVariable {
                        name: "bytes".into(),
                        value: "<running>".into(),
                        r#type: Some("bytes".into()),
                        variables_reference: 0,
                    }]
                } else {
                    let cmd = format!("-data-read-memory-bytes 0x{address:x} {length}");
                    let result = self.pipeline.send(&cmd, None).await?;
                    let memory = result
                        .results
                        .get("memory")
                        .map(MiValue::as_tuple_list)
                        .unwrap_or_default();
                    memory
                        .iter()
                        .filter_map(|m| {
                            let contents = m.get("contents").and_then(MiValue::as_str)?;
                            Some(DapVariable {
                                name: "bytes".into(),
                                value: contents.to_string(),
                                r#type: Some("bytes".into()),
                                variables_reference: 0,
                            })
                        })
                        .collect()
                }
            }
            None => Vec::new(),
        };

        Ok(Some(json!({ "variables": variables })))
    }

    /// Live register names + values off GDB, caching the result for
    /// `SyntheticStop`/`Running` reads to fall back on. Shared by
    /// `variables` (Registers scope) and `mikro.getRegisters`.
    async fn fetch_live_registers(&self) -> Result<Vec<(String, String)>> {
        let names_result = self.pipeline.send("-data-list-register-names", None).await?;
        let names: Vec<String> = names_result
            .results
            .get("register-names")
            .and_then(MiValue::as_list)
            .map(|l| l.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let values_result = self.pipeline.send("-data-list-register-values x", None).await?;
        let raw = values_result
            .results
            .get("register-values")
            .map(MiValue::as_tuple_list)
            .unwrap_or_default();
        let pairs: Vec<(String, String)> = raw
            .iter()
            .filter_map(|v| {
                let idx = v.get("number").and_then(MiValue::as_u64)? as usize;
                let value = v.get("value").and_then(MiValue::as_str)?.to_string();
                let name = names.get(idx).cloned().unwrap_or_else(|| idx.to_string());
                Some((name, value))
            })
            .collect();
        self.state.set_registers(pairs.clone());
        Ok(pairs)
    }

    async fn read_memory(&self, req: &RawRequest) -> Result<Option<Value>> {
        let args: ReadMemoryArgs = req.args()?;
        let base = crate::mi::parse_numeric_literal(&args.memory_reference)
            .ok_or(HandlerError::MissingField("memoryReference"))?;
        let address = (base as i64 + args.offset.unwrap_or(0)).max(0) as u64;

        if self.state.snapshot().is_read_blocked() {
            return Ok(Some(json!({
                "address": format!("0x{address:x}"),
                "data": "<running>",
            })));
        }

        let cmd = format!("-data-read-memory-bytes 0x{address:x} {}", args.count);
        let result = self.pipeline.send(&cmd, None).await?;
        let memory = result
            .results
            .get("memory")
            .map(MiValue::as_tuple_list)
            .unwrap_or_default();
        let data = memory
            .first()
            .and_then(|m| m.get("contents"))
            .and_then(MiValue::as_str)
            .unwrap_or("");
        Ok(Some(json!({
            "address": format!("0x{address:x}"),
            "data": data,
        })))
    }

    async fn continue_(&self, _req: &RawRequest) -> Result<Option<Value>> {
        match self.state.snapshot() {
            ExecState::SyntheticStop { thread_id, .. } => {
                self.state.continue_from_synthetic(thread_id);
                self.recovery.arm(RecoveryTrigger::Continue, thread_id);
            }
            ExecState::Stopped { thread_id, .. } => {
                self.pipeline.send("-exec-continue", None).await?;
                self.state.begin_running();
                self.recovery.arm(RecoveryTrigger::Continue, thread_id);
            }
            _ => return Err(HandlerError::TargetRunning),
        }
        Ok(Some(json!({ "allThreadsContinued": true })))
    }

    async fn pause(&self, _req: &RawRequest) -> Result<Option<Value>> {
        let thread_id = match self.state.snapshot() {
            ExecState::Running => 1,
            _ => return Err(HandlerError::TargetRunning),
        };
        self.pipeline.send("-exec-interrupt", None).await?;
        self.recovery.arm(RecoveryTrigger::Pause, thread_id);
        Ok(None)
    }

    async fn step_command(&self, mi_cmd: &str) -> Result<Option<Value>> {
        let thread_id = match self.state.snapshot() {
            ExecState::Stopped { thread_id, .. } => thread_id,
            ExecState::SyntheticStop { thread_id, .. } => {
                self.state.clear_synthetic_for_step();
                thread_id
            }
            _ => return Err(HandlerError::TargetRunning),
        };
        self.pipeline.send(mi_cmd, None).await?;
        self.state.begin_running();
        self.recovery.arm(RecoveryTrigger::Step, thread_id);
        Ok(None)
    }

    async fn next(&self, _req: &RawRequest) -> Result<Option<Value>> {
        self.step_command("-exec-next").await
    }

    async fn step_in(&self, _req: &RawRequest) -> Result<Option<Value>> {
        self.step_command("-exec-step").await
    }

    async fn step_out(&self, _req: &RawRequest) -> Result<Option<Value>> {
        self.step_command("-exec-finish").await
    }

    async fn evaluate(&self, req: &RawRequest) -> Result<Option<Value>> {
        let args: EvaluateArgs = req.args()?;

        if self.state.snapshot().is_read_blocked() {
            return Ok(Some(json!({ "result": "<running>", "variablesReference": 0 })));
        }

        if args.context.as_deref() == Some("repl") {
            let expr = args.expression.trim();
            if let Some(monitor_cmd) = expr.strip_prefix("monitor ") {
                self.pipeline
                    .send(&format!("-interpreter-exec console \"monitor {monitor_cmd}\""), None)
                    .await?;
                return Ok(Some(json!({ "result": "", "variablesReference": 0 })));
            }
            if expr.starts_with('-') {
                let result = self.pipeline.send(expr, None).await?;
                let value = result
                    .results
                    .get("value")
                    .and_then(MiValue::as_str)
                    .unwrap_or("")
                    .to_string();
                return Ok(Some(json!({ "result": value, "variablesReference": 0 })));
            }
        }

        if let Some(frame_id) = args.frame_id {
            self.pipeline
                .send(&format!("-stack-select-frame {frame_id}"), None)
                .await?;
        }
        let cmd = format!("-data-evaluate-expression \"{}\"", args.expression);
        let result = self.pipeline.send(&cmd, None).await?;
        let value = result
            .results
            .get("value")
            .and_then(MiValue::as_str)
            .unwrap_or("")
            .to_string();
        Ok(Some(json!({ "result": value, "variablesReference": 0 })))
    }

    async fn disconnect(&self) -> Result<Option<Value>> {
        let _ = self.pipeline.send("-gdb-exit", Some(std::time::Duration::from_secs(2))).await;
        Ok(None)
    }

    async fn terminate(&self) -> Result<Option<Value>> {
        let _ = self.pipeline.send("-gdb-exit", Some(std::time::Duration::from_secs(2))).await;
        Ok(None)
    }

    /// Vendor extension: always answers from the cached/live register list
    /// (never unsupported), surfacing `running`/`syntheticStop` so a client
    /// can tell a stale snapshot from a fresh read. The `$pc`/`$ra`/`$sp`
    /// enrichment is the part gated behind `supportsLiveMemoryRead`, and
    /// only attempted when the target isn't read-blocked.
    async fn get_registers(&self) -> Result<Option<Value>> {
        let state = self.state.snapshot();
        let read_blocked = state.is_read_blocked();
        let synthetic_stop = state.is_synthetic();

        let mut pairs = if read_blocked {
            self.state.cached_registers()
        } else {
            self.fetch_live_registers().await?
        };

        if !read_blocked && self.capabilities.lock().unwrap().supports_live_memory_read {
            for reg in ["$pc", "$ra", "$sp"] {
                let cmd = format!("-data-evaluate-expression {reg}");
                if let Ok(result) = self.pipeline.send(&cmd, None).await {
                    let value = result
                        .results
                        .get("value")
                        .and_then(MiValue::as_str)
                        .unwrap_or("")
                        .to_string();
                    let name = reg.trim_start_matches('$').to_string();
                    match pairs.iter_mut().find(|(n, _)| *n == name) {
                        Some(existing) => existing.1 = value,
                        None => pairs.push((name, value)),
                    }
                }
            }
            self.state.set_registers(pairs.clone());
        }

        let registers: Vec<Value> = pairs
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        Ok(Some(json!({
            "running": read_blocked,
            "syntheticStop": synthetic_stop,
            "count": registers.len(),
            "registers": registers,
        })))
    }

    /// Scrollback for a client attaching after console output has already
    /// flushed past; backed by the state machine's capped ring buffer
    /// rather than anything GDB is asked for.
    fn get_console_history(&self, req: &RawRequest) -> Result<Option<Value>> {
        #[derive(serde::Deserialize, Default)]
        struct Args {
            limit: Option<usize>,
        }
        let args: Args = req.args().unwrap_or_default();
        let lines = self
            .state
            .recent_console(args.limit)
            .into_iter()
            .map(|l| json!({ "category": l.category, "output": l.text }))
            .collect::<Vec<_>>();
        Ok(Some(json!({ "lines": lines })))
    }
}
