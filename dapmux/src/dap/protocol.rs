/// DAP message envelope and the request/response/event bodies this adapter
/// actually understands (§6 of the spec). Grounded on the pack's own
/// minimal DAP servers (`vitte-dap`, `headcrab-dap`): an untyped envelope
/// dispatched by `command`, with per-command argument/body structs
/// deserialized on demand rather than one giant tagged enum — this is
/// friendlier to DAP's habit of omitting fields and sending unknown
/// extension requests the adapter should ignore rather than reject.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

/// A decoded but not-yet-typed client message.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

impl RawRequest {
    pub fn is_request(&self) -> bool {
        self.msg_type == "request"
    }

    pub fn args<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.arguments.clone())
    }
}

/// Monotonic `seq` allocator for outgoing responses/events, mirroring the
/// token counter the MI pipeline uses for the GDB side.
#[derive(Debug, Default)]
pub struct SeqCounter(AtomicI64);

impl SeqCounter {
    pub fn new() -> Self {
        Self(AtomicI64::new(1))
    }

    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub seq: i64,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Response {
    pub fn success(seq: i64, request_seq: i64, command: &str, body: Option<Value>) -> Self {
        Self {
            seq,
            msg_type: "response",
            request_seq,
            success: true,
            command: command.to_string(),
            message: None,
            body,
        }
    }

    pub fn failure(seq: i64, request_seq: i64, command: &str, message: impl Into<String>) -> Self {
        Self {
            seq,
            msg_type: "response",
            request_seq,
            success: false,
            command: command.to_string(),
            message: Some(message.into()),
            body: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub seq: i64,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Event {
    pub fn new(seq: i64, event: &str, body: Option<Value>) -> Self {
        Self {
            seq,
            msg_type: "event",
            event: event.to_string(),
            body,
        }
    }
}

/* ---------------------------- argument bodies ---------------------------- */

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArgs {
    pub program: String,
    #[serde(default)]
    pub gdb_path: Option<String>,
    #[serde(default)]
    pub mi_debugger_path: Option<String>,
    #[serde(default)]
    pub mi_debugger_server_address: Option<String>,
    #[serde(default = "default_stop_at_entry")]
    pub stop_at_entry: bool,
    #[serde(default)]
    pub entry_point: Option<u64>,
    #[serde(default)]
    pub gdb_timeout_ms: Option<u64>,
    #[serde(default)]
    pub server_capabilities: ServerCapabilities,
    #[serde(default)]
    pub post_connect_commands: Vec<String>,
    #[serde(default)]
    pub load_command: Option<String>,
    /// Path to the simulator binary, spawned separately from GDB so its
    /// stdout/stdin carry the `[ASSERT]` MMIO prompt protocol (§4.7)
    /// independent of the MI stream. `None` disables the assert responder
    /// entirely (e.g. when GDB itself launches the simulator).
    #[serde(default)]
    pub simulator_path: Option<String>,
    #[serde(default = "default_auto_reply_writes")]
    pub auto_reply_writes: bool,
}

fn default_auto_reply_writes() -> bool {
    true
}

fn default_stop_at_entry() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(default)]
    pub supports_hardware_breakpoints: bool,
    #[serde(default)]
    pub supports_watchpoints: bool,
    #[serde(default)]
    pub supports_multi_thread: bool,
    #[serde(default)]
    pub hw_breakpoint_limit: Option<u32>,
    #[serde(default)]
    pub supports_live_memory_read: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    pub line: u32,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsArgs {
    pub source: Source,
    #[serde(default)]
    pub breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionBreakpoint {
    pub instruction_reference: String,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetInstructionBreakpointsArgs {
    #[serde(default)]
    pub breakpoints: Vec<InstructionBreakpoint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataBreakpoint {
    pub data_id: String,
    #[serde(default)]
    pub access_type: Option<String>, // "read" | "write" | "readWrite"
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDataBreakpointsArgs {
    #[serde(default)]
    pub breakpoints: Vec<DataBreakpoint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataBreakpointInfoArgs {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisassembleArgs {
    pub memory_reference: String,
    #[serde(default)]
    pub instruction_offset: Option<i64>,
    pub instruction_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceArgs {
    #[serde(default)]
    pub thread_id: i64,
    #[serde(default)]
    pub start_frame: Option<u32>,
    #[serde(default)]
    pub levels: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesArgs {
    pub frame_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesArgs {
    pub variables_reference: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMemoryArgs {
    pub memory_reference: String,
    #[serde(default)]
    pub offset: Option<i64>,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArgs {
    pub expression: String,
    #[serde(default)]
    pub frame_id: Option<i64>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadScopedArgs {
    #[serde(default)]
    pub thread_id: i64,
}

/* ----------------------------- response bodies ---------------------------- */

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub supports_configuration_done_request: bool,
    pub supports_conditional_breakpoints: bool,
    pub supports_instruction_breakpoints: bool,
    pub supports_data_breakpoints: bool,
    pub supports_disassemble_request: bool,
    pub supports_read_memory_request: bool,
    pub supports_evaluate_for_hovers: bool,
    pub supports_terminate_request: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_configuration_done_request: true,
            supports_conditional_breakpoints: true,
            supports_instruction_breakpoints: true,
            supports_data_breakpoints: true,
            supports_disassemble_request: true,
            supports_read_memory_request: true,
            supports_evaluate_for_hovers: true,
            supports_terminate_request: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEventBody {
    pub reason: String,
    pub thread_id: i64,
    pub all_threads_stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_breakpoint_ids: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuedEventBody {
    pub thread_id: i64,
    pub all_threads_continued: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEventBody {
    pub category: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitedEventBody {
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DapSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DapStackFrame {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<DapSource>,
    pub line: u32,
    pub column: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction_pointer_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DapScope {
    pub name: String,
    pub variables_reference: i64,
    pub expensive: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DapVariable {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    pub variables_reference: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DapBreakpoint {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
