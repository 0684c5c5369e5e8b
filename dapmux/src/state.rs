/// The execution state machine: the single source of truth for whether
/// the target is stopped, running, or in a locally-fabricated synthetic
/// stop, and the only place allowed to mutate that belief.
///
/// Generalizes the gdbadapter `events::DebugState`/`ExecutionInfo` pair —
/// which tracked several interacting booleans across two structs — into
/// one tagged sum type per the design note in spec §9. Every legal
/// transition from spec §4.3 is a named method here; nothing else in the
/// crate is allowed to assign a new state directly.
use crate::dap::{ContinuedEventBody, DapStackFrame, StoppedEventBody};
use crate::mi::normalize_stop_reason;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecState {
    AwaitingConnect,
    AwaitingEntry,
    Stopped { reason: String, thread_id: i64 },
    Running,
    SyntheticStop { reason: String, thread_id: i64 },
    Terminated,
}

impl ExecState {
    pub fn is_read_blocked(&self) -> bool {
        matches!(self, ExecState::Running | ExecState::SyntheticStop { .. })
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, ExecState::SyntheticStop { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, ExecState::Terminated)
    }
}

/// DAP events the state machine produces on its own behalf. The session
/// loop turns these into framed wire messages; keeping them as a plain
/// enum here avoids a dependency on the framer/seq allocator from this
/// module.
#[derive(Debug, Clone)]
pub enum DapEvent {
    Initialized,
    Stopped(StoppedEventBody),
    Continued(ContinuedEventBody),
    Terminated,
    Exited { exit_code: i32 },
}

/// A single register `{name, value}` snapshot, captured at the last known
/// stop. Answers `variables`/`mikro.getRegisters` while in
/// `SyntheticStop`.
#[derive(Debug, Clone)]
pub struct RegisterCache(Vec<(String, String)>);

impl RegisterCache {
    pub fn set(&mut self, regs: Vec<(String, String)>) {
        self.0 = regs;
    }

    pub fn get(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl Default for RegisterCache {
    fn default() -> Self {
        Self(Vec::new())
    }
}

const CONSOLE_OUTPUT_CAP: usize = 1000;

/// One line of console/target/log output, kept around so a client that
/// attaches late (or re-requests scrollback) can still see recent history.
/// Grounded on the teacher's `events::ConsoleOutput`/`GdbEventHandler`,
/// which keeps the same 1000-entry cap by draining the oldest half of the
/// overflow.
#[derive(Debug, Clone)]
pub struct ConsoleLine {
    pub category: &'static str,
    pub text: String,
}

#[derive(Default)]
pub struct ConsoleOutput(Vec<ConsoleLine>);

impl ConsoleOutput {
    pub fn push(&mut self, category: &'static str, text: String) {
        self.0.push(ConsoleLine { category, text });
        let len = self.0.len();
        if len > CONSOLE_OUTPUT_CAP {
            self.0.drain(0..len - CONSOLE_OUTPUT_CAP);
        }
    }

    pub fn recent(&self, limit: Option<usize>) -> Vec<ConsoleLine> {
        match limit {
            Some(n) => self.0.iter().rev().take(n).rev().cloned().collect(),
            None => self.0.clone(),
        }
    }
}

struct Inner {
    state: ExecState,
    registers: RegisterCache,
    frames: Option<Vec<DapStackFrame>>,
    entry_stop_emitted: bool,
    console: ConsoleOutput,
}

pub struct StateMachine {
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<DapEvent>,
}

impl StateMachine {
    pub fn new(events: mpsc::UnboundedSender<DapEvent>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ExecState::AwaitingConnect,
                registers: RegisterCache::default(),
                frames: None,
                entry_stop_emitted: false,
                console: ConsoleOutput::default(),
            }),
            events,
        }
    }

    pub fn snapshot(&self) -> ExecState {
        self.inner.lock().unwrap().state.clone()
    }

    fn emit(&self, event: DapEvent) {
        let _ = self.events.send(event);
    }

    /// `AwaitingConnect` -> `AwaitingEntry`: startup handshake complete and
    /// `stopAtEntry` was requested. The entry-stop protocol (§4.4) drives
    /// the rest from here.
    pub fn handshake_complete_await_entry(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ExecState::AwaitingEntry;
    }

    /// `AwaitingConnect` -> `Running`: handshake complete, no entry stop
    /// wanted. Caller is responsible for issuing `-exec-continue`.
    pub fn handshake_complete_run(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ExecState::Running;
    }

    /// `AwaitingEntry` -> `Stopped{reason:"entry"}`, whether via a real
    /// thread-info/breakpoint observation or the 5s synthesis fallback.
    /// Idempotent: only the first call emits the DAP event.
    pub fn enter_stop(&self, thread_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ExecState::Stopped {
            reason: "entry".into(),
            thread_id,
        };
        if !inner.entry_stop_emitted {
            inner.entry_stop_emitted = true;
            drop(inner);
            self.emit(DapEvent::Stopped(StoppedEventBody {
                reason: "entry".into(),
                thread_id,
                all_threads_stopped: true,
                hit_breakpoint_ids: None,
            }));
        }
    }

    /// `Stopped` -> `Running`: a continue/step/next request was accepted
    /// by GDB. Caller arms the stop-recovery poller separately.
    pub fn begin_running(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ExecState::Running;
    }

    /// `Running` -> `Stopped`: a real `*stopped`/`=stopped` arrived.
    /// Clears both caches (they hold the *previous* stop's data) and
    /// emits the mapped DAP `stopped` event. `hit_breakpoint_ids` is
    /// populated by the caller from the record's `bkptno`, if present.
    pub fn on_real_stop(
        &self,
        raw_reason: &str,
        thread_id: i64,
        hit_breakpoint_ids: Option<Vec<u32>>,
    ) {
        let reason = normalize_stop_reason(raw_reason).to_string();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ExecState::Stopped {
                reason: reason.clone(),
                thread_id,
            };
            inner.registers.clear();
            inner.frames = None;
        }
        self.emit(DapEvent::Stopped(StoppedEventBody {
            reason,
            thread_id,
            all_threads_stopped: true,
            hit_breakpoint_ids,
        }));
    }

    /// `Running` -> `SyntheticStop`: the stop-recovery poller exhausted
    /// every escalation round. The target is believed frozen; a DAP
    /// `stopped` is emitted anyway so the client is never wedged.
    pub fn on_synthetic_stop(&self, thread_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ExecState::SyntheticStop {
            reason: "pause".into(),
            thread_id,
        };
        drop(inner);
        self.emit(DapEvent::Stopped(StoppedEventBody {
            reason: "pause".into(),
            thread_id,
            all_threads_stopped: true,
            hit_breakpoint_ids: None,
        }));
    }

    /// `SyntheticStop` -> `Running` via DAP `continue`. Per §4.3 this must
    /// NOT issue `-exec-continue` — GDB still believes it is running.
    /// Only a DAP `continued` event is produced; the caller re-arms stop
    /// detection.
    pub fn continue_from_synthetic(&self, thread_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ExecState::Running;
        drop(inner);
        self.emit(DapEvent::Continued(ContinuedEventBody {
            thread_id,
            all_threads_continued: true,
        }));
    }

    /// `SyntheticStop` -> `Running` via a DAP step request: clears the
    /// synthetic flag first so the caller's subsequent MI step command is
    /// not itself blocked by the read-block invariant.
    pub fn clear_synthetic_for_step(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ExecState::Running;
    }

    /// `SyntheticStop` -> `Stopped`: a real `*stopped` arrived late. Only
    /// emits if an entry/real stop for this transition hasn't already
    /// been delivered (the synthetic stop already told the client it was
    /// stopped; a second identical event would be redundant, but a
    /// *different* reason is still worth surfacing).
    pub fn late_real_stop_from_synthetic(&self, raw_reason: &str, thread_id: i64) {
        self.on_real_stop(raw_reason, thread_id, None);
    }

    /// Any state -> `Terminated`: GDB's process exited. The caller is
    /// responsible for rejecting pending MI futures separately (the
    /// pipeline owns that table).
    pub fn on_gdb_exit(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminated() {
            return;
        }
        inner.state = ExecState::Terminated;
        drop(inner);
        self.emit(DapEvent::Terminated);
    }

    pub fn set_registers(&self, regs: Vec<(String, String)>) {
        self.inner.lock().unwrap().registers.set(regs);
    }

    pub fn cached_registers(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().registers.get().to_vec()
    }

    pub fn set_frames(&self, frames: Vec<DapStackFrame>) {
        self.inner.lock().unwrap().frames = Some(frames);
    }

    pub fn cached_frames(&self) -> Vec<DapStackFrame> {
        self.inner
            .lock()
            .unwrap()
            .frames
            .clone()
            .unwrap_or_default()
    }

    /// Appends one line to the console ring buffer. `category` is the MI
    /// stream kind (`"console"`/`"target"`/`"log"`) as a DAP `output`
    /// event's `category` field expects.
    pub fn push_console(&self, category: &'static str, text: String) {
        self.inner.lock().unwrap().console.push(category, text);
    }

    /// Last `limit` console lines (or all of them if `None`), oldest
    /// first. Used by `mikro.getConsoleHistory` for clients attaching
    /// after output has already scrolled past.
    pub fn recent_console(&self, limit: Option<usize>) -> Vec<ConsoleLine> {
        self.inner.lock().unwrap().console.recent(limit)
    }
}

/// Variable-reference arena: maps an opaque integer handle (assigned
/// monotonically) to one of the three descriptor kinds, per §3/§9.
/// Handles are stable for the session's lifetime; a stale or unknown
/// handle resolves to the empty list rather than an error. Cleared on
/// `launch`.
#[derive(Debug, Clone, PartialEq)]
pub enum VarRefKind {
    Locals { frame_id: i64 },
    Registers,
    MemoryWindow { address: u64, length: u64 },
}

#[derive(Default)]
pub struct VarRefTable {
    next: i64,
    table: HashMap<i64, VarRefKind>,
}

impl VarRefTable {
    pub fn new() -> Self {
        Self {
            next: 1000,
            table: HashMap::new(),
        }
    }

    pub fn insert(&mut self, kind: VarRefKind) -> i64 {
        let handle = self.next;
        self.next += 1;
        self.table.insert(handle, kind);
        handle
    }

    pub fn resolve(&self, handle: i64) -> Option<&VarRefKind> {
        self.table.get(&handle)
    }

    pub fn clear(&mut self) {
        self.table.clear();
        self.next = 1000;
    }
}
