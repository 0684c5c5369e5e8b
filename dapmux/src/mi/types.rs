/// GDB/MI record and value types.
///
/// Mirrors the subset of GDB/MI described in the gdbadapter `types` module,
/// generalized to carry the correlation token on *every* record kind (not
/// just results) and to distinguish the notify-async stopped spelling from
/// the exec-async one, since the state machine must treat both as the
/// target having stopped.
use std::collections::HashMap;

/// One parsed line of GDB/MI output.
#[derive(Debug, Clone, PartialEq)]
pub enum MiRecord {
    Result(MiResult),
    Exec(MiAsync),
    Notify(MiAsync),
    Stream(MiStream),
}

impl MiRecord {
    /// True for `*stopped`, `=stopped`, and `=thread-group-stopped` — the
    /// three spellings GDB is known to use for "the target is stopped".
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            MiRecord::Exec(a) if a.class == AsyncClass::Stopped
        ) || matches!(
            self,
            MiRecord::Notify(a) if matches!(a.class, AsyncClass::Stopped | AsyncClass::ThreadGroupStopped)
        )
    }
}

/// A result record: `[token]^class[,results]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MiResult {
    pub token: Option<u32>,
    pub class: ResultClass,
    pub results: HashMap<String, MiValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

/// An async record: `(*|=)class[,results]`. Async records never carry a
/// correlation token — tokens are a result-record-only concept (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct MiAsync {
    pub class: AsyncClass,
    pub results: HashMap<String, MiValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncClass {
    Running,
    Stopped,
    ThreadGroupAdded,
    ThreadGroupRemoved,
    ThreadGroupStarted,
    ThreadGroupExited,
    ThreadGroupStopped,
    ThreadCreated,
    ThreadExited,
    ThreadSelected,
    LibraryLoaded,
    LibraryUnloaded,
    TraceframeChanged,
    TsvCreated,
    TsvDeleted,
    TsvModified,
    BreakpointCreated,
    BreakpointModified,
    BreakpointDeleted,
    RecordStarted,
    RecordStopped,
    CmdParamChanged,
    MemoryChanged,
    /// Anything the lexer recognizes syntactically but has no named class
    /// for. Kept so unfamiliar notify classes from newer GDBs don't become
    /// parse failures; carries the raw class string.
    Other(String),
}

/// Stream record: `(~|@|&)"text"`.
#[derive(Debug, Clone, PartialEq)]
pub struct MiStream {
    pub kind: StreamKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Console, // ~
    Target,  // @
    Log,     // &
}

/// A value inside an MI results body: a quoted string, a `{...}` tuple, or
/// a `[...]` list. List items that look like `key=value` parse as a
/// singleton tuple, matching real GDB output (e.g. breakpoint tables).
#[derive(Debug, Clone, PartialEq)]
pub enum MiValue {
    String(String),
    List(Vec<MiValue>),
    Tuple(HashMap<String, MiValue>),
}

impl MiValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MiValue]> {
        match self {
            MiValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&HashMap<String, MiValue>> {
        match self {
            MiValue::Tuple(t) => Some(t),
            _ => None,
        }
    }

    /// Lists in MI are sometimes a list of singleton tuples (e.g.
    /// `stack=[frame={...},frame={...}]`); this flattens either shape into
    /// plain tuple values.
    pub fn as_tuple_list(&self) -> Vec<&HashMap<String, MiValue>> {
        match self {
            MiValue::List(items) => items.iter().filter_map(|v| v.as_tuple()).collect(),
            MiValue::Tuple(t) => vec![t],
            MiValue::String(_) => Vec::new(),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_str().and_then(|s| parse_numeric_literal(s))
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_str().and_then(|s| s.parse::<i64>().ok())
    }
}

/// Parses a decimal or `0x`-prefixed hex literal, as addresses and ids
/// commonly arrive formatted either way in MI output.
pub fn parse_numeric_literal(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u64>().ok()
    }
}

/// Maps a raw GDB stop reason string to the compact set §4.1 names.
/// Reasons outside that set fall back to `"pause"`.
pub fn normalize_stop_reason(raw: &str) -> &'static str {
    match raw {
        "breakpoint-hit" => "breakpoint",
        "end-stepping-range" => "step",
        "signal-received" => "signal",
        "exited-normally" | "exited" | "exited-signalled" => "exited",
        _ => "pause",
    }
}
