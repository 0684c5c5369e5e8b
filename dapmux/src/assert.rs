/// Assert-prompt parser and auto-responder: the side channel that answers
/// the simulator's MMIO prompts on its stdin, entirely independent of
/// GDB (§4.7). No teacher analogue exists for the grammar itself; the
/// incremental accumulate-until-terminator shape is grounded on the
/// gdbadapter reader-task pattern (`BufReader::read_line` loop in
/// `start_output_reader`/`start_stderr_reader`), applied to the
/// simulator's stdout instead of GDB's.
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub input: String,
    pub target_address: String,
    pub target_mnemonic: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AssertPrompt {
    pub kind: Option<PromptKind>,
    pub address: Option<String>,
    pub size: Option<u32>,
    pub pc: Option<String>,
    pub register: Option<String>,
    pub peripheral: Option<String>,
    pub reset: Option<String>,
    pub fields: Option<String>,
    pub value: Option<String>,
    pub hints: Vec<String>,
    pub decisions: Vec<Decision>,
    pub ready: bool,
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^MMIO (READ|WRITE) at (\S+) size=(\d+) PC=(\S+)$").unwrap()
    })
}

fn field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(Register|Peripheral|Reset|Fields|Value|Hint): (.*)$").unwrap())
}

fn decision_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?)\s*->\s*(\S+):\s*(.+)$").unwrap())
}

fn terminator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(Read value .*:|Write expect .*:)$").unwrap())
}

fn numeric_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[0-9a-fA-F]+|\d+").unwrap())
}

fn note_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*?)\s*\(([^()]*)\)\s*$").unwrap())
}

/// Incremental parser. Feed it chunks of the simulator's stdout as they
/// arrive; `feed` returns every prompt that became ready in this call.
pub struct AssertParser {
    buf: String,
    current: Option<AssertPrompt>,
    in_decision: bool,
}

impl AssertParser {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            current: None,
            in_decision: false,
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<AssertPrompt> {
        self.buf.push_str(chunk);
        let mut ready = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf[..pos].trim_end_matches('\r').to_string();
            self.buf.drain(..=pos);
            if let Some(prompt) = self.process_line(&line) {
                ready.push(prompt);
            }
        }
        ready
    }

    fn process_line(&mut self, line: &str) -> Option<AssertPrompt> {
        let rest = line.strip_prefix("[ASSERT]")?.trim_start();

        if let Some(caps) = header_re().captures(rest) {
            let kind = if &caps[1] == "READ" {
                PromptKind::Read
            } else {
                PromptKind::Write
            };
            self.current = Some(AssertPrompt {
                kind: Some(kind),
                address: Some(caps[2].to_string()),
                size: caps[3].parse().ok(),
                pc: Some(caps[4].to_string()),
                ..Default::default()
            });
            self.in_decision = false;
            return None;
        }

        let prompt = self.current.as_mut()?;

        if rest == "Decision" {
            self.in_decision = true;
            return None;
        }

        if let Some(caps) = field_re().captures(rest) {
            let value = caps[2].to_string();
            match &caps[1] {
                "Register" => prompt.register = Some(value),
                "Peripheral" => prompt.peripheral = Some(value),
                "Reset" => prompt.reset = Some(value),
                "Fields" => prompt.fields = Some(value),
                "Value" => prompt.value = Some(value),
                "Hint" => prompt.hints.push(value),
                _ => unreachable!(),
            }
            return None;
        }

        if self.in_decision {
            if let Some(decision) = parse_decision_line(rest) {
                prompt.decisions.push(decision);
                return None;
            }
        }

        if terminator_re().is_match(rest) {
            prompt.ready = true;
            self.in_decision = false;
            return self.current.take();
        }

        None
    }
}

impl Default for AssertParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses one `<LEFT> -> <TARGET>: <ASM>[ (<NOTE>)]` line. `input` is the
/// first numeric literal in `<LEFT>` — field annotations such as
/// `PIN=0x1` are stripped by only ever taking that first match.
fn parse_decision_line(line: &str) -> Option<Decision> {
    let caps = decision_re().captures(line)?;
    let left = &caps[1];
    let target_address = caps[2].to_string();
    let asm_and_note = caps[3].trim();

    let input = numeric_literal_re().find(left)?.as_str().to_string();

    let (target_mnemonic, note) = match note_suffix_re().captures(asm_and_note) {
        Some(n) => (n[1].trim().to_string(), Some(n[2].to_string())),
        None => (asm_and_note.to_string(), None),
    };

    Some(Decision {
        input,
        target_address,
        target_mnemonic,
        note,
    })
}

/// Sanitizes any string about to be written to the simulator's stdin, per
/// §4.7: strip `\r`, take up to the first `\n`, trim whitespace, and blank
/// out anything that would masquerade as a synthetic `[ASSERT]` prompt.
pub fn sanitize(input: &str) -> String {
    let no_cr = input.replace('\r', "");
    let first_line = no_cr.split('\n').next().unwrap_or("");
    let trimmed = first_line.trim();
    if trimmed.starts_with("[ASSERT]") {
        String::new()
    } else {
        trimmed.to_string()
    }
}

/// Whether write prompts should be auto-answered from their own `value`
/// field without ever surfacing to the UI.
pub struct AutoResponder {
    pub auto_reply_writes: bool,
}

pub enum ResponderAction {
    /// Write this (already-sanitized) line to the simulator's stdin and
    /// never show the prompt.
    AutoReply(String),
    /// Bubble the prompt up for the UI to answer.
    Surface,
}

impl AutoResponder {
    pub fn decide(&self, prompt: &AssertPrompt) -> ResponderAction {
        match prompt.kind {
            Some(PromptKind::Write) if self.auto_reply_writes => {
                ResponderAction::AutoReply(prompt.value.clone().unwrap_or_default())
            }
            _ => ResponderAction::Surface,
        }
    }
}
