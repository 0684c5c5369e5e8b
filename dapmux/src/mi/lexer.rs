/// GDB/MI output lexer.
///
/// Generalizes the gdbadapter `parser` module: result records keep their
/// token, async records are split into exec (`*`) and notify (`=`) so the
/// execution state machine can distinguish them where it cares to, and
/// unrecognized async classes no longer hard-fail the whole line (a newer
/// GDB emitting a class this adapter doesn't know about about should not
/// take down parsing of everything else on the line).
use super::types::*;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn result_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:(\d+))?\^(done|running|connected|error|exit)(?:,(.*))?$").unwrap()
    })
}

/// Parses one line of GDB stdout. Returns `None` for blank lines, the
/// `(gdb)` prompt, and anything that doesn't match the grammar — callers
/// log and discard rather than propagate, per the framing contract in
/// §4.1: malformed input must never abort the reader loop.
pub fn parse_line(line: &str) -> Option<MiRecord> {
    let line = line.trim();
    if line.is_empty() || line == "(gdb)" {
        return None;
    }

    if let Some(stream) = parse_stream(line) {
        return Some(MiRecord::Stream(stream));
    }

    if let Some(rest) = line.strip_prefix('*') {
        return parse_async(rest).map(MiRecord::Exec);
    }
    if let Some(rest) = line.strip_prefix('=') {
        return parse_async(rest).map(MiRecord::Notify);
    }

    parse_result(line).map(MiRecord::Result)
}

fn parse_stream(line: &str) -> Option<MiStream> {
    let kind = match line.chars().next()? {
        '~' => StreamKind::Console,
        '@' => StreamKind::Target,
        '&' => StreamKind::Log,
        _ => return None,
    };
    let text = parse_c_string(&line[1..]).unwrap_or_else(|| line[1..].to_string());
    Some(MiStream { kind, text })
}

fn parse_result(line: &str) -> Option<MiResult> {
    let caps = result_header_re().captures(line)?;
    let token = caps.get(1).and_then(|m| m.as_str().parse().ok());
    let class = match caps.get(2)?.as_str() {
        "done" => ResultClass::Done,
        "running" => ResultClass::Running,
        "connected" => ResultClass::Connected,
        "error" => ResultClass::Error,
        "exit" => ResultClass::Exit,
        _ => return None,
    };
    let results = match caps.get(3) {
        Some(m) => parse_results(m.as_str())?,
        None => HashMap::new(),
    };
    Some(MiResult {
        token,
        class,
        results,
    })
}

fn parse_async(rest: &str) -> Option<MiAsync> {
    let (class_str, results_str) = match rest.find(',') {
        Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
        None => (rest, None),
    };

    let class = match class_str {
        "running" => AsyncClass::Running,
        "stopped" => AsyncClass::Stopped,
        "thread-group-added" => AsyncClass::ThreadGroupAdded,
        "thread-group-removed" => AsyncClass::ThreadGroupRemoved,
        "thread-group-started" => AsyncClass::ThreadGroupStarted,
        "thread-group-exited" => AsyncClass::ThreadGroupExited,
        "thread-group-stopped" => AsyncClass::ThreadGroupStopped,
        "thread-created" => AsyncClass::ThreadCreated,
        "thread-exited" => AsyncClass::ThreadExited,
        "thread-selected" => AsyncClass::ThreadSelected,
        "library-loaded" => AsyncClass::LibraryLoaded,
        "library-unloaded" => AsyncClass::LibraryUnloaded,
        "traceframe-changed" => AsyncClass::TraceframeChanged,
        "tsv-created" => AsyncClass::TsvCreated,
        "tsv-deleted" => AsyncClass::TsvDeleted,
        "tsv-modified" => AsyncClass::TsvModified,
        "breakpoint-created" => AsyncClass::BreakpointCreated,
        "breakpoint-modified" => AsyncClass::BreakpointModified,
        "breakpoint-deleted" => AsyncClass::BreakpointDeleted,
        "record-started" => AsyncClass::RecordStarted,
        "record-stopped" => AsyncClass::RecordStopped,
        "cmd-param-changed" => AsyncClass::CmdParamChanged,
        "memory-changed" => AsyncClass::MemoryChanged,
        other if !other.is_empty() => AsyncClass::Other(other.to_string()),
        _ => return None,
    };

    let results = match results_str {
        Some(s) => parse_results(s)?,
        None => HashMap::new(),
    };

    Some(MiAsync { class, results })
}

fn parse_results(input: &str) -> Option<HashMap<String, MiValue>> {
    let mut results = HashMap::new();
    let mut chars = input.chars().peekable();

    while chars.peek().is_some() {
        while chars.peek() == Some(&' ') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let key = parse_identifier(&mut chars)?;
        if chars.next() != Some('=') {
            return None;
        }
        let value = parse_value(&mut chars)?;
        results.insert(key, value);

        if chars.peek() == Some(&',') {
            chars.next();
        }
    }

    Some(results)
}

fn parse_identifier(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<String> {
    let mut ident = String::new();
    while let Some(&ch) = chars.peek() {
        if ch.is_alphanumeric() || ch == '_' || ch == '-' {
            ident.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    if ident.is_empty() {
        None
    } else {
        Some(ident)
    }
}

/// Parses a value: a quoted string, a `{...}` tuple, or a `[...]` list.
/// List items may themselves be `key=value` — they become singleton
/// tuples — or bare values, matching real breakpoint-table output.
fn parse_value(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<MiValue> {
    match chars.peek() {
        Some('"') => {
            chars.next();
            let mut s = String::new();
            let mut escaped = false;
            for ch in chars.by_ref() {
                if escaped {
                    push_escape(&mut s, ch);
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    break;
                } else {
                    s.push(ch);
                }
            }
            Some(MiValue::String(s))
        }
        Some('[') => {
            chars.next();
            let mut list = Vec::new();
            while chars.peek() != Some(&']') && chars.peek().is_some() {
                list.push(parse_list_item(chars)?);
                if chars.peek() == Some(&',') {
                    chars.next();
                }
            }
            if chars.next() != Some(']') {
                return None;
            }
            Some(MiValue::List(list))
        }
        Some('{') => {
            chars.next();
            let mut tuple = HashMap::new();
            while chars.peek() != Some(&'}') && chars.peek().is_some() {
                let key = parse_identifier(chars)?;
                if chars.next() != Some('=') {
                    return None;
                }
                let value = parse_value(chars)?;
                tuple.insert(key, value);
                if chars.peek() == Some(&',') {
                    chars.next();
                }
            }
            if chars.next() != Some('}') {
                return None;
            }
            Some(MiValue::Tuple(tuple))
        }
        _ => {
            let mut s = String::new();
            while let Some(&ch) = chars.peek() {
                if ch == ',' || ch == ']' || ch == '}' {
                    break;
                }
                s.push(ch);
                chars.next();
            }
            if s.is_empty() {
                None
            } else {
                Some(MiValue::String(s))
            }
        }
    }
}

/// A list item is either a bare value or `key=value`; the latter becomes
/// a singleton tuple (e.g. `thread-groups=["i1"]` vs
/// `stack=[frame={...},frame={...}]`).
fn parse_list_item(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<MiValue> {
    let mut probe = chars.clone();
    if let Some(key) = parse_identifier(&mut probe) {
        if probe.peek() == Some(&'=') {
            probe.next();
            let value = parse_value(&mut probe)?;
            *chars = probe;
            let mut tuple = HashMap::new();
            tuple.insert(key, value);
            return Some(MiValue::Tuple(tuple));
        }
    }
    parse_value(chars)
}

fn push_escape(out: &mut String, ch: char) {
    match ch {
        'n' => out.push('\n'),
        't' => out.push('\t'),
        'r' => out.push('\r'),
        '\\' => out.push('\\'),
        '"' => out.push('"'),
        other => {
            out.push('\\');
            out.push(other);
        }
    }
}

fn parse_c_string(input: &str) -> Option<String> {
    if input.len() < 2 || !input.starts_with('"') || !input.ends_with('"') {
        return None;
    }
    let content = &input[1..input.len() - 1];
    let mut out = String::new();
    let mut chars = content.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(esc) => push_escape(&mut out, esc),
                None => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_with_token_and_nested_list() {
        let rec =
            parse_line(r#"42^done,threads=[{id="1",state="stopped"}]"#).expect("should parse");
        match rec {
            MiRecord::Result(r) => {
                assert_eq!(r.token, Some(42));
                assert_eq!(r.class, ResultClass::Done);
                let threads = r.results.get("threads").unwrap().as_list().unwrap();
                let t0 = threads[0].as_tuple().unwrap();
                assert_eq!(t0.get("id").unwrap().as_str(), Some("1"));
                assert_eq!(t0.get("state").unwrap().as_str(), Some("stopped"));
            }
            other => panic!("expected result record, got {other:?}"),
        }
    }

    #[test]
    fn stream_console_with_escapes() {
        let rec = parse_line(r#"~"text\n""#).expect("should parse");
        match rec {
            MiRecord::Stream(s) => {
                assert_eq!(s.kind, StreamKind::Console);
                assert_eq!(s.text, "text\n");
            }
            other => panic!("expected stream record, got {other:?}"),
        }
    }

    #[test]
    fn bare_done_no_results() {
        let rec = parse_line("^done").unwrap();
        match rec {
            MiRecord::Result(r) => {
                assert_eq!(r.token, None);
                assert!(r.results.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_result() {
        let rec = parse_line(r#"^error,msg="No symbol table is loaded.""#).unwrap();
        match rec {
            MiRecord::Result(r) => {
                assert_eq!(r.class, ResultClass::Error);
                assert_eq!(
                    r.results.get("msg").unwrap().as_str(),
                    Some("No symbol table is loaded.")
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exec_stopped_with_frame() {
        let input = r#"*stopped,reason="breakpoint-hit",bkptno="1",frame={addr="0x400",func="main",args=[{name="argc",value="1"}]}"#;
        let rec = parse_line(input).unwrap();
        match rec {
            MiRecord::Exec(a) => {
                assert_eq!(a.class, AsyncClass::Stopped);
                assert_eq!(
                    a.results.get("reason").unwrap().as_str(),
                    Some("breakpoint-hit")
                );
                let frame = a.results.get("frame").unwrap().as_tuple().unwrap();
                assert_eq!(frame.get("func").unwrap().as_str(), Some("main"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn notify_thread_group_stopped_is_a_stop() {
        let rec = parse_line(r#"=thread-group-stopped,id="i1""#).unwrap();
        assert!(rec.is_stopped());
    }

    #[test]
    fn malformed_line_is_discarded_not_fatal() {
        assert!(parse_line("").is_none());
        assert!(parse_line("(gdb)").is_none());
        assert!(parse_line("not a valid mi line at all {{{").is_none());
    }

    #[test]
    fn unknown_async_class_degrades_gracefully() {
        let rec = parse_line(r#"=some-future-notification,x="1""#).unwrap();
        match rec {
            MiRecord::Notify(a) => assert_eq!(a.class, AsyncClass::Other("some-future-notification".into())),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn escape_sequences_in_quoted_values() {
        let rec = parse_line(r#"^error,msg="line1\nline2\ttabbed\"quoted\"\\slash""#).unwrap();
        match rec {
            MiRecord::Result(r) => {
                assert_eq!(
                    r.results.get("msg").unwrap().as_str(),
                    Some("line1\nline2\ttabbed\"quoted\"\\slash")
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
