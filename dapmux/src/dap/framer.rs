/// DAP wire framing: `Content-Length: N\r\n\r\n<N bytes of JSON>`.
///
/// Grounded on the gdbadapter reader-task pattern (`BufReader` over a
/// growing accumulator), adapted from line framing to length-prefixed
/// framing. Decoding never errors out to the caller — a malformed body is
/// logged and skipped after consuming exactly its declared length, so one
/// bad message can't wedge the stream, matching the framing-error policy
/// in spec §7.
use serde::Serialize;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Incremental decoder. Feed it bytes as they arrive off the wire; pull
/// complete messages out with `pop`.
#[derive(Debug, Default)]
pub struct DapFramer {
    buf: Vec<u8>,
}

impl DapFramer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Accumulates bytes from a partial read. Safe to call with arbitrary
    /// chunk boundaries, including mid-header and mid-body splits.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete message, if one is fully buffered. Returns
    /// `None` when more bytes are needed; call again after the next
    /// `feed`. Skips (and logs) any body that fails to parse as JSON,
    /// continuing to the next message rather than returning an error.
    pub fn pop(&mut self) -> Option<serde_json::Value> {
        loop {
            let header_end = find(&self.buf, HEADER_TERMINATOR)?;
            let header = &self.buf[..header_end];
            let content_length = match parse_content_length(header) {
                Some(n) => n,
                None => {
                    log::warn!("DAP framing: no Content-Length header, resyncing");
                    self.buf.drain(..header_end + HEADER_TERMINATOR.len());
                    continue;
                }
            };

            let body_start = header_end + HEADER_TERMINATOR.len();
            let body_end = body_start + content_length;
            if self.buf.len() < body_end {
                return None; // wait for more bytes
            }

            let body = self.buf[body_start..body_end].to_vec();
            self.buf.drain(..body_end);

            match serde_json::from_slice::<serde_json::Value>(&body) {
                Ok(value) => return Some(value),
                Err(e) => {
                    log::warn!("DAP framing: malformed JSON body skipped: {e}");
                    continue;
                }
            }
        }
    }
}

/// Case-insensitive `Content-Length:` header lookup.
fn parse_content_length(header: &[u8]) -> Option<usize> {
    let header = std::str::from_utf8(header).ok()?;
    for line in header.split("\r\n") {
        let mut parts = line.splitn(2, ':');
        let name = parts.next()?.trim();
        let value = parts.next()?.trim();
        if name.eq_ignore_ascii_case("content-length") {
            return value.parse().ok();
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// One-shot helper over a complete, already-buffered byte slice: feeds it
/// into a scratch framer and drains every message it yields. Tests reach
/// for this instead of hand-rolling a `feed`+loop-`pop` every time they
/// just want "what messages are in this buffer".
pub fn decode_all(bytes: &[u8]) -> Vec<serde_json::Value> {
    let mut framer = DapFramer::default();
    framer.feed(bytes);
    let mut out = Vec::new();
    while let Some(msg) = framer.pop() {
        out.push(msg);
    }
    out
}

/// Encodes any serializable DAP message with its exact byte-count header.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(message)?;
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_single_message() {
        let msg = json!({"seq": 1, "type": "request", "command": "initialize"});
        let bytes = encode(&msg).unwrap();

        let mut framer = DapFramer::new();
        framer.feed(&bytes);
        assert_eq!(framer.pop(), Some(msg));
        assert_eq!(framer.pop(), None);
    }

    #[test]
    fn round_trip_two_messages_across_arbitrary_split() {
        let m1 = json!({"seq": 1, "type": "event", "event": "initialized"});
        let m2 = json!({"seq": 2, "type": "request", "command": "threads"});
        let mut all = encode(&m1).unwrap();
        all.extend(encode(&m2).unwrap());

        for split in 0..=all.len() {
            let (a, b) = all.split_at(split);
            let mut framer = DapFramer::new();
            framer.feed(a);
            framer.feed(b);
            assert_eq!(framer.pop(), Some(m1.clone()), "split at {split}");
            assert_eq!(framer.pop(), Some(m2.clone()), "split at {split}");
            assert_eq!(framer.pop(), None);
        }
    }

    #[test]
    fn case_insensitive_header() {
        let body = br#"{"seq":1,"type":"event","event":"x"}"#;
        let mut raw = format!("content-LENGTH: {}\r\n\r\n", body.len()).into_bytes();
        raw.extend_from_slice(body);

        let mut framer = DapFramer::new();
        framer.feed(&raw);
        assert!(framer.pop().is_some());
    }

    #[test]
    fn malformed_body_between_two_well_formed_is_skipped() {
        let good1 = encode(&json!({"a": 1})).unwrap();
        let bad_body = b"{not json".to_vec();
        let mut bad = format!("Content-Length: {}\r\n\r\n", bad_body.len()).into_bytes();
        bad.extend_from_slice(&bad_body);
        let good2 = encode(&json!({"b": 2})).unwrap();

        let mut all = good1;
        all.extend(bad);
        all.extend(good2);

        let mut framer = DapFramer::new();
        framer.feed(&all);
        assert_eq!(framer.pop(), Some(json!({"a": 1})));
        assert_eq!(framer.pop(), Some(json!({"b": 2})));
        assert_eq!(framer.pop(), None);
    }

    #[test]
    fn decode_all_drains_every_message_in_one_buffer() {
        let m1 = json!({"seq": 1, "type": "event", "event": "initialized"});
        let m2 = json!({"seq": 2, "type": "request", "command": "threads"});
        let mut all = encode(&m1).unwrap();
        all.extend(encode(&m2).unwrap());

        assert_eq!(decode_all(&all), vec![m1, m2]);
    }

    #[test]
    fn partial_header_then_partial_body_is_held() {
        let bytes = encode(&json!({"x": true})).unwrap();
        let mut framer = DapFramer::new();
        framer.feed(&bytes[..5]);
        assert_eq!(framer.pop(), None);
        framer.feed(&bytes[5..bytes.len() - 3]);
        assert_eq!(framer.pop(), None);
        framer.feed(&bytes[bytes.len() - 3..]);
        assert_eq!(framer.pop(), Some(json!({"x": true})));
    }
}
