use murmur_protocol::Fragment;
use snafu::{ResultExt, ensure};

use super::error::{ClientResult, FrameEventMismatchSnafu, FramePayloadSnafu};

const BOM: char = '\u{feff}';
const DEFAULT_EVENT: &str = "message";

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT)
    }
}

/// Incremental event-stream parser.
///
/// Bytes are buffered until a full line is available, so chunk boundaries may
/// fall anywhere, including inside a multi-byte character or between `\r`
/// and `\n`. A frame is returned only once its blank terminator line arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    saw_first_line: bool,
    event: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;

        while let Some((line_end, next_start)) = find_line_end(&self.buffer[consumed..]) {
            let line_bytes = &self.buffer[consumed..consumed + line_end];
            let line = String::from_utf8_lossy(line_bytes).into_owned();
            consumed += next_start;

            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }

        self.buffer.drain(..consumed);
        frames
    }

    /// True while a partial line or an undispatched frame is buffered.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty() || !self.data_lines.is_empty() || self.event.is_some()
    }

    fn process_line(&mut self, mut line: String) -> Option<SseFrame> {
        if !self.saw_first_line {
            self.saw_first_line = true;
            if line.starts_with(BOM) {
                line.remove(0);
            }
        }

        if line.is_empty() {
            return self.dispatch();
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // `retry` and unknown fields do not affect fragment decoding.
            _ => {}
        }

        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data_lines.is_empty() {
            return None;
        }

        let data = std::mem::take(&mut self.data_lines).join("\n");
        Some(SseFrame { event, data, id })
    }
}

/// Returns `(line_len, bytes_to_skip)` for the first complete line.
fn find_line_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let position = buffer.iter().position(|byte| *byte == b'\n' || *byte == b'\r')?;
    if buffer[position] == b'\n' {
        return Some((position, position + 1));
    }

    // A trailing `\r` may be the first half of `\r\n`; wait for the next byte.
    match buffer.get(position + 1) {
        Some(b'\n') => Some((position, position + 2)),
        Some(_) => Some((position, position + 1)),
        None => None,
    }
}

/// Decodes the fragment carried by `frame`, checking it against the event name.
pub fn decode_fragment(frame: &SseFrame) -> ClientResult<Fragment> {
    let fragment: Fragment = serde_json::from_str(&frame.data).context(FramePayloadSnafu {
        stage: "decode-fragment-json",
        event: frame.event_name(),
    })?;

    ensure!(
        frame.event.is_none() || frame.event_name() == fragment.event_name(),
        FrameEventMismatchSnafu {
            stage: "decode-fragment-event",
            event: frame.event_name(),
            payload_type: fragment.event_name(),
        }
    );

    Ok(fragment)
}

#[cfg(test)]
mod tests {
    use murmur_protocol::ErrorCategory;

    use super::*;

    fn decode_all(chunks: &[&[u8]]) -> Vec<SseFrame> {
        let mut decoder = FrameDecoder::new();
        chunks
            .iter()
            .flat_map(|chunk| decoder.push(chunk))
            .collect()
    }

    #[test]
    fn frames_split_at_every_byte_decode_identically() {
        let wire = "event: content\ndata: {\"type\":\"content\",\"text\":\"héllo ✓\"}\n\n";
        let whole = decode_all(&[wire.as_bytes()]);

        let bytes = wire.as_bytes();
        let single_bytes = bytes.chunks(1).collect::<Vec<_>>();
        let split = decode_all(&single_bytes);

        assert_eq!(whole.len(), 1);
        assert_eq!(whole, split);
        assert_eq!(
            decode_fragment(&whole[0]).expect("valid fragment"),
            Fragment::content("héllo ✓")
        );
    }

    #[test]
    fn crlf_comments_and_bom_are_handled() {
        let wire = "\u{feff}: keep-alive\r\nevent: completion\r\ndata: {\"type\":\"completion\",\"messageId\":\"m1\"}\r\n\r\n";
        let mid = wire.find("\r\n\r\n").expect("terminator") + 1;
        let frames = decode_all(&[&wire.as_bytes()[..mid], &wire.as_bytes()[mid..]]);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_name(), "completion");
        assert_eq!(
            decode_fragment(&frames[0]).expect("valid fragment"),
            Fragment::completion("m1")
        );
    }

    #[test]
    fn multi_line_data_is_joined_with_newlines() {
        let frames = decode_all(&[b"data: first\ndata:second\n\n"]);
        assert_eq!(frames[0].data, "first\nsecond");
        assert_eq!(frames[0].event_name(), "message");
    }

    #[test]
    fn incomplete_frame_is_held_back() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"event: content\ndata: {}").is_empty());
        assert!(decoder.has_pending());
        assert_eq!(decoder.push(b"\n\n").len(), 1);
        assert!(!decoder.has_pending());
    }

    #[test]
    fn event_name_must_match_payload() {
        let frame = SseFrame {
            event: Some("completion".to_string()),
            data: Fragment::error(ErrorCategory::Timeout).to_json(),
            id: None,
        };
        assert!(decode_fragment(&frame).is_err());

        let garbage = SseFrame {
            event: Some("content".to_string()),
            data: "not json".to_string(),
            id: None,
        };
        assert!(decode_fragment(&garbage).is_err());
    }
}
