/// Incremental UTF-8 decoder for chunked bodies.
///
/// Chunk boundaries may fall inside a code point; the incomplete tail is held
/// back until the next chunk completes it. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut decoded = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    decoded.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(error) => {
                    let valid = error.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match error.error_len() {
                        Some(invalid) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        decoded
    }

    /// Flushes whatever is left when the body ends.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    Data(String),
    Done,
}

/// Line buffer for `text/event-stream` bodies.
///
/// Only `data:` fields are surfaced; comments, `event:`, `id:` and `retry:`
/// lines are dropped. A `[DONE]` payload terminates the stream.
#[derive(Debug, Default)]
pub struct SseLines {
    buffer: String,
}

impl SseLines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: &str) -> Vec<SseItem> {
        self.buffer.push_str(text);
        let mut items = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);
            if let Some(item) = parse_line(&line) {
                items.push(item);
            }
        }

        items
    }

    pub fn finish(&mut self) -> Option<SseItem> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(line.trim_end_matches('\r'))
    }
}

fn parse_line(line: &str) -> Option<SseItem> {
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.trim() == "[DONE]" {
        return Some(SseItem::Done);
    }
    if data.is_empty() {
        return None;
    }
    Some(SseItem::Data(data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_point_split_across_chunks_is_reassembled() {
        let bytes = "§ 1983 – ok".as_bytes();
        let mut carry = Utf8Carry::new();

        let first = carry.push(&bytes[..1]);
        let second = carry.push(&bytes[1..9]);
        let third = carry.push(&bytes[9..]);

        assert_eq!(first, "");
        assert_eq!(format!("{first}{second}{third}"), "§ 1983 – ok");
        assert_eq!(carry.finish(), "");
    }

    #[test]
    fn invalid_bytes_become_replacement_characters() {
        let mut carry = Utf8Carry::new();
        assert_eq!(carry.push(&[b'a', 0xff, b'b']), "a\u{fffd}b");

        assert_eq!(carry.push(&[0xe2, 0x80]), "");
        assert_eq!(carry.finish(), "\u{fffd}");
    }

    #[test]
    fn sse_lines_surface_data_until_done() {
        let mut lines = SseLines::new();

        let mut items = lines.push(": keep-alive\ndata: Hi \r\n\nevent: token\ndata: the");
        items.extend(lines.push("re\n\ndata: [DONE]\n"));

        assert_eq!(
            items,
            vec![
                SseItem::Data("Hi ".to_string()),
                SseItem::Data("there".to_string()),
                SseItem::Done,
            ]
        );
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn unterminated_last_line_is_flushed() {
        let mut lines = SseLines::new();
        assert!(lines.push("data: tail").is_empty());
        assert_eq!(lines.finish(), Some(SseItem::Data("tail".to_string())));
    }
}
