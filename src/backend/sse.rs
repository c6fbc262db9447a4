//! Incremental decoder for upstream server-sent events

/// Splits a byte stream into SSE `data` payloads.
///
/// Chunks may cut events, lines or UTF-8 sequences anywhere; only complete
/// events (terminated by a blank line) are emitted. Comments and non-`data`
/// fields are dropped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect the payloads of every event it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(end) = find_blank_line(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(payload) = parse_block(&block[..end]) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush a trailing event that was not terminated by a blank line
    pub fn finish(&mut self) -> Option<String> {
        let block = std::mem::take(&mut self.buffer);
        parse_block(&block)
    }
}

fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn parse_block(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let mut data: Option<String> = None;

    for line in text.lines() {
        let Some(value) = line.strip_prefix("data:") else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match data.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }

    data.filter(|d| !d.is_empty())
}
