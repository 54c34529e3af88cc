use helm_types::EngineEvent;

/// Takes one complete frame off the front of `buffer` and returns its joined `data:` payload.
///
/// Returns `None` when no complete frame is buffered yet. A frame without data lines
/// (comments, keep-alives) yields `Some(None)`.
pub fn take_frame(buffer: &mut String) -> Option<Option<String>> {
    let (end_idx, delim_len) = match (buffer.find("\r\n\r\n"), buffer.find("\n\n")) {
        (Some(crlf), Some(lf)) if lf < crlf => (lf, 2),
        (Some(crlf), _) => (crlf, 4),
        (None, Some(lf)) => (lf, 2),
        (None, None) => return None,
    };

    let frame: String = buffer.drain(..end_idx + delim_len).collect();
    let frame = &frame[..end_idx];

    let data_lines: Vec<&str> = frame
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();

    if data_lines.is_empty() {
        return Some(None);
    }
    Some(Some(data_lines.join("\n")))
}

/// Drains every complete frame from `buffer` into events the client handles.
pub fn drain_events(buffer: &mut String) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Some(frame) = take_frame(buffer) {
        let Some(data) = frame else { continue };
        if data == "[DONE]" {
            continue;
        }
        match EngineEvent::parse(&data) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {
                tracing::trace!("skipping unhandled event: {}", truncate(&data, 120));
            }
            Err(e) => {
                tracing::debug!("failed to parse event ({}): {}", e, truncate(&data, 500));
            }
        }
    }
    events
}

/// Turns raw stream chunks into events. Bytes of a UTF-8 sequence cut by a chunk
/// boundary are held back until the rest arrives.
#[derive(Debug, Default)]
pub struct EventDecoder {
    pending: Vec<u8>,
    buffer: String,
}

impl EventDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<EngineEvent> {
        self.pending.extend_from_slice(chunk);
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(prefix) = std::str::from_utf8(&self.pending[..valid]) {
                        self.buffer.push_str(prefix);
                    }
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for the next chunk.
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
        drain_events(&mut self.buffer)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
