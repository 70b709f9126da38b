//! Event-stream frame parsing.
//!
//! The stream is a sequence of `field: value` lines grouped into frames by
//! blank lines. [`parse_frames`] is the pure parser; [`FrameBuffer`] feeds it
//! from raw transport chunks and keeps only the unterminated tail.

use super::error::SearchError;
use memchr::{memchr_iter, memrchr};

/// One parsed event-stream unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: Option<String>,
}

impl Frame {
    fn is_empty(&self) -> bool {
        self.id.is_none() && self.event.is_none() && self.data.is_none()
    }

    /// Returns true when the frame carries the given event name.
    pub fn is_event(&self, name: &str) -> bool {
        self.event.as_deref() == Some(name)
    }

    fn apply_field(&mut self, name: &str, value: &str) {
        match name {
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => match self.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            _ => {}
        }
    }
}

fn split_field(line: &str) -> (&str, &str) {
    match line.split_once(':') {
        Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
        None => (line, ""),
    }
}

/// Parses every blank-line-terminated frame in `input`.
///
/// Returns the frames in stream order and the unconsumed remainder, which
/// starts at the first byte of the unterminated trailing frame.
pub fn parse_frames(input: &str) -> (Vec<Frame>, &str) {
    let mut frames = Vec::new();
    let mut current = Frame::default();
    let mut frame_start = 0;
    let mut offset = 0;

    for raw_line in input.split_inclusive('\n') {
        offset += raw_line.len();
        let Some(line) = raw_line.strip_suffix('\n') else {
            // Unterminated final line; it belongs to the remainder.
            break;
        };
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            let frame = std::mem::take(&mut current);
            if !frame.is_empty() {
                frames.push(frame);
            }
            frame_start = offset;
            continue;
        }

        if line.starts_with(':') {
            continue;
        }

        let (name, value) = split_field(line);
        current.apply_field(name, value);
    }

    (frames, &input[frame_start..])
}

/// Offset just past the first blank line in `bytes`, if one is complete.
fn frame_end(bytes: &[u8]) -> Option<usize> {
    memchr_iter(b'\n', bytes).find_map(|newline| {
        let rest = &bytes[newline + 1..];
        if rest.starts_with(b"\n") {
            Some(newline + 2)
        } else if rest.starts_with(b"\r\n") {
            Some(newline + 3)
        } else {
            None
        }
    })
}

/// Incremental frame reader over raw transport chunks.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    /// Appends a chunk and returns every frame it completes.
    ///
    /// A frame carrying invalid UTF-8 is skipped and reported as a
    /// `Protocol` error in its place; the frames around it still parse.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Frame, SearchError>> {
        self.buffer.extend_from_slice(chunk);
        let mut results = Vec::new();

        loop {
            // Frames can only end on a newline, and a newline byte never sits
            // inside a multi-byte character, so the prefix is a clean cut.
            let Some(last_newline) = memrchr(b'\n', &self.buffer) else {
                return results;
            };
            let complete = &self.buffer[..=last_newline];

            let invalid_at = match std::str::from_utf8(complete) {
                Ok(text) => {
                    let (frames, remainder) = parse_frames(text);
                    results.extend(frames.into_iter().map(Ok));
                    let consumed = text.len() - remainder.len();
                    self.buffer.drain(..consumed);
                    return results;
                }
                Err(err) => err.valid_up_to(),
            };

            let valid = std::str::from_utf8(&complete[..invalid_at]).unwrap_or_default();
            let (frames, remainder) = parse_frames(valid);
            let bad_start = valid.len() - remainder.len();
            results.extend(frames.into_iter().map(Ok));

            // The frame holding the bad bytes is dropped only once it ends.
            let Some(end) = frame_end(&complete[invalid_at..]) else {
                self.buffer.drain(..bad_start);
                return results;
            };
            results.push(Err(SearchError::protocol(
                "Malformed MCP frame: event data is not valid UTF-8",
            )));
            self.buffer.drain(..invalid_at + end);
        }
    }

    /// Bytes still held for an unterminated frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drops any unterminated tail; called when the stream ends.
    pub fn finish(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}
