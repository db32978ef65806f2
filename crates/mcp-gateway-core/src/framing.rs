//! Message framing for stdio MCP peers.
//!
//! Two directions, two tools:
//!
//! - [`MessageFramer`] recovers envelopes from a child server's stdout, which
//!   is nominally newline-delimited JSON but in practice may contain banner
//!   text, log lines, or JSON split across arbitrary read boundaries.
//! - [`LocalReader`] reads a well-behaved local client on stdin, accepting
//!   either newline-delimited JSON or `Content-Length` framed bodies.
//!
//! Outgoing messages are always written newline-delimited with
//! [`write_newline_delimited`].

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::envelope::Envelope;

/// Maximum number of characters of offending input kept in a [`FrameError`].
pub const RAW_PREFIX_LEN: usize = 200;

/// Bytes an unterminated `{` may span before it is treated as line noise.
pub const MAX_OBJECT_SPAN: usize = 8 * 1024 * 1024;

/// A candidate that looked like JSON but could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to parse JSON: {reason}")]
pub struct FrameError {
    pub reason: String,
    /// First [`RAW_PREFIX_LEN`] characters of the candidate text.
    pub raw_prefix: String,
}

impl FrameError {
    fn new(reason: impl Into<String>, candidate: &str) -> Self {
        Self {
            reason: reason.into(),
            raw_prefix: candidate.chars().take(RAW_PREFIX_LEN).collect(),
        }
    }
}

/// Outcome of scanning for the first brace-balanced object in the buffer.
enum Scan {
    /// Object spans `start..end` (exclusive).
    Complete { start: usize, end: usize },
    /// An object opened at `start` and has not closed yet.
    Open { start: usize },
    /// No `{` anywhere in the buffer.
    NoBrace,
}

/// Incremental decoder for a child's stdout.
///
/// Feed chunks with [`push_bytes`](Self::push_bytes) or
/// [`push_str`](Self::push_str); each call returns the envelopes and decode
/// errors completed by that chunk, in stream order. Call
/// [`flush`](Self::flush) at end of stream.
///
/// Balanced `{...}` objects are preferred, honoring string literals and
/// escapes so braces inside strings do not count. Text ahead of an object on
/// the same line is discarded. An unclosed `{` is abandoned for its line once
/// a following line starts a complete object. When no object is available,
/// whole lines are consumed: a line is only decoded if it starts with `{` or mentions
/// `"jsonrpc"`; any other line is noise and silently dropped.
///
/// Decisions never depend on where chunk boundaries fall, so the same byte
/// stream produces the same result whether delivered at once or byte by byte.
#[derive(Debug, Default)]
pub struct MessageFramer {
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending_utf8: Vec<u8>,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes currently held back waiting for more input.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.pending_utf8.len()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<Result<Envelope, FrameError>> {
        let mut bytes = std::mem::take(&mut self.pending_utf8);
        bytes.extend_from_slice(chunk);
        match std::str::from_utf8(&bytes) {
            Ok(text) => self.buffer.push_str(text),
            Err(e) if e.error_len().is_none() => {
                let (valid, tail) = bytes.split_at(e.valid_up_to());
                self.buffer.push_str(&String::from_utf8_lossy(valid));
                self.pending_utf8 = tail.to_vec();
            }
            Err(_) => self.buffer.push_str(&String::from_utf8_lossy(&bytes)),
        }
        self.drain()
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<Result<Envelope, FrameError>> {
        if !self.pending_utf8.is_empty() {
            return self.push_bytes(chunk.as_bytes());
        }
        self.buffer.push_str(chunk);
        self.drain()
    }

    /// Decode whatever remains after end of stream.
    pub fn flush(&mut self) -> Vec<Result<Envelope, FrameError>> {
        let mut out = Vec::new();
        if !self.pending_utf8.is_empty() {
            let tail = std::mem::take(&mut self.pending_utf8);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }
        // Complete objects still take priority over the trailing text.
        out.extend(self.drain());
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if !rest.is_empty() {
            if let Some(decoded) = decode_candidate(rest, false) {
                out.push(decoded);
            }
        }
        out
    }

    fn drain(&mut self) -> Vec<Result<Envelope, FrameError>> {
        let mut out = Vec::new();
        loop {
            // Whole lines ahead of the next `{` are handled as lines first.
            let newline = self.buffer.find('\n');
            if let Some(nl) = newline {
                if self.buffer.find('{').is_none_or(|brace| nl < brace) {
                    self.consume_line(nl, &mut out);
                    continue;
                }
            }
            match scan_object(&self.buffer) {
                Scan::Complete { start, end } => {
                    if let Some(decoded) = decode_candidate(&self.buffer[start..end], true) {
                        out.push(decoded);
                    }
                    self.buffer.drain(..end);
                }
                Scan::Open { start } => match newline {
                    Some(nl)
                        if self.buffer.len() - start > MAX_OBJECT_SPAN
                            || self.stray_brace(start, nl) =>
                    {
                        self.consume_line(nl, &mut out)
                    }
                    _ => break,
                },
                Scan::NoBrace => break,
            }
        }
        out
    }

    /// Whether the unclosed `{` at `start` should give up its line. It does
    /// once the next non-blank line starts a complete object, or any later
    /// line does when text precedes the brace on its own line.
    fn stray_brace(&self, start: usize, newline: usize) -> bool {
        let rest = &self.buffer[newline + 1..];
        let noisy_prefix = !self.buffer[..start].trim().is_empty();
        object_line_follows(rest, noisy_prefix)
    }

    fn consume_line(&mut self, newline: usize, out: &mut Vec<Result<Envelope, FrameError>>) {
        let line: String = self.buffer.drain(..=newline).collect();
        let line = line.trim();
        if !line.is_empty() {
            if let Some(decoded) = decode_candidate(line, false) {
                out.push(decoded);
            }
        }
    }
}

/// Find the first brace-balanced object in `text`.
fn scan_object(text: &str) -> Scan {
    let Some(start) = text.find('{') else {
        return Scan::NoBrace;
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Scan::Complete {
                        start,
                        end: start + offset + 1,
                    };
                }
            }
            _ => {}
        }
    }
    Scan::Open { start }
}

/// Whether a line of `text` begins with a complete balanced object. Blank
/// lines are skipped; unless `any_line` is set, only the first non-blank
/// line is considered.
fn object_line_follows(text: &str, any_line: bool) -> bool {
    let line_starts = std::iter::once(0).chain(text.match_indices('\n').map(|(i, _)| i + 1));
    for offset in line_starts {
        let line = &text[offset..];
        let first = line.split('\n').next().unwrap_or_default();
        if first.trim().is_empty() {
            continue;
        }
        if first.trim_start().starts_with('{') {
            return matches!(scan_object(line.trim_start()), Scan::Complete { .. });
        }
        if !any_line {
            return false;
        }
    }
    false
}

/// Decode one candidate. Returns `None` for text that is not JSON-like.
fn decode_candidate(candidate: &str, balanced: bool) -> Option<Result<Envelope, FrameError>> {
    let candidate = candidate.trim();
    if !balanced && !candidate.starts_with('{') && !candidate.contains("\"jsonrpc\"") {
        return None;
    }
    let decoded = serde_json::from_str::<serde_json::Value>(candidate)
        .map_err(|e| FrameError::new(e.to_string(), candidate))
        .and_then(|value| {
            Envelope::from_value(value).map_err(|e| FrameError::new(e.to_string(), candidate))
        });
    Some(decoded)
}

/// Reads messages from a local client, auto-detecting `Content-Length` vs
/// newline framing per message.
pub struct LocalReader<R> {
    reader: BufReader<R>,
    buf: String,
}

impl<R: AsyncRead + Unpin> LocalReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: String::new(),
        }
    }

    /// Read the next raw message text, returning `None` on EOF.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading fails or a `Content-Length` header is
    /// malformed.
    pub async fn next_message(&mut self) -> io::Result<Option<String>> {
        loop {
            self.buf.clear();
            let n = self.reader.read_line(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }

            let trimmed = self.buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("Content-Length:") {
                let len: usize = rest
                    .trim()
                    .parse()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

                // Remaining headers up to the blank separator line are ignored.
                loop {
                    self.buf.clear();
                    let header_n = self.reader.read_line(&mut self.buf).await?;
                    if header_n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "EOF in Content-Length headers",
                        ));
                    }
                    if self.buf.trim().is_empty() {
                        break;
                    }
                }

                let mut body = vec![0u8; len];
                self.reader.read_exact(&mut body).await?;
                let msg = String::from_utf8(body)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                return Ok(Some(msg));
            }

            return Ok(Some(trimmed.to_string()));
        }
    }
}

/// Write one message followed by `\n`, then flush.
///
/// `json` must not contain embedded newlines; compact serde output never does.
///
/// # Errors
///
/// Returns an I/O error if writing or flushing fails.
pub async fn write_newline_delimited<W: AsyncWrite + Unpin>(
    writer: &mut W,
    json: &str,
) -> io::Result<()> {
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
