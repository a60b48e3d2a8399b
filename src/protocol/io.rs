//! Protocol I/O for JSONL envelope parsing and serialization
//!
//! This module provides:
//! - `parse_envelope_graceful` for classifying one stdout line from a child
//! - `serialize_envelope` / `write_envelope` for the child side
//! - `JsonlReader` for streaming reads in the parent

use std::io::{BufRead, BufReader, Read, Write};
use tracing::debug;

use super::message::Envelope;

/// Maximum length for raw JSON in logs (prevents huge payloads in logs)
const MAX_RAW_LOG_PREVIEW: usize = 200;

/// Get a truncated preview of a raw line for logging
pub fn log_preview(raw: &str) -> (&str, usize) {
    let len = raw.len();
    if len > MAX_RAW_LOG_PREVIEW {
        let mut end = MAX_RAW_LOG_PREVIEW;
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        (&raw[..end], len)
    } else {
        (raw, len)
    }
}

/// Result type for graceful line parsing
#[derive(Debug)]
pub enum ParseResult {
    /// A well-formed envelope
    Ok(Envelope),
    /// Valid JSON that is not an envelope (no `channel`, bad `messages`)
    NotEnvelope {
        /// Serde error message describing the problem
        error: String,
        /// Truncated raw line for debugging
        raw: String,
    },
    /// Not JSON at all, e.g. a stray print from the script
    ParseError {
        error: serde_json::Error,
        raw: String,
    },
}

/// Classify one line read from a child's stdout.
///
/// Scripts may print ordinary text next to their envelopes; those lines
/// come back as `ParseError` rather than aborting the stream.
pub fn parse_envelope_graceful(line: &str) -> ParseResult {
    let (preview, _raw_len) = log_preview(line);

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(error) => {
            return ParseResult::ParseError {
                error,
                raw: preview.to_string(),
            }
        }
    };

    match serde_json::from_value::<Envelope>(value) {
        Ok(envelope) => ParseResult::Ok(envelope),
        Err(e) => ParseResult::NotEnvelope {
            error: e.to_string(),
            raw: preview.to_string(),
        },
    }
}

/// Serialize an envelope to a single JSON line (without newline)
pub fn serialize_envelope(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Write one envelope as a JSONL line and flush
pub fn write_envelope<W: Write>(writer: &mut W, envelope: &Envelope) -> std::io::Result<()> {
    let json = serialize_envelope(envelope)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writeln!(writer, "{}", json)?;
    writer.flush()
}

/// JSONL reader for streaming envelope reads
///
/// Uses a reusable line buffer to avoid allocating a new String per line read.
pub struct JsonlReader<R: Read> {
    reader: BufReader<R>,
    line_buffer: String,
}

impl<R: Read> JsonlReader<R> {
    pub fn new(reader: R) -> Self {
        JsonlReader {
            reader: BufReader::new(reader),
            line_buffer: String::with_capacity(1024),
        }
    }

    /// Read the next non-empty line, classified.
    ///
    /// # Returns
    /// * `Ok(Some(ParseResult))` - a line was read
    /// * `Ok(None)` - end of stream
    /// * `Err(e)` - the underlying read failed
    pub fn next_line(&mut self) -> std::io::Result<Option<ParseResult>> {
        // Loop instead of recursion so long runs of blank lines stay flat
        loop {
            self.line_buffer.clear();
            match self.reader.read_line(&mut self.line_buffer)? {
                0 => {
                    debug!("Reached end of JSONL stream");
                    return Ok(None);
                }
                bytes_read => {
                    let trimmed = self.line_buffer.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    debug!(bytes_read, "Read line from JSONL stream");
                    return Ok(Some(parse_envelope_graceful(trimmed)));
                }
            }
        }
    }

    /// Read the next well-formed envelope, skipping anything else.
    pub fn next_envelope(&mut self) -> std::io::Result<Option<Envelope>> {
        loop {
            match self.next_line()? {
                None => return Ok(None),
                Some(ParseResult::Ok(envelope)) => return Ok(Some(envelope)),
                Some(ParseResult::NotEnvelope { error, raw }) => {
                    debug!(error = %error, raw = %raw, "Skipping non-envelope JSON line");
                }
                Some(ParseResult::ParseError { error, raw }) => {
                    debug!(error = %error, raw = %raw, "Skipping non-JSON line");
                }
            }
        }
    }
}
