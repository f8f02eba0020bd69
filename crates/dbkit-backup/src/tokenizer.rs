//! SQL statement tokenizer.
//!
//! [`StatementReader`] turns a byte stream into a forward-only sequence of
//! [`Statement`]s. Boundaries are found by a small state machine that tracks
//! quoted strings/identifiers, backslash escapes, line comments (`--`, `#`)
//! and block comments (`/* */`). Comments are dropped from the statement text.
//!
//! The active delimiter starts as `;` and is replaced by a
//! `DELIMITER <token>` line seen at the start of a fresh statement. Input is
//! read in line-sized chunks of at most 64 KiB, so memory stays bounded by the
//! statement size limit rather than the input size.

use std::io::{BufRead, Read};

use crate::error::{BackupError, Result};

/// Delimiter in effect at the start of every stream
pub const DEFAULT_DELIMITER: &str = ";";

/// Default ceiling on a single buffered statement
pub const DEFAULT_MAX_STATEMENT_SIZE: usize = 64 * 1024 * 1024;

const CHUNK_SIZE: u64 = 64 * 1024;

/// One SQL statement and its place in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Statement text with the delimiter stripped and whitespace trimmed
    pub sql: String,
    /// Source bytes consumed since the previous statement, including skipped
    /// whitespace, comments and directives
    pub bytes_consumed: u64,
    /// Source offset just past this statement's delimiter
    pub end_offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    InString(u8),
    Escaped(u8),
    LineComment,
    BlockComment { star: bool },
}

/// Pulls statements out of a buffered byte stream.
pub struct StatementReader<R> {
    reader: R,
    source_name: String,
    delimiter: String,
    max_size: usize,
    state: ScanState,
    buf: Vec<u8>,
    has_content: bool,
    chunk: Vec<u8>,
    cursor: usize,
    at_line_start: bool,
    position: u64,
    statement_start: u64,
    done: bool,
}

impl<R: BufRead> StatementReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_offset(reader, 0)
    }

    /// Starts scanning a stream that has already been positioned at
    /// `offset`, which must be a statement boundary (an earlier
    /// [`Statement::end_offset`]). Reported offsets continue from there.
    pub fn with_offset(reader: R, offset: u64) -> Self {
        Self {
            reader,
            source_name: "input".to_string(),
            delimiter: DEFAULT_DELIMITER.to_string(),
            max_size: DEFAULT_MAX_STATEMENT_SIZE,
            state: ScanState::Normal,
            buf: Vec::new(),
            has_content: false,
            chunk: Vec::new(),
            cursor: 0,
            at_line_start: offset == 0,
            position: offset,
            statement_start: offset,
            done: false,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    /// Starts with a delimiter other than `;`, e.g. when resuming inside a
    /// `DELIMITER $$` section.
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        let delimiter = delimiter.into();
        if !delimiter.is_empty() {
            self.delimiter = delimiter;
        }
        self
    }

    /// Name used in I/O error messages
    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }

    /// The delimiter currently in effect
    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Source bytes consumed so far, including the starting offset
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns the next statement, or `None` once the stream is exhausted.
    ///
    /// Errors are terminal: later calls return `None`.
    pub fn next_statement(&mut self) -> Result<Option<Statement>> {
        if self.done {
            return Ok(None);
        }
        let result = self.scan_next();
        if result.is_err() {
            self.done = true;
        }
        result
    }

    fn scan_next(&mut self) -> Result<Option<Statement>> {
        loop {
            if self.cursor >= self.chunk.len() {
                if !self.fill_chunk()? {
                    self.done = true;
                    self.state = ScanState::Normal;
                    return self.take_statement(false);
                }

                if self.at_line_start && self.state == ScanState::Normal && !self.has_content {
                    if let Some(delimiter) = parse_delimiter_directive(&self.chunk) {
                        tracing::debug!("Delimiter changed to '{}'", delimiter);
                        self.delimiter = delimiter;
                        self.position += self.chunk.len() as u64;
                        self.cursor = self.chunk.len();
                        continue;
                    }
                }
            }

            while self.cursor < self.chunk.len() {
                let byte = self.chunk[self.cursor];
                self.cursor += 1;
                self.position += 1;

                if self.scan_byte(byte)? {
                    if let Some(statement) = self.take_statement(true)? {
                        return Ok(Some(statement));
                    }
                }
            }
        }
    }

    /// Reads the next line (or 64 KiB of a longer line). Returns false at EOF.
    fn fill_chunk(&mut self) -> Result<bool> {
        if let Some(&last) = self.chunk.last() {
            self.at_line_start = last == b'\n';
        }
        self.chunk.clear();
        self.cursor = 0;

        let n = (&mut self.reader)
            .take(CHUNK_SIZE)
            .read_until(b'\n', &mut self.chunk)
            .map_err(|e| BackupError::io(&self.source_name, e))?;
        Ok(n > 0)
    }

    /// Advances the state machine by one byte. Returns true when the buffer
    /// now ends with the active delimiter outside quotes and comments.
    fn scan_byte(&mut self, byte: u8) -> Result<bool> {
        match self.state {
            ScanState::Normal => match byte {
                b'\'' | b'"' | b'`' => {
                    self.push(byte)?;
                    self.state = ScanState::InString(byte);
                    Ok(false)
                }
                b'#' => {
                    self.state = ScanState::LineComment;
                    Ok(false)
                }
                b'-' if self.buf.last() == Some(&b'-') => {
                    self.buf.pop();
                    self.refresh_content();
                    self.state = ScanState::LineComment;
                    Ok(false)
                }
                b'*' if self.buf.last() == Some(&b'/') => {
                    self.buf.pop();
                    self.refresh_content();
                    self.state = ScanState::BlockComment { star: false };
                    Ok(false)
                }
                _ => {
                    self.push(byte)?;
                    Ok(self.has_content && self.buf.ends_with(self.delimiter.as_bytes()))
                }
            },
            ScanState::InString(quote) => {
                self.push(byte)?;
                if byte == b'\\' {
                    self.state = ScanState::Escaped(quote);
                } else if byte == quote {
                    self.state = ScanState::Normal;
                }
                Ok(false)
            }
            ScanState::Escaped(quote) => {
                self.push(byte)?;
                self.state = ScanState::InString(quote);
                Ok(false)
            }
            ScanState::LineComment => {
                if byte == b'\n' {
                    self.state = ScanState::Normal;
                    self.push(b'\n')?;
                }
                Ok(false)
            }
            ScanState::BlockComment { star } => {
                if star && byte == b'/' {
                    self.state = ScanState::Normal;
                    self.push(b' ')?;
                } else {
                    self.state = ScanState::BlockComment { star: byte == b'*' };
                }
                Ok(false)
            }
        }
    }

    fn push(&mut self, byte: u8) -> Result<()> {
        if !self.has_content {
            if byte.is_ascii_whitespace() {
                return Ok(());
            }
            self.has_content = true;
        }
        self.buf.push(byte);
        if self.buf.len() > self.max_size {
            return Err(BackupError::StatementTooLarge {
                limit: self.max_size,
                offset: self.position,
            });
        }
        Ok(())
    }

    fn refresh_content(&mut self) {
        self.has_content = self.buf.iter().any(|b| !b.is_ascii_whitespace());
    }

    fn take_statement(&mut self, strip_delimiter: bool) -> Result<Option<Statement>> {
        let mut raw = std::mem::take(&mut self.buf);
        self.has_content = false;
        if strip_delimiter {
            raw.truncate(raw.len().saturating_sub(self.delimiter.len()));
        }

        let text = String::from_utf8(raw).map_err(|_| BackupError::InvalidEncoding {
            offset: self.position,
        })?;
        let sql = text.trim();
        if sql.is_empty() {
            return Ok(None);
        }

        let statement = Statement {
            sql: sql.to_string(),
            bytes_consumed: self.position - self.statement_start,
            end_offset: self.position,
        };
        self.statement_start = self.position;
        Ok(Some(statement))
    }
}

impl<R: BufRead> Iterator for StatementReader<R> {
    type Item = Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_statement().transpose()
    }
}

/// Recognises `DELIMITER <token>` (keyword case-insensitive).
fn parse_delimiter_directive(line: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(line).ok()?.trim();
    let (keyword, rest) = text.split_once(|c: char| c.is_ascii_whitespace())?;
    if !keyword.eq_ignore_ascii_case("delimiter") {
        return None;
    }
    rest.split_whitespace().next().map(str::to_string)
}
