//! Header block parser.
//!
//! Reads `key: value` lines until a blank line. Recognized keys are
//! `filename` and `filesize`, compared case-insensitively. Bytes after the
//! blank line are left in the reader for the payload.

use super::deadline::Deadline;
use super::error::ConnError;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest accepted header line, excluding the newline.
pub const MAX_HEADER_LINE: usize = 8 * 1024;

/// Most header lines accepted before the terminator.
pub const MAX_HEADER_LINES: usize = 64;

/// Transfer parameters taken from the header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferRequest {
    filename: String,
    filesize: u64,
}

impl TransferRequest {
    /// Client-supplied name, not yet sanitized.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Declared payload length in bytes.
    pub fn filesize(&self) -> u64 {
        self.filesize
    }

    fn apply(&mut self, header: Header) {
        match header {
            Header::Filename(name) => self.filename = name,
            Header::Filesize(size) => self.filesize = size,
        }
    }
}

/// A single parsed header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Filename(String),
    Filesize(u64),
}

/// Parse one trimmed, non-empty header line.
pub fn parse_line(line: &str) -> Result<Header, ConnError> {
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| ConnError::malformed_header(format!("missing ':' in line {line:?}")))?;

    let key = key.trim();
    let value = value.trim();

    if key.eq_ignore_ascii_case("filename") {
        Ok(Header::Filename(value.to_string()))
    } else if key.eq_ignore_ascii_case("filesize") {
        value
            .parse::<u64>()
            .map(Header::Filesize)
            .map_err(|e| ConnError::invalid_filesize(e))
    } else {
        Err(ConnError::malformed_header(format!("unknown header {key:?}")))
    }
}

/// Read the header block up to and including the blank line.
pub async fn read_headers<R>(reader: &mut R, deadline: Deadline) -> Result<TransferRequest, ConnError>
where
    R: AsyncBufRead + Unpin,
{
    let mut request = TransferRequest::default();
    let mut line = Vec::with_capacity(128);
    let mut count = 0;

    loop {
        line.clear();

        // One extra byte so a full-length line can still carry its newline
        let limit = MAX_HEADER_LINE as u64 + 1;
        let n = deadline
            .run((&mut *reader).take(limit).read_until(b'\n', &mut line))
            .await
            .map_err(|e| ConnError::read_failed(&e))?;

        if n == 0 || line.last() != Some(&b'\n') {
            if line.len() > MAX_HEADER_LINE {
                return Err(ConnError::malformed_header(format!(
                    "header line exceeds {MAX_HEADER_LINE} bytes"
                )));
            }
            return Err(ConnError::read_failed(&io::Error::from(
                io::ErrorKind::UnexpectedEof,
            )));
        }

        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(request);
        }

        count += 1;
        if count > MAX_HEADER_LINES {
            return Err(ConnError::malformed_header(format!(
                "more than {MAX_HEADER_LINES} header lines"
            )));
        }

        request.apply(parse_line(trimmed)?);
    }
}
