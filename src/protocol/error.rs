//! Protocol faults and their wire rendering.

use std::fmt;
use std::io;

/// Status code used when none is given.
pub const DEFAULT_STATUS_CODE: u16 = 500;

/// Message used when none is given.
pub const DEFAULT_MESSAGE: &str = "Unknown error";

/// A protocol or I/O fault on one connection.
///
/// Defaults are applied in [`ConnError::new`], so a constructed value is
/// always fully resolved. `Display` renders the failure block written to
/// the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnError {
    status_code: u16,
    message: String,
    details: String,
}

impl ConnError {
    /// Create a fault. A zero status code becomes 500 and an empty message
    /// becomes "Unknown error".
    pub fn new(status_code: u16, message: impl Into<String>, details: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status_code: if status_code == 0 {
                DEFAULT_STATUS_CODE
            } else {
                status_code
            },
            message: if message.is_empty() {
                DEFAULT_MESSAGE.to_string()
            } else {
                message
            },
            details: details.into(),
        }
    }

    /// Header line without a separator, unknown key, or oversized header.
    pub fn malformed_header(details: impl Into<String>) -> Self {
        Self::new(400, "Malformed headers", details)
    }

    /// `filesize` value that is not a non-negative integer.
    pub fn invalid_filesize(err: impl fmt::Display) -> Self {
        Self::new(400, "Invalid filesize", format!("Invalid filesize: {err}"))
    }

    /// Declared size above the accepted maximum.
    pub fn size_exceeded(filesize: u64, max: u64) -> Self {
        Self::new(
            400,
            "File size exceeds limit",
            format!("File size {filesize} exceeds {max} bytes"),
        )
    }

    /// I/O failure while reading the header block.
    pub fn read_failed(err: &io::Error) -> Self {
        Self::new(500, "Error in reading message", describe(err))
    }

    /// I/O failure or short read while receiving the payload.
    pub fn receive_failed(err: &io::Error) -> Self {
        Self::new(500, "Error in receiving file", describe(err))
    }

    /// Failure creating the root directory, the file, or writing to it.
    pub fn persist_failed(err: &io::Error) -> Self {
        Self::new(500, "Error in saving the file", describe(err))
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &str {
        &self.details
    }
}

fn describe(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => "unexpected end of stream".to_string(),
        _ => err.to_string(),
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STATUS: NOT OK\nSTATUS CODE: {}\nMESSAGE: {}\nDETAILS: {}\n",
            self.status_code, self.message, self.details
        )
    }
}

impl std::error::Error for ConnError {}
