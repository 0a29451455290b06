//! Length-framed payload reader.
//!
//! The payload has no delimiter: exactly `filesize` bytes follow the header
//! block. Bytes are read in fixed-size chunks into one reusable buffer, and
//! each read asks for at most the bytes still owed, so nothing past the
//! payload is ever consumed.

use super::deadline::Deadline;
use super::error::ConnError;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes received so far against the declared total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    received: u64,
    total: u64,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self { received: 0, total }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn remaining(&self) -> u64 {
        self.total - self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }

    /// Whole percent received; an empty payload counts as complete.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.received * 100 / self.total) as u8
    }
}

/// Reads exactly `filesize` bytes from a stream, one chunk at a time.
pub struct PayloadReader<'a, R> {
    reader: &'a mut R,
    buffer: BytesMut,
    progress: Progress,
    deadline: Deadline,
}

impl<'a, R> PayloadReader<'a, R>
where
    R: AsyncRead + Unpin,
{
    /// Check the declared size against `max_size` and prepare to read.
    ///
    /// Nothing is read from the stream when the size is rejected.
    pub fn new(
        reader: &'a mut R,
        filesize: u64,
        max_size: u64,
        chunk_size: usize,
        deadline: Deadline,
    ) -> Result<Self, ConnError> {
        if filesize > max_size {
            return Err(ConnError::size_exceeded(filesize, max_size));
        }

        // No point allocating a full chunk for a tiny payload
        let len = (chunk_size as u64).min(filesize) as usize;
        let mut buffer = BytesMut::with_capacity(len);
        buffer.resize(len, 0);

        Ok(Self {
            reader,
            buffer,
            progress: Progress::new(filesize),
            deadline,
        })
    }

    /// Read the next chunk, or `None` once the whole payload has arrived.
    pub async fn next_chunk(&mut self) -> Result<Option<&[u8]>, ConnError> {
        if self.progress.is_complete() {
            return Ok(None);
        }

        let want = self.progress.remaining().min(self.buffer.len() as u64) as usize;
        let deadline = self.deadline;
        deadline
            .run(self.reader.read_exact(&mut self.buffer[..want]))
            .await
            .map_err(|e| ConnError::receive_failed(&e))?;

        self.progress.received += want as u64;
        Ok(Some(&self.buffer[..want]))
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }
}
