//! Per-connection transfer handler.
//!
//! Drives one exchange: header block, payload, file, response. Whatever
//! happens, exactly one response block is written before the connection
//! closes.

use super::deadline::Deadline;
use super::error::ConnError;
use super::parser::read_headers;
use super::payload::PayloadReader;
use crate::config::Config;
use crate::storage::{DropStore, StoredFile};
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, trace};

/// Response written after a complete transfer.
pub const SUCCESS_RESPONSE: &[u8] = b"STATUS: OK\nMESSAGE: File received successfully\n";

/// Where a connection is in its exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Reading the header block.
    AwaitingHeaders,
    /// Headers accepted, no payload byte read yet.
    AwaitingPayload,
    /// Destination file open, chunks being written.
    Persisting,
    /// All bytes written and synced.
    Done,
    /// A fault was reported to the client.
    Failed,
}

/// Read-only settings shared by every connection.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub store: DropStore,
    pub max_file_size: u64,
    pub chunk_size: usize,
    pub deadline: Deadline,
}

impl HandlerContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            store: DropStore::new(config.root_dir.clone()),
            max_file_size: config.max_file_size,
            chunk_size: config.chunk_size,
            deadline: Deadline::new(config.idle_timeout()),
        }
    }
}

/// Handle a single client connection.
///
/// Returns the terminal state. An error means the response itself could
/// not be written.
pub async fn handle_connection<S>(
    stream: S,
    peer: IpAddr,
    ctx: &HandlerContext,
) -> io::Result<TransferState>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut transfer = Transfer::new(peer);

    let response = match transfer.receive(&mut reader, ctx).await {
        Ok(path) => {
            info!(peer = %peer, path = %path.display(), "File received");
            SUCCESS_RESPONSE.to_vec()
        }
        Err(e) => {
            debug!(
                peer = %peer,
                state = ?transfer.state,
                status = e.status_code(),
                message = e.message(),
                details = e.details(),
                "Transfer failed"
            );
            transfer.advance(TransferState::Failed);
            e.to_string().into_bytes()
        }
    };

    ctx.deadline.run(writer.write_all(&response)).await?;
    ctx.deadline.run(writer.shutdown()).await?;

    Ok(transfer.state)
}

/// State of one connection's exchange.
struct Transfer {
    peer: IpAddr,
    state: TransferState,
}

impl Transfer {
    fn new(peer: IpAddr) -> Self {
        Self {
            peer,
            state: TransferState::AwaitingHeaders,
        }
    }

    fn advance(&mut self, next: TransferState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }

    async fn receive<R>(&mut self, reader: &mut R, ctx: &HandlerContext) -> Result<PathBuf, ConnError>
    where
        R: AsyncBufRead + Unpin,
    {
        let request = read_headers(reader, ctx.deadline).await?;
        debug!(
            peer = %self.peer,
            filename = request.filename(),
            filesize = request.filesize(),
            "Headers received"
        );

        let mut payload = PayloadReader::new(
            reader,
            request.filesize(),
            ctx.max_file_size,
            ctx.chunk_size,
            ctx.deadline,
        )?;
        self.advance(TransferState::AwaitingPayload);

        // Opened on the first chunk so nothing touches the disk before data arrives
        let mut file: Option<StoredFile> = None;
        while let Some(chunk) = payload.next_chunk().await? {
            if file.is_none() {
                self.advance(TransferState::Persisting);
                file = Some(ctx.store.create(self.peer, request.filename()).await?);
            }
            if let Some(file) = file.as_mut() {
                file.write_chunk(chunk).await?;
            }

            let progress = payload.progress();
            trace!(
                peer = %self.peer,
                received = progress.received(),
                total = progress.total(),
                percent = progress.percent(),
                "Payload progress"
            );
        }

        let file = match file {
            Some(file) => file,
            None => {
                // Empty payload still produces an (empty) file
                self.advance(TransferState::Persisting);
                ctx.store.create(self.peer, request.filename()).await?
            }
        };
        let written = file.written();
        let path = file.finish().await?;

        self.advance(TransferState::Done);
        debug!(peer = %self.peer, bytes = written, "Payload persisted");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    const MAX: u64 = 10 * 1024 * 1024;

    fn context(root: &Path, chunk_size: usize) -> HandlerContext {
        HandlerContext {
            store: DropStore::new(root),
            max_file_size: MAX,
            chunk_size,
            deadline: Deadline::default(),
        }
    }

    fn peer(ip: &str) -> IpAddr {
        ip.parse().unwrap()
    }

    /// Send `request`, optionally half-close, and collect the response.
    async fn exchange(
        ctx: &HandlerContext,
        peer: IpAddr,
        request: &[u8],
        close_after: bool,
    ) -> (TransferState, String) {
        let (mut client, server) = tokio::io::duplex(64 * 1024);

        let client_side = async {
            client.write_all(request).await.unwrap();
            if close_after {
                client.shutdown().await.unwrap();
            }
            let mut response = String::new();
            client.read_to_string(&mut response).await.unwrap();
            response
        };

        let (state, response) = tokio::join!(handle_connection(server, peer, ctx), client_side);
        (state.unwrap(), response)
    }

    fn stored_files(root: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(root) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn status_code(response: &str) -> Option<&str> {
        response
            .lines()
            .find_map(|line| line.strip_prefix("STATUS CODE: "))
    }

    #[tokio::test]
    async fn test_successful_transfer() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), 4096);

        let (state, response) = exchange(
            &ctx,
            peer("127.0.0.1"),
            b"filename: a.txt\nfilesize: 5\n\nhello",
            false,
        )
        .await;

        assert_eq!(state, TransferState::Done);
        assert_eq!(response, "STATUS: OK\nMESSAGE: File received successfully\n");

        let files = stored_files(dir.path());
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
        let (timestamp, rest) = name.split_once('_').unwrap();
        assert!(timestamp.parse::<i64>().is_ok());
        assert_eq!(rest, "127.0.0.1_a.txt");
        assert_eq!(std::fs::read(&files[0]).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_large_transfer_in_chunks() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), 4096);
        let body: Vec<u8> = (0..1_000_003u32).map(|i| (i % 251) as u8).collect();

        let mut request = format!("filename: blob.bin\nfilesize: {}\n\n", body.len()).into_bytes();
        request.extend_from_slice(&body);

        let (state, _) = exchange(&ctx, peer("127.0.0.1"), &request, false).await;
        assert_eq!(state, TransferState::Done);

        let files = stored_files(dir.path());
        assert_eq!(std::fs::read(&files[0]).unwrap(), body);
    }

    #[tokio::test]
    async fn test_empty_payload_creates_empty_file() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), 4096);

        let (state, _) = exchange(&ctx, peer("127.0.0.1"), b"filename: empty\n\n", false).await;
        assert_eq!(state, TransferState::Done);

        let files = stored_files(dir.path());
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::metadata(&files[0]).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_filesize() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), 4096);

        let (state, response) = exchange(
            &ctx,
            peer("127.0.0.1"),
            b"filename: a.txt\nfilesize: abc\n\n",
            false,
        )
        .await;

        assert_eq!(state, TransferState::Failed);
        assert!(response.starts_with("STATUS: NOT OK\n"));
        assert_eq!(status_code(&response), Some("400"));
        assert!(response.contains("MESSAGE: Invalid filesize\n"));
        assert!(stored_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_size_exceeded_touches_no_disk() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("drops");
        let ctx = context(&root, 4096);

        let (state, response) =
            exchange(&ctx, peer("127.0.0.1"), b"filesize: 20000000\n\n", false).await;

        assert_eq!(state, TransferState::Failed);
        assert_eq!(status_code(&response), Some("400"));
        assert!(response.contains("MESSAGE: File size exceeds limit\n"));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_missing_colon_rejected_before_payload() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), 4096);

        let (state, response) = exchange(
            &ctx,
            peer("127.0.0.1"),
            b"filename a.txt\nfilesize: 5\n\nhello",
            false,
        )
        .await;

        assert_eq!(state, TransferState::Failed);
        assert_eq!(status_code(&response), Some("400"));
        assert!(response.contains("MESSAGE: Malformed headers\n"));
        assert!(stored_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_traversal_stays_in_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("drops");
        let ctx = context(&root, 4096);

        let (state, _) = exchange(
            &ctx,
            peer("127.0.0.1"),
            b"filename: ../../etc/passwd\nfilesize: 2\n\nhi",
            false,
        )
        .await;
        assert_eq!(state, TransferState::Done);

        let files = stored_files(&root);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].parent(), Some(root.as_path()));
        assert!(files[0].to_string_lossy().ends_with("_127.0.0.1_passwd"));
        assert_eq!(stored_files(dir.path()), vec![root.clone()]);
    }

    #[tokio::test]
    async fn test_truncated_payload_leaves_one_partial_file() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), 4);

        let (state, response) = exchange(
            &ctx,
            peer("127.0.0.1"),
            b"filename: a.txt\nfilesize: 10\n\nabcdef",
            true,
        )
        .await;

        assert_eq!(state, TransferState::Failed);
        assert_eq!(response.matches("STATUS:").count(), 1);
        assert_eq!(status_code(&response), Some("500"));
        assert!(response.contains("MESSAGE: Error in receiving file\n"));

        let files = stored_files(dir.path());
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_header_eof() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), 4096);

        let (state, response) =
            exchange(&ctx, peer("127.0.0.1"), b"filename: a.txt\n", true).await;

        assert_eq!(state, TransferState::Failed);
        assert_eq!(status_code(&response), Some("500"));
        assert!(response.contains("MESSAGE: Error in reading message\n"));
    }

    #[tokio::test]
    async fn test_idle_client_times_out() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(dir.path(), 4096);
        ctx.deadline = Deadline::new(Some(Duration::from_millis(50)));

        // Headers promise more payload than is ever sent; the client stays open.
        let (state, response) = exchange(
            &ctx,
            peer("127.0.0.1"),
            b"filename: a.txt\nfilesize: 10\n\nabc",
            false,
        )
        .await;

        assert_eq!(state, TransferState::Failed);
        assert_eq!(status_code(&response), Some("500"));
        assert!(response.contains("DETAILS: connection idle for 50ms\n"));
    }

    #[tokio::test]
    async fn test_concurrent_same_name_from_different_peers() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path(), 4096);
        let request = b"filename: same.txt\nfilesize: 3\n\nabc";

        let ((a, _), (b, _)) = tokio::join!(
            exchange(&ctx, peer("10.0.0.1"), request, false),
            exchange(&ctx, peer("10.0.0.2"), request, false),
        );
        assert_eq!(a, TransferState::Done);
        assert_eq!(b, TransferState::Done);

        let names: Vec<String> = stored_files(dir.path())
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.ends_with("_10.0.0.1_same.txt")));
        assert!(names.iter().any(|n| n.ends_with("_10.0.0.2_same.txt")));
    }
}
