//! Idle deadline for connection I/O.

use std::future::Future;
use std::io;
use std::time::Duration;

/// Upper bound on how long a single read or write may wait.
///
/// `None` waits forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Duration>);

impl Deadline {
    pub fn new(idle: Option<Duration>) -> Self {
        Self(idle)
    }

    /// Run an I/O future, failing with `TimedOut` once the deadline passes.
    pub async fn run<F, T>(self, io: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        let Some(idle) = self.0 else {
            return io.await;
        };

        match tokio::time::timeout(idle, io).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connection idle for {idle:?}"),
            )),
        }
    }
}
