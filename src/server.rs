//! TCP server accepting file-drop connections.
//!
//! Each accepted connection runs on its own task. On shutdown the listener
//! is closed and in-flight transfers get a grace period to finish.

use crate::config::Config;
use crate::protocol::{handle_connection, HandlerContext};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Listen backlog for the server socket
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    context: Arc<HandlerContext>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let context = Arc::new(HandlerContext::from_config(&config));
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            context,
            connection_limit,
        }
    }

    /// Bind, then serve until SIGINT or SIGTERM
    pub async fn run(&self) -> io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let addr = tokio::net::lookup_host(self.config.listen.as_str())
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address found for {}", self.config.listen),
                )
            })?;

        TcpListener::from_std(create_listener(addr)?)
    }

    /// Accept connections until `shutdown` completes
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            address = %listener.local_addr()?,
            root_dir = %self.context.store.root().display(),
            "Server listening"
        );
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => {
                    permit.map_err(io::Error::other)?
                }
            };

            let (stream, addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };
            debug!(peer = %addr, "Client connected");

            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                let peer = addr.ip().to_canonical();
                match handle_connection(stream, peer, &context).await {
                    Ok(state) => trace!(peer = %addr, ?state, "Connection closed"),
                    Err(e) => debug!(peer = %addr, error = %e, "Connection error"),
                }
                drop(permit);
            });
        }

        drop(listener);
        info!("Stopped accepting connections");
        self.drain().await;
        Ok(())
    }

    /// Wait for in-flight transfers, up to the configured grace period
    async fn drain(&self) {
        let in_flight = self.in_flight();
        if in_flight == 0 {
            return;
        }
        info!(in_flight, "Waiting for in-flight transfers");

        let all = u32::try_from(self.config.max_connections).unwrap_or(u32::MAX);
        let grace = Duration::from_secs(self.config.shutdown_grace);
        match tokio::time::timeout(grace, self.connection_limit.acquire_many(all)).await {
            Ok(_) => info!("All transfers finished"),
            Err(_) => warn!(
                in_flight = self.in_flight(),
                "Grace period elapsed with transfers still running"
            ),
        }
    }

    fn in_flight(&self) -> usize {
        self.config.max_connections - self.connection_limit.available_permits()
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
}
