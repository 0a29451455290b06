//! file-drop: a TCP file-drop server
//!
//! Clients connect, send a short text header naming the file and its size,
//! then stream the raw bytes. The server stores the payload under a
//! collision-resistant name and answers with a plain-text status block.
//!
//! Features:
//! - Size-bounded, chunked payload reads
//! - Path-traversal-safe file naming
//! - Idle read timeouts
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod server;
mod storage;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        root_dir = %config.root_dir.display(),
        max_file_size = config.max_file_size,
        chunk_size = config.chunk_size,
        read_timeout = config.read_timeout,
        max_connections = config.max_connections,
        "Starting file-drop server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async {
        let server = Server::new(config);
        server.run().await
    })?;

    info!("Server stopped");
    Ok(())
}
