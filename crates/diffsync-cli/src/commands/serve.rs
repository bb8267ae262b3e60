//! Serve command handler

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use diffsync_core::{serve, Config, DataAdapter, FileAdapter, MemoryAdapter, ServerOptions, SyncServer};

use crate::output::Output;

/// Run the sync server until Ctrl-C
pub async fn run(config: &Config, bind: Option<String>, memory: bool, output: &Output) -> Result<()> {
    let addr = bind.unwrap_or_else(|| config.bind_addr.clone());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let options = ServerOptions::from(config);

    if memory {
        output.message("Storing rooms in memory; they are lost on exit");
        run_server(listener, MemoryAdapter::new(), options, output).await
    } else {
        let rooms_dir = config.rooms_dir();
        let adapter = FileAdapter::new(&rooms_dir)
            .with_context(|| format!("Failed to open rooms directory {:?}", rooms_dir))?;
        output.message(&format!("Storing rooms in {}", rooms_dir.display()));
        run_server(listener, adapter, options, output).await
    }
}

async fn run_server<A: DataAdapter>(
    listener: TcpListener,
    adapter: A,
    options: ServerOptions,
    output: &Output,
) -> Result<()> {
    let addr = listener.local_addr().context("Failed to read bound address")?;
    let server = Arc::new(SyncServer::new(adapter).with_options(options));

    output.message(&format!("Listening on ws://{}", addr));

    tokio::select! {
        result = serve(listener, server.clone()) => {
            result.context("Sync server stopped")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
        }
    }

    let stored = server.flush().await.context("Failed to store rooms")?;
    output.success(&format!("Stored {} room(s)", stored));

    Ok(())
}
