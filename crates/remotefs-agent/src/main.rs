// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::Context;
use clap::Parser;
use remotefs_agent::{AgentServer, FsService};
use remotefs_logging::CliLoggingArgs;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tracing::{info, warn};

const COMPONENT: &str = "remotefs-agent";

#[derive(Parser)]
#[command(name = "remotefs-agent")]
#[command(about = "Serve remotefs requests from a local directory tree")]
#[command(version, long_about = None)]
struct Cli {
    /// Unix socket path the layer connects to
    #[arg(long, env = "REMOTEFS_AGENT_SOCKET")]
    socket: PathBuf,

    /// Directory that remote absolute paths are mapped under
    #[arg(long, env = "REMOTEFS_AGENT_ROOT", default_value = "/")]
    root: PathBuf,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.logging.init(COMPONENT).context("failed to initialize logging")?;

    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("invalid root {}", cli.root.display()))?;
    let server = AgentServer::new(&cli.socket, FsService::new(root));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = shutdown_tx.send(());
            }
            Err(err) => {
                warn!(%err, "cannot listen for ctrl-c; running until killed");
                // Keeps the sender alive so the server is not told to stop.
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    server.run(shutdown_rx).await?;
    info!("agent stopped");
    Ok(())
}
