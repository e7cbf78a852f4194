// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end fixtures for the remotefs layer
//!
//! Tests start an in-process agent serving a scratch tree, then run the
//! `remotefs-test-helper` binary with the layer preloaded. The scratch tree's
//! `app/` directory is served as `/app`, which does not exist locally, so a
//! helper that succeeds on `/app` paths went through the agent.

use anyhow::{bail, Context, Result};
use remotefs_agent::{serve, FsService};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Once};
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const SHORT_TEXT: &str = "Pineapples.";

pub const LOREM: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud exercitation ullamco laboris nisi ut aliquip ex ea commodo consequat. Duis aute irure dolor in reprehenderit in voluptate velit esse cillum dolore eu fugiat nulla pariatur. Excepteur sint occaecat cupidatat non proident, sunt in culpa qui officia deserunt mollit anim id est laborum.";

/// Environment variables the layer and bridge read; cleared for every helper.
const LAYER_ENV: &[&str] = &[
    "REMOTEFS_ENABLED",
    "REMOTEFS_SCOPE",
    "REMOTEFS_AGENT_SOCKET",
    "REMOTEFS_TIMEOUT_MS",
    "REMOTEFS_LOG",
    "REMOTEFS_BRIDGE_LIBRARY",
    "REMOTEFS_BRIDGE_LOG",
];

/// Cargo's output directory for this workspace.
pub fn target_dir() -> PathBuf {
    let root = match std::env::var_os("CARGO_TARGET_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("target"),
    };
    root.join("debug")
}

/// Build the preloadable libraries once per test process.
pub fn build_libraries() {
    static BUILD_ONCE: Once = Once::new();
    BUILD_ONCE.call_once(|| {
        let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".into());
        let status = std::process::Command::new(cargo)
            .args([
                "build",
                "-p",
                "remotefs-layer",
                "-p",
                "remotefs-bridge",
                "--lib",
            ])
            .status()
            .expect("failed to run cargo build for preload libraries");
        assert!(status.success(), "failed to build preload libraries");
    });
}

fn library(name: &str) -> PathBuf {
    build_libraries();
    let path = target_dir().join(name);
    assert!(path.exists(), "library not built at {}", path.display());
    path
}

pub fn layer_library() -> PathBuf {
    library("libremotefs_layer.so")
}

pub fn bridge_library() -> PathBuf {
    library("libremotefs_bridge.so")
}

/// Agent serving a scratch tree for the duration of a test
pub struct AgentFixture {
    root: tempfile::TempDir,
    _socket_dir: tempfile::TempDir,
    socket: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AgentFixture {
    /// Start an agent whose `/app` holds `test.txt` (the long text) and
    /// `app.py`, created in that order.
    pub async fn start() -> Result<Self> {
        let root = tempfile::tempdir()?;
        let app = root.path().join("app");
        std::fs::create_dir(&app)?;
        std::fs::write(app.join("test.txt"), LOREM)?;
        std::fs::write(app.join("app.py"), "print('hello')\n")?;

        let socket_dir = tempfile::tempdir()?;
        let socket = socket_dir.path().join("agent.sock");
        let listener = UnixListener::bind(&socket)
            .with_context(|| format!("failed to bind {}", socket.display()))?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let service = Arc::new(FsService::new(root.path()));
        let task = tokio::spawn(async move {
            if let Err(err) = serve(listener, service, shutdown_rx).await {
                tracing::warn!(%err, "test agent stopped");
            }
        });

        Ok(Self {
            root,
            _socket_dir: socket_dir,
            socket,
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Local directory served as `/app`.
    pub fn app_dir(&self) -> PathBuf {
        self.root.path().join("app")
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Command running `helper` with the layer preloaded and `/app` in scope.
    pub fn layered(&self, helper: &str) -> Command {
        let mut cmd = bare(helper);
        cmd.env("LD_PRELOAD", layer_library())
            .env("REMOTEFS_SCOPE", "/app")
            .env("REMOTEFS_AGENT_SOCKET", &self.socket)
            .env("REMOTEFS_TIMEOUT_MS", "5000")
            .env("REMOTEFS_LOG", "remotefs_layer=warn");
        cmd
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AgentFixture {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Command running `helper` with no remotefs configuration at all.
pub fn bare(helper: &str) -> Command {
    let mut cmd = Command::new(helper);
    for key in LAYER_ENV {
        cmd.env_remove(key);
    }
    cmd.env_remove("LD_PRELOAD")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Run `cmd` and return its stdout, failing with both streams on a non-zero
/// exit.
pub async fn run_ok(cmd: &mut Command) -> Result<String> {
    let output = cmd.output().await.context("failed to spawn helper")?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        bail!(
            "helper failed with {}\nstdout:\n{}\nstderr:\n{}",
            output.status,
            stdout,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(stdout)
}
