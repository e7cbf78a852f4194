// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! remotefs interception layer
//!
//! Loaded with `LD_PRELOAD`, this library redirects file calls on paths under
//! the configured scope to a remote agent and passes everything else to the
//! native implementation. All process-wide state lives in one [`Layer`]
//! built by the load-time constructor.

pub mod config;
pub mod detour;
pub mod dir;
pub mod error;
pub mod local_fd;
pub mod ops;
pub mod scope;
pub mod shadow;

#[cfg(all(target_os = "linux", not(test)))]
mod hook_safe_io;
#[cfg(all(target_os = "linux", not(test)))]
pub mod hooks;

pub use config::LayerConfig;
pub use error::LayerError;
pub use ops::{Dispatch, Layer};
pub use scope::Scope;

use anyhow::{Context, Result};
use detour::HookGuard;
use local_fd::MemfdPlaceholders;
use once_cell::sync::OnceCell;
use remotefs_client::{ClientConfig, RemoteClient};
use remotefs_logging::LogFormat;
use std::io;
use tracing::{debug, info, warn};

static INIT_GUARD: OnceCell<()> = OnceCell::new();
static LAYER: OnceCell<Layer> = OnceCell::new();

/// The active layer, if the agent was reachable at load time.
pub fn layer() -> Option<&'static Layer> {
    LAYER.get()
}

/// Read the environment, connect to the agent and publish the layer.
/// Only the first call does anything.
pub fn initialize() {
    if INIT_GUARD.set(()).is_err() {
        return;
    }
    let _guard = HookGuard::new();

    let config = LayerConfig::from_env();
    if let Some(directive) = &config.log_directive {
        if let Err(err) =
            remotefs_logging::init_with_directive(directive, LogFormat::Plaintext, io::stderr)
        {
            eprintln!("remotefs-layer: diagnostics disabled: {err:#}");
        }
    }

    if !config.is_active() {
        debug!(?config, "remotefs layer inactive");
        return;
    }

    match build_layer(&config) {
        Ok(layer) => {
            info!(
                scope = ?layer.scope().prefixes(),
                timeout_ms = config.request_timeout.as_millis() as u64,
                "remotefs layer active"
            );
            let _ = LAYER.set(layer);
        }
        Err(err) => warn!(error = %format!("{err:#}"), "agent unreachable; layer stays inert"),
    }
}

fn build_layer(config: &LayerConfig) -> Result<Layer> {
    let socket = config.socket.as_deref().context("agent socket not configured")?;
    let client_config = ClientConfig::builder("remotefs-layer", env!("CARGO_PKG_VERSION"))
        .request_timeout(config.request_timeout)
        .write_timeout(config.request_timeout)
        .build()?;
    let client = RemoteClient::connect(socket, &client_config, socket_io())?;

    Ok(Layer::new(
        config.scope.clone(),
        Box::new(client),
        Box::new(MemfdPlaceholders),
    ))
}

#[cfg(all(target_os = "linux", not(test)))]
fn socket_io() -> hook_safe_io::HookSafeIo {
    hook_safe_io::HookSafeIo
}

#[cfg(not(all(target_os = "linux", not(test))))]
fn socket_io() -> remotefs_client::io_trait::StandardIo {
    remotefs_client::io_trait::StandardIo
}

#[cfg(not(test))]
#[ctor::ctor]
fn load() {
    initialize();
}

#[cfg(not(test))]
#[ctor::dtor]
fn unload() {
    if let Some(layer) = LAYER.get() {
        let _guard = HookGuard::new();
        layer.shutdown();
    }
}
