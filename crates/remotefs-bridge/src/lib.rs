// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! ABI bridge loader
//!
//! A tiny preloadable image whose only job is to `dlopen` the library named
//! by `REMOTEFS_BRIDGE_LIBRARY` once, before application code runs, so that
//! the loaded image's constructors install their hooks. Every failure is
//! swallowed: the host process always keeps running.

use once_cell::sync::OnceCell;
use std::env;
use std::ffi::{CStr, CString, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

pub const ENV_LIBRARY: &str = "REMOTEFS_BRIDGE_LIBRARY";
pub const ENV_LOG: &str = "REMOTEFS_BRIDGE_LOG";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("{ENV_LIBRARY} is not set")]
    NotConfigured,
    #[error("invalid library path {0:?}")]
    InvalidPath(OsString),
    #[error("failed to load {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Outcome of the one-shot load
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeState {
    NotConfigured,
    Loaded,
    Failed(String),
}

#[derive(Clone, Debug, Default)]
pub struct BridgeConfig {
    pub library: Option<PathBuf>,
    /// Print a diagnostic line to stderr when loading fails
    pub log_failures: bool,
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self {
            library: env::var_os(ENV_LIBRARY)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            log_failures: is_truthy(env::var(ENV_LOG).ok().as_deref()),
        }
    }
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|s| s.trim().to_ascii_lowercase()),
        Some(ref v) if v == "1" || v == "true" || v == "yes" || v == "on"
    )
}

static STATE: OnceCell<BridgeState> = OnceCell::new();

/// Load the configured library. Runs once per process; later calls return
/// the recorded outcome.
pub fn initialize() -> &'static BridgeState {
    STATE.get_or_init(|| {
        let config = BridgeConfig::from_env();
        let state = match load(&config) {
            Ok(()) => BridgeState::Loaded,
            Err(BridgeError::NotConfigured) => BridgeState::NotConfigured,
            Err(err) => {
                if config.log_failures {
                    eprintln!("remotefs-bridge: {err}");
                }
                warn!(%err, "bridge library not loaded");
                BridgeState::Failed(err.to_string())
            }
        };
        debug!(?state, "bridge initialized");
        state
    })
}

/// Outcome of [`initialize`], or `None` before it ran.
pub fn bridge_state() -> Option<&'static BridgeState> {
    STATE.get()
}

/// `dlopen` the configured library. The handle is never closed; the image
/// stays mapped for the life of the process.
pub fn load(config: &BridgeConfig) -> Result<(), BridgeError> {
    let path = config.library.as_ref().ok_or(BridgeError::NotConfigured)?;
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| BridgeError::InvalidPath(path.as_os_str().to_owned()))?;

    let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_LAZY) };
    if handle.is_null() {
        return Err(BridgeError::Load {
            path: path.display().to_string(),
            reason: last_dl_error(),
        });
    }
    debug!(path = %path.display(), "bridge library loaded");
    Ok(())
}

fn last_dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown dlopen error".to_string()
    } else {
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    }
}

#[cfg(not(test))]
#[ctor::ctor]
fn load_bridge() {
    initialize();
}
