// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::scope::Scope;
use remotefs_client::DEFAULT_REQUEST_TIMEOUT;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const ENV_ENABLED: &str = "REMOTEFS_ENABLED";
pub const ENV_SCOPE: &str = "REMOTEFS_SCOPE";
pub const ENV_SOCKET: &str = "REMOTEFS_AGENT_SOCKET";
pub const ENV_TIMEOUT_MS: &str = "REMOTEFS_TIMEOUT_MS";
pub const ENV_LOG: &str = "REMOTEFS_LOG";

/// Settings read once when the layer is loaded
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub enabled: bool,
    pub scope: Scope,
    pub socket: Option<PathBuf>,
    pub request_timeout: Duration,
    /// `tracing` filter directive; no diagnostics when unset
    pub log_directive: Option<String>,
}

impl LayerConfig {
    pub fn from_env() -> Self {
        let enabled = env::var(ENV_ENABLED).map_or(true, |value| !is_falsy(&value));
        let scope = env::var(ENV_SCOPE).map(|s| Scope::parse(&s)).unwrap_or_default();
        let socket = env::var_os(ENV_SOCKET)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        let request_timeout = env::var(ENV_TIMEOUT_MS)
            .ok()
            .and_then(|value| parse_timeout(&value))
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let log_directive = env::var(ENV_LOG)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Self {
            enabled,
            scope,
            socket,
            request_timeout,
            log_directive,
        }
    }

    /// Whether anything can be redirected at all.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.scope.is_empty() && self.socket.is_some()
    }
}

fn is_falsy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

fn parse_timeout(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => {
            warn!(value, "ignoring invalid {ENV_TIMEOUT_MS}");
            None
        }
        Ok(ms) => Some(Duration::from_millis(ms)),
    }
}
