// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use remotefs_client::ClientError;
use thiserror::Error;

/// Failure of a redirected operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayerError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("remote error (errno {errno}): {message}")]
    Remote { errno: i32, message: String },
    #[error("descriptor was evicted after a transport failure")]
    Evicted,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl LayerError {
    /// errno reported to the caller of the intercepted function.
    pub fn errno(&self) -> i32 {
        match self {
            LayerError::Remote { errno, .. } if *errno > 0 => *errno,
            LayerError::InvalidArgument(_) => libc::EINVAL,
            _ => libc::EIO,
        }
    }

    /// Whether the channel to the agent is no longer trustworthy.
    pub fn is_transport(&self) -> bool {
        matches!(self, LayerError::Transport(_))
    }

    pub fn remote(errno: i32, message: impl Into<String>) -> Self {
        LayerError::Remote {
            errno,
            message: message.into(),
        }
    }
}

impl From<ClientError> for LayerError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Protocol(message) => LayerError::Protocol(message),
            other => LayerError::Transport(other.to_string()),
        }
    }
}
