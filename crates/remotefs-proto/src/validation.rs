// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Schema validation for remote filesystem messages

use crate::messages::*;
use thiserror::Error;

/// Validation error
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("schema validation failed: {0}")]
    Schema(String),
    #[error("SSZ decoding failed: {0}")]
    SszDecode(String),
}

fn require_absolute(path: &[u8]) -> Result<(), ValidationError> {
    if path.first() != Some(&b'/') {
        return Err(ValidationError::Schema(
            "path must be absolute".to_string(),
        ));
    }
    if path.contains(&0) {
        return Err(ValidationError::Schema(
            "path must not contain NUL bytes".to_string(),
        ));
    }
    Ok(())
}

/// Validate a decoded request against its logical schema
pub fn validate_request(request: &Request) -> Result<(), ValidationError> {
    match request {
        Request::Handshake(handshake) => {
            if handshake.version != PROTOCOL_VERSION {
                return Err(ValidationError::Schema("version must be '1'".to_string()));
            }
            Ok(())
        }
        Request::Open(OpenRequest { path, .. })
        | Request::Access(AccessRequest { path, .. })
        | Request::ReadDir(ReadDirRequest { path }) => require_absolute(path),
        Request::Seek(seek) => {
            if Whence::from_u8(seek.whence).is_none() {
                return Err(ValidationError::Schema(format!(
                    "unknown seek origin {}",
                    seek.whence
                )));
            }
            Ok(())
        }
        // Handle-based operations are checked against the agent's handle table
        Request::Read(_) | Request::Write(_) | Request::Close(_) => Ok(()),
    }
}

/// Validate a decoded response against its logical schema
pub fn validate_response(response: &Response) -> Result<(), ValidationError> {
    match response {
        Response::Handshake(handshake) => {
            if handshake.version != PROTOCOL_VERSION {
                return Err(ValidationError::Schema("version must be '1'".to_string()));
            }
            Ok(())
        }
        Response::Written(WrittenResponse { written, position }) => {
            if written > position {
                return Err(ValidationError::Schema(
                    "write position precedes the bytes written".to_string(),
                ));
            }
            Ok(())
        }
        Response::Entries(EntriesResponse { entries }) => {
            for entry in entries {
                if entry.name.is_empty() || entry.name.contains(&b'/') {
                    return Err(ValidationError::Schema(format!(
                        "invalid directory entry name {:?}",
                        String::from_utf8_lossy(&entry.name)
                    )));
                }
            }
            Ok(())
        }
        // For union responses, the structure is validated by the SSZ decoding itself
        Response::Handle(_)
        | Response::Data(_)
        | Response::Offset(_)
        | Response::Ok(_)
        | Response::Error(_) => Ok(()),
    }
}
