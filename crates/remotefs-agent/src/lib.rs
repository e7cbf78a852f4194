// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reference remotefs agent
//!
//! Serves redirected filesystem operations from a local directory tree over
//! a Unix socket. Used by the end-to-end tests and as a development target
//! for the interception layer.

pub mod fs;
pub mod server;

pub use fs::{errno_of, FsService, Session, AGENT_NAME, MAX_READ_LEN};
pub use server::{serve, AgentError, AgentServer};
