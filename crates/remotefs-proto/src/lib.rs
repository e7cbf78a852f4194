// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! RemoteFS protocol: wire types shared by the interception layer and the agent
//!
//! This crate defines the SSZ schemas for redirected filesystem operations,
//! the correlation frames that let many requests share one channel, and the
//! length-prefixed framing used on the socket.

pub mod frame;
pub mod messages;
pub mod validation;

// Re-export key types
pub use frame::{
    decode_frame_len, decode_payload, encode_frame, read_frame, write_frame, FrameError,
    FRAME_HEADER_LEN, MAX_FRAME_LEN,
};
pub use messages::{
    AccessRequest, CloseRequest, DataResponse, DirEntry, EntriesResponse, ErrorResponse,
    FileKind, HandleResponse, HandshakeRequest, HandshakeResponse, OffsetResponse, OkResponse,
    OpenRequest, ProcessInfo, ReadDirRequest, ReadRequest, Request, RequestFrame, Response,
    ResponseFrame, SeekRequest, Whence, WriteRequest, WrittenResponse, PROTOCOL_VERSION,
};
pub use validation::*;

