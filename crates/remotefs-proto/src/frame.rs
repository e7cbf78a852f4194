// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Length-prefixed framing: every SSZ message travels as a little-endian
//! `u32` byte count followed by the encoded payload.

use std::io::{self, Read, Write};

use ssz::{Decode, Encode};
use thiserror::Error;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Size of the length header preceding every frame.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
    #[error("SSZ decoding failed: {0}")]
    Decode(String),
}

/// Encode `message` and prepend its length header.
pub fn encode_frame(message: &impl Encode) -> Result<Vec<u8>, FrameError> {
    let payload = message.as_ssz_bytes();
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Parse a length header, rejecting oversized frames before allocating.
pub fn decode_frame_len(header: [u8; FRAME_HEADER_LEN]) -> Result<usize, FrameError> {
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}

pub fn decode_payload<T: Decode>(payload: &[u8]) -> Result<T, FrameError> {
    T::from_ssz_bytes(payload).map_err(|err| FrameError::Decode(format!("{err:?}")))
}

/// Write one frame to a blocking writer.
pub fn write_frame<W: Write>(writer: &mut W, message: &impl Encode) -> Result<(), FrameError> {
    let bytes = encode_frame(message)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from a blocking reader.
pub fn read_frame<R: Read, T: Decode>(reader: &mut R) -> Result<T, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = decode_frame_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    decode_payload(&payload)
}
