// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SSZ message types exchanged between the interception layer and the agent

use ssz_derive::{Decode, Encode};

/// Protocol version advertised in the handshake.
pub const PROTOCOL_VERSION: &[u8] = b"1";

// SSZ Union-based request/response types for type-safe communication
// Using Vec<u8> for paths and names as SSZ supports variable-length byte vectors

/// Request frame: a correlation identifier plus the operation to perform
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct RequestFrame {
    pub correlation_id: u64,
    pub request: Request,
}

/// Response frame: echoes the correlation identifier of the request it answers
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ResponseFrame {
    pub correlation_id: u64,
    pub response: Response,
}

/// Request union - each variant contains operation-specific data
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum Request {
    Handshake(HandshakeRequest),
    Open(OpenRequest),
    Read(ReadRequest),
    Write(WriteRequest),
    Seek(SeekRequest),
    Access(AccessRequest),
    ReadDir(ReadDirRequest),
    Close(CloseRequest),
}

/// Response union - operation-specific success payloads or an error
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum Response {
    Handshake(HandshakeResponse),
    Handle(HandleResponse),
    Data(DataResponse),
    Written(WrittenResponse),
    Offset(OffsetResponse),
    Ok(OkResponse),
    Entries(EntriesResponse),
    Error(ErrorResponse),
}

/// Handshake sent once per connection by the layer
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct HandshakeRequest {
    /// Protocol version (currently "1")
    pub version: Vec<u8>,
    pub process: ProcessInfo,
    /// Name of the connecting component, e.g. "remotefs-layer"
    pub client_name: Vec<u8>,
    pub client_version: Vec<u8>,
}

/// Process metadata of the intercepted program
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    pub exe_path: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct HandshakeResponse {
    pub version: Vec<u8>,
    pub agent_name: Vec<u8>,
}

/// Open (or create) a file; flags and mode are the caller's raw `open(2)` arguments
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct OpenRequest {
    pub path: Vec<u8>,
    pub flags: u32,
    pub mode: u32,
}

/// Positional read; the agent never tracks a file pointer of its own
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ReadRequest {
    pub handle: u64,
    pub offset: u64,
    pub len: u64,
}

/// Positional write. `offset` is `None` for descriptors opened with `O_APPEND`.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct WriteRequest {
    pub handle: u64,
    pub offset: Option<u64>,
    pub data: Vec<u8>,
}

/// Seek request. `offset` carries the two's-complement bit pattern of the
/// signed `off_t`; use [`SeekRequest::new`] and [`SeekRequest::signed_offset`].
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct SeekRequest {
    pub handle: u64,
    pub whence: u8,
    pub offset: u64,
}

/// Permission check; `mode` is the raw `access(2)` mode mask
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct AccessRequest {
    pub path: Vec<u8>,
    pub mode: u32,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ReadDirRequest {
    pub path: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct CloseRequest {
    pub handle: u64,
}

/// Remote descriptor handle
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct HandleResponse {
    pub handle: u64,
}

/// Bytes read; may be shorter than requested
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct DataResponse {
    pub data: Vec<u8>,
}

/// Bytes accepted plus the absolute file position right after the write
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct WrittenResponse {
    pub written: u64,
    pub position: u64,
}

/// Resulting absolute offset of a seek
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct OffsetResponse {
    pub offset: u64,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct OkResponse {}

/// Directory entries in the agent's own enumeration order
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct EntriesResponse {
    pub entries: Vec<DirEntry>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct DirEntry {
    pub name: Vec<u8>,
    /// See [`FileKind`]
    pub kind: u8,
}

/// POSIX-style failure reported by the agent
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ErrorResponse {
    pub errno: u32,
    pub message: Vec<u8>,
}

/// Seek origin, mirroring `SEEK_SET`/`SEEK_CUR`/`SEEK_END`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

impl Whence {
    pub fn as_u8(self) -> u8 {
        match self {
            Whence::Start => 0,
            Whence::Current => 1,
            Whence::End => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Whence::Start),
            1 => Some(Whence::Current),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// Kind of a directory entry as reported by the agent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl FileKind {
    pub fn as_u8(self) -> u8 {
        match self {
            FileKind::File => 0,
            FileKind::Directory => 1,
            FileKind::Symlink => 2,
            FileKind::Other => 3,
        }
    }
}

impl From<u8> for FileKind {
    fn from(value: u8) -> Self {
        match value {
            0 => FileKind::File,
            1 => FileKind::Directory,
            2 => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }
}

// Constructors for SSZ union variants (convert String to Vec<u8>)
impl Request {
    pub fn handshake(process: ProcessInfo, client_name: &str, client_version: &str) -> Self {
        Self::Handshake(HandshakeRequest {
            version: PROTOCOL_VERSION.to_vec(),
            process,
            client_name: client_name.as_bytes().to_vec(),
            client_version: client_version.as_bytes().to_vec(),
        })
    }

    pub fn open(path: impl Into<Vec<u8>>, flags: u32, mode: u32) -> Self {
        Self::Open(OpenRequest {
            path: path.into(),
            flags,
            mode,
        })
    }

    pub fn read(handle: u64, offset: u64, len: u64) -> Self {
        Self::Read(ReadRequest {
            handle,
            offset,
            len,
        })
    }

    pub fn write(handle: u64, offset: Option<u64>, data: Vec<u8>) -> Self {
        Self::Write(WriteRequest {
            handle,
            offset,
            data,
        })
    }

    pub fn seek(handle: u64, whence: Whence, offset: i64) -> Self {
        Self::Seek(SeekRequest::new(handle, whence, offset))
    }

    pub fn access(path: impl Into<Vec<u8>>, mode: u32) -> Self {
        Self::Access(AccessRequest {
            path: path.into(),
            mode,
        })
    }

    pub fn read_dir(path: impl Into<Vec<u8>>) -> Self {
        Self::ReadDir(ReadDirRequest { path: path.into() })
    }

    pub fn close(handle: u64) -> Self {
        Self::Close(CloseRequest { handle })
    }

    /// Short operation name used in diagnostics.
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Handshake(_) => "handshake",
            Request::Open(_) => "open",
            Request::Read(_) => "read",
            Request::Write(_) => "write",
            Request::Seek(_) => "seek",
            Request::Access(_) => "access",
            Request::ReadDir(_) => "readdir",
            Request::Close(_) => "close",
        }
    }
}

impl SeekRequest {
    pub fn new(handle: u64, whence: Whence, offset: i64) -> Self {
        Self {
            handle,
            whence: whence.as_u8(),
            offset: offset as u64,
        }
    }

    pub fn signed_offset(&self) -> i64 {
        self.offset as i64
    }
}

impl Response {
    pub fn handshake(agent_name: &str) -> Self {
        Self::Handshake(HandshakeResponse {
            version: PROTOCOL_VERSION.to_vec(),
            agent_name: agent_name.as_bytes().to_vec(),
        })
    }

    pub fn handle(handle: u64) -> Self {
        Self::Handle(HandleResponse { handle })
    }

    pub fn data(data: Vec<u8>) -> Self {
        Self::Data(DataResponse { data })
    }

    pub fn written(written: u64, position: u64) -> Self {
        Self::Written(WrittenResponse { written, position })
    }

    pub fn offset(offset: u64) -> Self {
        Self::Offset(OffsetResponse { offset })
    }

    pub fn ok() -> Self {
        Self::Ok(OkResponse {})
    }

    pub fn entries(entries: Vec<DirEntry>) -> Self {
        Self::Entries(EntriesResponse { entries })
    }

    pub fn error(errno: i32, message: impl Into<String>) -> Self {
        Self::Error(ErrorResponse {
            errno: errno as u32,
            message: message.into().into_bytes(),
        })
    }
}

impl DirEntry {
    pub fn new(name: impl Into<Vec<u8>>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind: kind.as_u8(),
        }
    }

    pub fn file_kind(&self) -> FileKind {
        FileKind::from(self.kind)
    }
}

impl ErrorResponse {
    pub fn errno(&self) -> i32 {
        self.errno as i32
    }

    pub fn message_lossy(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }
}
