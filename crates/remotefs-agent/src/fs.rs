// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request handling against a local directory tree.
//!
//! Remote absolute paths are mapped under the service root. Reads and writes
//! are positional: the agent keeps no file offsets, the layer owns them.

use remotefs_proto::{
    validate_request, AccessRequest, CloseRequest, DirEntry, FileKind, HandleResponse,
    OpenRequest, ReadRequest, Request, Response, SeekRequest, Whence, WriteRequest,
};
use std::collections::{HashMap, HashSet};
use std::ffi::{CString, OsStr};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub const AGENT_NAME: &str = "remotefs-agent";

/// Largest read served in one response; keeps frames well under the cap.
pub const MAX_READ_LEN: u64 = 8 * 1024 * 1024;

/// Open flags forwarded verbatim to the local open.
const PASSTHROUGH_FLAGS: i32 = libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_SYNC | libc::O_DSYNC;

struct OpenFile {
    file: File,
    path: PathBuf,
    append: bool,
    /// Serializes end-of-file lookups with the appending write
    append_lock: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn os_error(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

/// errno reported to the layer for a local failure
pub fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(match err.kind() {
        ErrorKind::NotFound => libc::ENOENT,
        ErrorKind::PermissionDenied => libc::EACCES,
        ErrorKind::AlreadyExists => libc::EEXIST,
        ErrorKind::InvalidInput => libc::EINVAL,
        _ => libc::EIO,
    })
}

/// Handles opened over one connection. Whatever the client leaves open is
/// closed by [`FsService::end_session`].
#[derive(Default)]
pub struct Session {
    handles: Mutex<HashSet<u64>>,
}

impl Session {
    pub fn open_handles(&self) -> usize {
        lock(&self.handles).len()
    }
}

/// Filesystem operations served for one agent
pub struct FsService {
    root: PathBuf,
    handles: Mutex<HashMap<u64, Arc<OpenFile>>>,
    next_handle: AtomicU64,
}

impl FsService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn open_handles(&self) -> usize {
        lock(&self.handles).len()
    }

    /// Answer one request. Failures become `Response::Error`.
    pub fn handle(&self, request: Request) -> Response {
        if let Err(err) = validate_request(&request) {
            return Response::error(libc::EINVAL, err.to_string());
        }

        let operation = request.operation();
        let result = match request {
            Request::Handshake(_) => Ok(Response::handshake(AGENT_NAME)),
            Request::Open(open) => self.open(open),
            Request::Read(read) => self.read(read),
            Request::Write(write) => self.write(write),
            Request::Seek(seek) => self.seek(seek),
            Request::Access(access) => self.access(access),
            Request::ReadDir(read_dir) => self.read_dir(&read_dir.path),
            Request::Close(close) => self.close(close),
        };

        result.unwrap_or_else(|err| {
            debug!(operation, %err, "request failed");
            Response::error(errno_of(&err), err.to_string())
        })
    }

    /// Answer `request` on behalf of `session`, recording the handles it
    /// opens and closes.
    pub fn handle_in(&self, session: &Session, request: Request) -> Response {
        let closing = match &request {
            Request::Close(close) => Some(close.handle),
            _ => None,
        };
        let response = self.handle(request);
        match (&response, closing) {
            (Response::Handle(HandleResponse { handle }), _) => {
                lock(&session.handles).insert(*handle);
            }
            (Response::Ok(_), Some(handle)) => {
                lock(&session.handles).remove(&handle);
            }
            _ => {}
        }
        response
    }

    /// Close every handle `session` still holds; returns how many were open.
    pub fn end_session(&self, session: &Session) -> usize {
        let leftover: Vec<u64> = lock(&session.handles).drain().collect();
        let mut handles = lock(&self.handles);
        leftover
            .into_iter()
            .filter(|handle| handles.remove(handle).is_some())
            .count()
    }

    /// Local path for a remote absolute path. `..` never climbs above the root.
    pub fn map_path(&self, remote: &[u8]) -> PathBuf {
        let mut relative = PathBuf::new();
        for component in Path::new(OsStr::from_bytes(remote)).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::ParentDir => {
                    relative.pop();
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        self.root.join(relative)
    }

    fn file(&self, handle: u64) -> io::Result<Arc<OpenFile>> {
        lock(&self.handles)
            .get(&handle)
            .cloned()
            .ok_or_else(|| os_error(libc::EBADF))
    }

    fn open(&self, request: OpenRequest) -> io::Result<Response> {
        let path = self.map_path(&request.path);
        let flags = request.flags as i32;

        let mut options = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => options.write(true),
            libc::O_RDWR => options.read(true).write(true),
            _ => options.read(true),
        };
        if flags & libc::O_CREAT != 0 {
            if flags & libc::O_EXCL != 0 {
                options.create_new(true);
            } else {
                options.create(true);
            }
            options.mode(request.mode);
        }
        if flags & libc::O_TRUNC != 0 {
            options.truncate(true);
        }
        options.custom_flags(flags & PASSTHROUGH_FLAGS);

        let file = options.open(&path)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        debug!(handle, path = %path.display(), flags, "opened");
        lock(&self.handles).insert(
            handle,
            Arc::new(OpenFile {
                file,
                path,
                append: flags & libc::O_APPEND != 0,
                append_lock: Mutex::new(()),
            }),
        );
        Ok(Response::handle(handle))
    }

    fn read(&self, request: ReadRequest) -> io::Result<Response> {
        let open = self.file(request.handle)?;
        let mut buf = vec![0u8; request.len.min(MAX_READ_LEN) as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match open.file.read_at(&mut buf[filled..], request.offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        buf.truncate(filled);
        Ok(Response::data(buf))
    }

    fn write(&self, request: WriteRequest) -> io::Result<Response> {
        let open = self.file(request.handle)?;
        let len = request.data.len() as u64;
        let start = match request.offset {
            Some(offset) if !open.append => offset,
            _ => {
                let _guard = lock(&open.append_lock);
                let end = open.file.metadata()?.len();
                open.file.write_all_at(&request.data, end)?;
                return Ok(Response::written(len, end + len));
            }
        };
        open.file.write_all_at(&request.data, start)?;
        Ok(Response::written(len, start + len))
    }

    fn seek(&self, request: SeekRequest) -> io::Result<Response> {
        let open = self.file(request.handle)?;
        let target = match Whence::from_u8(request.whence) {
            Some(Whence::Start) => request.signed_offset(),
            Some(Whence::End) => {
                let len = open.file.metadata()?.len() as i64;
                len.checked_add(request.signed_offset())
                    .ok_or_else(|| os_error(libc::EOVERFLOW))?
            }
            // Positions live in the layer.
            Some(Whence::Current) | None => return Err(os_error(libc::EINVAL)),
        };
        if target < 0 {
            return Err(os_error(libc::EINVAL));
        }
        debug!(handle = request.handle, path = %open.path.display(), target, "seek");
        Ok(Response::offset(target as u64))
    }

    fn access(&self, request: AccessRequest) -> io::Result<Response> {
        let path = self.map_path(&request.path);
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| os_error(libc::EINVAL))?;
        if unsafe { libc::access(c_path.as_ptr(), request.mode as i32) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Response::ok())
    }

    fn read_dir(&self, remote: &[u8]) -> io::Result<Response> {
        let path = self.map_path(remote);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let kind = match entry.file_type() {
                Ok(kind) if kind.is_file() => FileKind::File,
                Ok(kind) if kind.is_dir() => FileKind::Directory,
                Ok(kind) if kind.is_symlink() => FileKind::Symlink,
                _ => FileKind::Other,
            };
            entries.push(DirEntry::new(entry.file_name().as_bytes(), kind));
        }
        Ok(Response::entries(entries))
    }

    fn close(&self, request: CloseRequest) -> io::Result<Response> {
        match lock(&self.handles).remove(&request.handle) {
            Some(_) => Ok(Response::ok()),
            None => Err(os_error(libc::EBADF)),
        }
    }
}
