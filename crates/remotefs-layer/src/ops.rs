// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Redirection logic behind every hook.
//!
//! Each operation either declines the call ([`Dispatch::Passthrough`]), in
//! which case the hook invokes the next definition of the symbol untouched,
//! or owns it and produces the result the hook reports to the caller.

use crate::dir::{DirStreams, RemoteDir};
use crate::error::LayerError;
use crate::local_fd::LocalFds;
use crate::scope::{normalize, Scope};
use crate::shadow::{lock_entry, Lookup, ShadowEntry, ShadowTable};
use remotefs_client::Transport;
use remotefs_proto::{
    DataResponse, DirEntry, EntriesResponse, HandleResponse, OffsetResponse, Request, Response,
    Whence, WrittenResponse,
};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Outcome of classifying an intercepted call
#[derive(Debug)]
pub enum Dispatch<T> {
    Passthrough,
    Redirected(Result<T, LayerError>),
    /// Local call, but on this absolute path: a relative path climbed out of
    /// a redirected directory whose descriptor means nothing natively.
    Relocated(PathBuf),
}

impl<T> Dispatch<T> {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, Dispatch::Passthrough)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Dispatch<U> {
        match self {
            Dispatch::Passthrough => Dispatch::Passthrough,
            Dispatch::Redirected(result) => Dispatch::Redirected(result.map(f)),
            Dispatch::Relocated(path) => Dispatch::Relocated(path),
        }
    }

    /// The redirected result; panics on passthrough. Test helper.
    #[cfg(test)]
    pub fn redirected(self) -> Result<T, LayerError> {
        match self {
            Dispatch::Redirected(result) => result,
            Dispatch::Passthrough => panic!("call was passed through"),
            Dispatch::Relocated(path) => panic!("call was relocated to {}", path.display()),
        }
    }
}

/// Where a possibly relative path argument points
enum Target {
    Remote(PathBuf),
    Local(PathBuf),
    Native,
}

fn unexpected(operation: &str, response: Response) -> LayerError {
    warn!(operation, ?response, "agent answered with an unexpected response");
    LayerError::Protocol(format!("unexpected response to {operation}"))
}

/// Largest payload moved by one read or write request; larger calls are
/// served short, which POSIX allows.
pub const MAX_IO_CHUNK: usize = 8 * 1024 * 1024;

fn path_bytes(path: &Path) -> Vec<u8> {
    path.as_os_str().as_bytes().to_vec()
}

/// Process-wide redirection state
pub struct Layer {
    scope: Scope,
    transport: Box<dyn Transport>,
    table: ShadowTable,
    dirs: DirStreams,
    local_fds: Box<dyn LocalFds>,
}

impl Layer {
    pub fn new(scope: Scope, transport: Box<dyn Transport>, local_fds: Box<dyn LocalFds>) -> Self {
        Self {
            scope,
            transport,
            table: ShadowTable::new(),
            dirs: DirStreams::default(),
            local_fds,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn shadow_table(&self) -> &ShadowTable {
        &self.table
    }

    pub fn shutdown(&self) {
        self.transport.shutdown();
    }

    fn call(&self, request: Request) -> Result<Response, LayerError> {
        match self.transport.send(request)? {
            Response::Error(err) => Err(LayerError::remote(err.errno(), err.message_lossy())),
            response => Ok(response),
        }
    }

    /// Classify `path` relative to `dirfd`. Relative paths under a redirected
    /// directory that leave the scope become absolute local paths.
    fn resolve_at(&self, dirfd: RawFd, path: &Path) -> Result<Target, LayerError> {
        if path.is_absolute() {
            return Ok(self.scope.resolve(path).map_or(Target::Native, Target::Remote));
        }
        if dirfd == libc::AT_FDCWD {
            return Ok(Target::Native);
        }
        match self.table.lookup(dirfd) {
            Lookup::Active(entry) => {
                let joined = lock_entry(&entry).path.join(path);
                Ok(match self.scope.resolve(&joined) {
                    Some(remote) => Target::Remote(remote),
                    None => normalize(&joined).map_or(Target::Native, Target::Local),
                })
            }
            Lookup::Evicted => Err(LayerError::Evicted),
            Lookup::Missing => Ok(Target::Native),
        }
    }

    /// Run `op` on the entry for `local_id` with its lock held across the
    /// round trip. A transport failure turns the entry into a tombstone.
    fn with_entry<T>(
        &self,
        local_id: RawFd,
        op: impl FnOnce(&mut ShadowEntry) -> Result<T, LayerError>,
    ) -> Dispatch<T> {
        let entry = match self.table.lookup(local_id) {
            Lookup::Missing => return Dispatch::Passthrough,
            Lookup::Evicted => return Dispatch::Redirected(Err(LayerError::Evicted)),
            Lookup::Active(entry) => entry,
        };

        let mut guard = lock_entry(&entry);
        let result = op(&mut guard);
        if let Err(err) = &result {
            if err.is_transport() && self.table.evict(&entry, local_id) {
                warn!(local_id, %err, "evicted descriptor after transport failure");
            }
        }
        drop(guard);
        Dispatch::Redirected(result)
    }

    pub fn open(&self, path: &Path, flags: i32, mode: u32) -> Dispatch<RawFd> {
        self.openat(libc::AT_FDCWD, path, flags, mode)
    }

    pub fn openat(&self, dirfd: RawFd, path: &Path, flags: i32, mode: u32) -> Dispatch<RawFd> {
        match self.resolve_at(dirfd, path) {
            Ok(Target::Remote(resolved)) => {
                Dispatch::Redirected(self.open_remote(resolved, flags, mode))
            }
            Ok(Target::Local(local)) => Dispatch::Relocated(local),
            Ok(Target::Native) => Dispatch::Passthrough,
            Err(err) => Dispatch::Redirected(Err(err)),
        }
    }

    fn open_remote(&self, path: PathBuf, flags: i32, mode: u32) -> Result<RawFd, LayerError> {
        let remote_id = match self.call(Request::open(path_bytes(&path), flags as u32, mode))? {
            Response::Handle(HandleResponse { handle }) => handle,
            other => return Err(unexpected("open", other)),
        };

        let local_id = match self.local_fds.allocate() {
            Ok(fd) => fd,
            Err(err) => {
                self.close_remote(remote_id);
                return Err(LayerError::remote(
                    err.raw_os_error().unwrap_or(libc::EMFILE),
                    format!("failed to allocate placeholder descriptor: {err}"),
                ));
            }
        };

        debug!(local_id, remote_id, path = %path.display(), "opened remote file");
        self.table.insert(ShadowEntry::new(local_id, remote_id, path, flags));
        Ok(local_id)
    }

    fn close_remote(&self, remote_id: u64) {
        match self.call(Request::close(remote_id)) {
            Ok(Response::Ok(_)) => {}
            Ok(other) => {
                unexpected("close", other);
            }
            Err(err) => debug!(remote_id, %err, "remote close failed"),
        }
    }

    pub fn read(&self, local_id: RawFd, buf: &mut [u8]) -> Dispatch<usize> {
        self.with_entry(local_id, |entry| {
            if buf.is_empty() {
                return Ok(0);
            }
            let len = buf.len().min(MAX_IO_CHUNK);
            let buf = &mut buf[..len];
            let request = Request::read(entry.remote_id, entry.offset, buf.len() as u64);
            let data = match self.call(request)? {
                Response::Data(DataResponse { data }) => data,
                other => return Err(unexpected("read", other)),
            };
            if data.len() > buf.len() {
                return Err(LayerError::Protocol(format!(
                    "agent returned {} bytes for a {} byte read",
                    data.len(),
                    buf.len()
                )));
            }
            buf[..data.len()].copy_from_slice(&data);
            entry.offset += data.len() as u64;
            Ok(data.len())
        })
    }

    pub fn write(&self, local_id: RawFd, buf: &[u8]) -> Dispatch<usize> {
        self.with_entry(local_id, |entry| {
            if buf.is_empty() {
                return Ok(0);
            }
            let buf = &buf[..buf.len().min(MAX_IO_CHUNK)];
            let start = (!entry.is_append()).then_some(entry.offset);
            let request = Request::write(entry.remote_id, start, buf.to_vec());
            let (written, position) = match self.call(request)? {
                Response::Written(WrittenResponse { written, position }) => (written, position),
                other => return Err(unexpected("write", other)),
            };
            if written > buf.len() as u64 {
                return Err(LayerError::Protocol(format!(
                    "agent accepted {written} bytes of a {} byte write",
                    buf.len()
                )));
            }
            entry.offset = match start {
                Some(start) => start + written,
                None => position,
            };
            Ok(written as usize)
        })
    }

    pub fn lseek(&self, local_id: RawFd, offset: i64, whence: i32) -> Dispatch<u64> {
        self.with_entry(local_id, |entry| {
            let target = match whence {
                libc::SEEK_SET => offset,
                libc::SEEK_CUR if offset == 0 => return Ok(entry.offset),
                libc::SEEK_CUR => (entry.offset as i64)
                    .checked_add(offset)
                    .ok_or(LayerError::InvalidArgument("seek offset out of range"))?,
                libc::SEEK_END => {
                    let request = Request::seek(entry.remote_id, Whence::End, offset);
                    return match self.call(request)? {
                        Response::Offset(OffsetResponse { offset }) => {
                            entry.offset = offset;
                            Ok(offset)
                        }
                        other => Err(unexpected("seek", other)),
                    };
                }
                _ => return Err(LayerError::InvalidArgument("unknown seek origin")),
            };
            if target < 0 {
                return Err(LayerError::InvalidArgument("resulting offset is negative"));
            }
            entry.offset = target as u64;
            Ok(entry.offset)
        })
    }

    pub fn access(&self, path: &Path, mode: i32) -> Dispatch<()> {
        self.faccessat(libc::AT_FDCWD, path, mode, 0)
    }

    /// `flags` (`AT_EACCESS`, `AT_SYMLINK_NOFOLLOW`) are left to the agent's
    /// own credentials and are not forwarded.
    pub fn faccessat(&self, dirfd: RawFd, path: &Path, mode: i32, _flags: i32) -> Dispatch<()> {
        let resolved = match self.resolve_at(dirfd, path) {
            Ok(Target::Remote(resolved)) => resolved,
            Ok(Target::Local(local)) => return Dispatch::Relocated(local),
            Ok(Target::Native) => return Dispatch::Passthrough,
            Err(err) => return Dispatch::Redirected(Err(err)),
        };
        let result = self
            .call(Request::access(path_bytes(&resolved), mode as u32))
            .and_then(|response| match response {
                Response::Ok(_) => Ok(()),
                other => Err(unexpected("access", other)),
            });
        Dispatch::Redirected(result)
    }

    fn list(&self, path: &Path) -> Result<Vec<DirEntry>, LayerError> {
        match self.call(Request::read_dir(path_bytes(path)))? {
            Response::Entries(EntriesResponse { entries }) => Ok(entries),
            other => Err(unexpected("readdir", other)),
        }
    }

    /// Entries of an in-scope directory in the order the agent produced them.
    pub fn read_dir(&self, path: &Path) -> Dispatch<Vec<DirEntry>> {
        match self.scope.resolve(path) {
            Some(resolved) => Dispatch::Redirected(self.list(&resolved)),
            None => Dispatch::Passthrough,
        }
    }

    pub fn opendir(&self, path: &Path) -> Dispatch<*mut libc::DIR> {
        self.read_dir(path)
            .map(|entries| self.dirs.register(RemoteDir::new(entries, None)))
    }

    /// Directory stream over a redirected descriptor; the stream owns it.
    pub fn fdopendir(&self, local_id: RawFd) -> Dispatch<*mut libc::DIR> {
        self.with_entry(local_id, |entry| self.list(&entry.path))
            .map(|entries| self.dirs.register(RemoteDir::new(entries, Some(local_id))))
    }

    pub fn readdir(&self, dirp: *mut libc::DIR) -> Dispatch<*mut libc::dirent> {
        match self.dirs.with_stream(dirp, |dir| dir.next_dirent()) {
            Some(dirent) => Dispatch::Redirected(Ok(dirent)),
            None => Dispatch::Passthrough,
        }
    }

    pub fn readdir64(&self, dirp: *mut libc::DIR) -> Dispatch<*mut libc::dirent64> {
        match self.dirs.with_stream(dirp, |dir| dir.next_dirent64()) {
            Some(dirent) => Dispatch::Redirected(Ok(dirent)),
            None => Dispatch::Passthrough,
        }
    }

    /// Fill `entry` with the next remote entry; `false` at the end.
    pub fn readdir_r(&self, dirp: *mut libc::DIR, entry: &mut libc::dirent) -> Dispatch<bool> {
        match self.dirs.with_stream(dirp, |dir| dir.next_into(entry)) {
            Some(filled) => Dispatch::Redirected(Ok(filled)),
            None => Dispatch::Passthrough,
        }
    }

    pub fn readdir64_r(
        &self,
        dirp: *mut libc::DIR,
        entry: &mut libc::dirent64,
    ) -> Dispatch<bool> {
        match self.dirs.with_stream(dirp, |dir| dir.next_into64(entry)) {
            Some(filled) => Dispatch::Redirected(Ok(filled)),
            None => Dispatch::Passthrough,
        }
    }

    pub fn rewinddir(&self, dirp: *mut libc::DIR) -> Dispatch<()> {
        match self.dirs.with_stream(dirp, |dir| dir.rewind()) {
            Some(()) => Dispatch::Redirected(Ok(())),
            None => Dispatch::Passthrough,
        }
    }

    /// Descriptor behind a remote stream; only `fdopendir` streams have one.
    pub fn dirfd(&self, dirp: *mut libc::DIR) -> Dispatch<RawFd> {
        match self.dirs.with_stream(dirp, |dir| dir.owned_fd()) {
            Some(Some(fd)) => Dispatch::Redirected(Ok(fd)),
            Some(None) => Dispatch::Redirected(Err(LayerError::remote(
                libc::ENOTSUP,
                "remote directory stream has no descriptor",
            ))),
            None => Dispatch::Passthrough,
        }
    }

    pub fn closedir(&self, dirp: *mut libc::DIR) -> Dispatch<()> {
        let Some(dir) = self.dirs.remove(dirp) else {
            return Dispatch::Passthrough;
        };
        match dir.owned_fd().map(|fd| self.close(fd)) {
            Some(Dispatch::Redirected(result)) => Dispatch::Redirected(result),
            _ => Dispatch::Redirected(Ok(())),
        }
    }

    pub fn close(&self, local_id: RawFd) -> Dispatch<()> {
        match self.table.remove(local_id) {
            Lookup::Missing => Dispatch::Passthrough,
            Lookup::Evicted => {
                self.local_fds.release(local_id);
                Dispatch::Redirected(Ok(()))
            }
            Lookup::Active(entry) => {
                self.close_remote(entry.remote_id);
                self.local_fds.release(local_id);
                debug!(local_id, remote_id = entry.remote_id, "closed remote file");
                Dispatch::Redirected(Ok(()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remotefs_client::ClientError;
    use remotefs_proto::FileKind;
    use std::collections::HashMap;
    use std::ffi::CStr;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    const SHORT_TEXT: &[u8] = b"Pineapples.";

    const LOREM: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod \
tempor incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud \
exercitation ullamco laboris nisi ut aliquip ex ea commodo consequat. Duis aute irure dolor in \
reprehenderit in voluptate velit esse cillum dolore eu fugiat nulla pariatur. Excepteur sint \
occaecat cupidatat non proident, sunt in culpa qui officia deserunt mollit anim id est laborum.";

    fn long_text() -> Vec<u8> {
        LOREM.repeat(20).into_bytes()
    }

    #[derive(Default)]
    struct AgentState {
        files: HashMap<PathBuf, Vec<u8>>,
        dirs: HashMap<PathBuf, Vec<DirEntry>>,
        handles: HashMap<u64, PathBuf>,
        next_handle: u64,
        log: Vec<&'static str>,
        /// Most bytes accepted by one write
        write_limit: Option<usize>,
    }

    /// In-memory agent answering requests synchronously
    #[derive(Default)]
    struct MemoryAgent {
        state: Mutex<AgentState>,
        broken: AtomicBool,
    }

    impl MemoryAgent {
        fn with_file(self, path: &str, contents: &[u8]) -> Self {
            self.state
                .lock()
                .unwrap()
                .files
                .insert(PathBuf::from(path), contents.to_vec());
            self
        }

        fn with_dir(self, path: &str, entries: Vec<DirEntry>) -> Self {
            self.state
                .lock()
                .unwrap()
                .dirs
                .insert(PathBuf::from(path), entries);
            self
        }

        fn with_write_limit(self, limit: usize) -> Self {
            self.state.lock().unwrap().write_limit = Some(limit);
            self
        }

        fn requests(&self) -> Vec<&'static str> {
            self.state.lock().unwrap().log.clone()
        }

        fn file(&self, path: &str) -> Option<Vec<u8>> {
            self.state.lock().unwrap().files.get(Path::new(path)).cloned()
        }

        fn open_handles(&self) -> usize {
            self.state.lock().unwrap().handles.len()
        }

        fn answer(state: &mut AgentState, request: Request) -> Response {
            let path_of = |bytes: &[u8]| PathBuf::from(std::ffi::OsStr::from_bytes(bytes));
            match request {
                Request::Handshake(_) => Response::handshake("memory-agent"),
                Request::Open(open) => {
                    let path = path_of(&open.path);
                    let flags = open.flags as i32;
                    if !state.files.contains_key(&path) && !state.dirs.contains_key(&path) {
                        if flags & libc::O_CREAT == 0 {
                            return Response::error(libc::ENOENT, "no such file");
                        }
                        state.files.insert(path.clone(), Vec::new());
                    }
                    if flags & libc::O_TRUNC != 0 {
                        if let Some(contents) = state.files.get_mut(&path) {
                            contents.clear();
                        }
                    }
                    state.next_handle += 1;
                    let handle = state.next_handle;
                    state.handles.insert(handle, path);
                    Response::handle(handle)
                }
                Request::Read(read) => {
                    let Some(path) = state.handles.get(&read.handle) else {
                        return Response::error(libc::EBADF, "bad handle");
                    };
                    let contents = &state.files[path];
                    let start = (read.offset as usize).min(contents.len());
                    let end = (start + read.len as usize).min(contents.len());
                    Response::data(contents[start..end].to_vec())
                }
                Request::Write(write) => {
                    let Some(path) = state.handles.get(&write.handle).cloned() else {
                        return Response::error(libc::EBADF, "bad handle");
                    };
                    let accepted = write.data.len().min(state.write_limit.unwrap_or(usize::MAX));
                    let data = &write.data[..accepted];
                    let contents = state.files.get_mut(&path).unwrap();
                    let start = write.offset.map_or(contents.len(), |o| o as usize);
                    let end = start + data.len();
                    if contents.len() < end {
                        contents.resize(end, 0);
                    }
                    contents[start..end].copy_from_slice(data);
                    Response::written(data.len() as u64, end as u64)
                }
                Request::Seek(seek) => {
                    let Some(path) = state.handles.get(&seek.handle) else {
                        return Response::error(libc::EBADF, "bad handle");
                    };
                    let len = state.files[path].len() as i64;
                    let target = len + seek.signed_offset();
                    if target < 0 {
                        return Response::error(libc::EINVAL, "negative offset");
                    }
                    Response::offset(target as u64)
                }
                Request::Access(access) => {
                    let path = path_of(&access.path);
                    if state.files.contains_key(&path) || state.dirs.contains_key(&path) {
                        Response::ok()
                    } else {
                        Response::error(libc::ENOENT, "no such file")
                    }
                }
                Request::ReadDir(read_dir) => match state.dirs.get(&path_of(&read_dir.path)) {
                    Some(entries) => Response::entries(entries.clone()),
                    None => Response::error(libc::ENOTDIR, "not a directory"),
                },
                Request::Close(close) => match state.handles.remove(&close.handle) {
                    Some(_) => Response::ok(),
                    None => Response::error(libc::EBADF, "bad handle"),
                },
            }
        }
    }

    impl Transport for MemoryAgent {
        fn send(&self, request: Request) -> Result<Response, ClientError> {
            let mut state = self.state.lock().unwrap();
            state.log.push(request.operation());
            if self.broken.load(Ordering::SeqCst) {
                return Err(ClientError::Transport("connection reset".into()));
            }
            Ok(Self::answer(&mut state, request))
        }
    }

    /// Hands out increasing descriptor numbers and records releases
    #[derive(Default)]
    struct CountingFds {
        next: AtomicI32,
        released: Mutex<Vec<RawFd>>,
    }

    impl LocalFds for CountingFds {
        fn allocate(&self) -> io::Result<RawFd> {
            Ok(1000 + self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn release(&self, fd: RawFd) {
            self.released.lock().unwrap().push(fd);
        }
    }

    fn layer_with(agent: MemoryAgent) -> (Layer, Arc<MemoryAgent>, Arc<CountingFds>) {
        let agent = Arc::new(agent);
        let fds = Arc::new(CountingFds::default());
        let layer = Layer::new(
            Scope::parse("/app"),
            Box::new(Arc::clone(&agent)),
            Box::new(SharedFds(Arc::clone(&fds))),
        );
        (layer, agent, fds)
    }

    struct SharedFds(Arc<CountingFds>);

    impl LocalFds for SharedFds {
        fn allocate(&self) -> io::Result<RawFd> {
            self.0.allocate()
        }

        fn release(&self, fd: RawFd) {
            self.0.release(fd)
        }
    }

    fn read_all(layer: &Layer, fd: RawFd, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = layer.read(fd, &mut buf).redirected().unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    fn round_trip(contents: &[u8]) {
        let (layer, agent, _) = layer_with(MemoryAgent::default());
        let path = Path::new("/app/out.txt");

        let fd = layer
            .open(path, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, 0o644)
            .redirected()
            .unwrap();
        let mut written = 0;
        while written < contents.len() {
            written += layer.write(fd, &contents[written..]).redirected().unwrap();
        }
        layer.close(fd).redirected().unwrap();
        assert_eq!(agent.file("/app/out.txt").unwrap(), contents);

        let fd = layer.open(path, libc::O_RDONLY, 0).redirected().unwrap();
        assert_eq!(read_all(&layer, fd, 512), contents);
        layer.close(fd).redirected().unwrap();
        assert_eq!(agent.open_handles(), 0);
        assert!(layer.shadow_table().is_empty());
    }

    #[test]
    fn write_then_read_back_round_trips() {
        round_trip(SHORT_TEXT);
        round_trip(&long_text());
        round_trip(b"");
    }

    #[test]
    fn position_query_is_local_and_next_read_continues() {
        let text = long_text();
        let (layer, agent, _) = layer_with(MemoryAgent::default().with_file("/app/test.txt", &text));
        let fd = layer
            .open(Path::new("/app/test.txt"), libc::O_RDONLY, 0)
            .redirected()
            .unwrap();

        let mut buf = [0u8; 10];
        assert_eq!(layer.read(fd, &mut buf).redirected().unwrap(), 10);
        let before = agent.requests().len();
        assert_eq!(layer.lseek(fd, 0, libc::SEEK_CUR).redirected().unwrap(), 10);
        assert_eq!(agent.requests().len(), before);

        assert_eq!(layer.read(fd, &mut buf).redirected().unwrap(), 10);
        assert_eq!(&buf, &text[10..20]);
    }

    #[test]
    fn short_reads_are_success() {
        let (layer, _, _) =
            layer_with(MemoryAgent::default().with_file("/app/test.txt", SHORT_TEXT));
        let fd = layer
            .open(Path::new("/app/test.txt"), libc::O_RDONLY, 0)
            .redirected()
            .unwrap();

        let mut buf = [0u8; 100];
        assert_eq!(layer.read(fd, &mut buf).redirected().unwrap(), SHORT_TEXT.len());
        assert_eq!(&buf[..SHORT_TEXT.len()], SHORT_TEXT);
        assert_eq!(layer.read(fd, &mut buf).redirected().unwrap(), 0);
        assert_eq!(layer.lseek(fd, 0, libc::SEEK_CUR).redirected().unwrap(), 11);
    }

    #[test]
    fn out_of_scope_calls_pass_through_without_round_trip() {
        let (layer, agent, _) = layer_with(MemoryAgent::default());

        assert!(layer.open(Path::new("/etc/hosts"), libc::O_RDONLY, 0).is_passthrough());
        assert!(layer.open(Path::new("/apple/x"), libc::O_RDONLY, 0).is_passthrough());
        assert!(layer.open(Path::new("app/test.txt"), libc::O_RDONLY, 0).is_passthrough());
        assert!(layer.access(Path::new("/tmp"), libc::F_OK).is_passthrough());
        assert!(layer.read_dir(Path::new("/usr")).is_passthrough());

        let mut buf = [0u8; 4];
        assert!(layer.read(3, &mut buf).is_passthrough());
        assert!(layer.write(1, b"hi").is_passthrough());
        assert!(layer.lseek(0, 0, libc::SEEK_CUR).is_passthrough());
        assert!(layer.close(3).is_passthrough());

        assert!(agent.requests().is_empty());
    }

    #[test]
    fn directory_order_is_preserved() {
        let listing = vec![
            DirEntry::new("test.txt", FileKind::File),
            DirEntry::new("app.py", FileKind::File),
        ];
        let (layer, _, _) = layer_with(MemoryAgent::default().with_dir("/app", listing));

        let entries = layer.read_dir(Path::new("/app/")).redirected().unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names, vec![&b"test.txt"[..], &b"app.py"[..]]);

        let dirp = layer.opendir(Path::new("/app")).redirected().unwrap();
        let mut seen = Vec::new();
        loop {
            let dirent = layer.readdir64(dirp).redirected().unwrap();
            if dirent.is_null() {
                break;
            }
            let name = unsafe { CStr::from_ptr((*dirent).d_name.as_ptr()) };
            seen.push(name.to_string_lossy().into_owned());
        }
        assert_eq!(seen, vec!["test.txt", "app.py"]);
        assert_eq!(
            layer.dirfd(dirp).redirected().unwrap_err().errno(),
            libc::ENOTSUP
        );
        layer.closedir(dirp).redirected().unwrap();
        assert!(layer.readdir(dirp).is_passthrough());
    }

    #[test]
    fn reentrant_readdir_fills_caller_buffer() {
        let listing = vec![
            DirEntry::new("test.txt", FileKind::File),
            DirEntry::new("app.py", FileKind::File),
        ];
        let (layer, _, _) = layer_with(MemoryAgent::default().with_dir("/app", listing));
        let dirp = layer.opendir(Path::new("/app")).redirected().unwrap();

        let mut entry: libc::dirent64 = unsafe { std::mem::zeroed() };
        let mut seen = Vec::new();
        while layer.readdir64_r(dirp, &mut entry).redirected().unwrap() {
            let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) };
            seen.push(name.to_string_lossy().into_owned());
        }
        assert_eq!(seen, vec!["test.txt", "app.py"]);

        layer.rewinddir(dirp).redirected().unwrap();
        let mut short: libc::dirent = unsafe { std::mem::zeroed() };
        assert!(layer.readdir_r(dirp, &mut short).redirected().unwrap());
        let name = unsafe { CStr::from_ptr(short.d_name.as_ptr()) };
        assert_eq!(name.to_bytes(), b"test.txt");

        layer.closedir(dirp).redirected().unwrap();
        assert!(layer.readdir_r(dirp, &mut short).is_passthrough());
    }

    #[test]
    fn access_reports_remote_permission() {
        let (layer, _, _) =
            layer_with(MemoryAgent::default().with_file("/app/test.txt", SHORT_TEXT));

        for mode in [libc::F_OK, libc::R_OK, libc::R_OK | libc::W_OK] {
            layer
                .access(Path::new("/app/test.txt"), mode)
                .redirected()
                .unwrap();
        }
        let err = layer
            .access(Path::new("/app/missing.txt"), libc::F_OK)
            .redirected()
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn open_of_missing_file_reports_remote_errno() {
        let (layer, _, fds) = layer_with(MemoryAgent::default());
        let err = layer
            .open(Path::new("/app/nope"), libc::O_RDONLY, 0)
            .redirected()
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert_eq!(fds.next.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn transport_failure_evicts_descriptor() {
        let (layer, agent, fds) =
            layer_with(MemoryAgent::default().with_file("/app/test.txt", SHORT_TEXT));
        let fd = layer
            .open(Path::new("/app/test.txt"), libc::O_RDONLY, 0)
            .redirected()
            .unwrap();

        agent.broken.store(true, Ordering::SeqCst);
        let mut buf = [0u8; 4];
        let err = layer.read(fd, &mut buf).redirected().unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
        assert!(matches!(layer.shadow_table().lookup(fd), Lookup::Evicted));

        agent.broken.store(false, Ordering::SeqCst);
        let sent = agent.requests().len();
        let err = layer.read(fd, &mut buf).redirected().unwrap_err();
        assert_eq!(err, LayerError::Evicted);
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(
            layer.lseek(fd, 0, libc::SEEK_CUR).redirected().unwrap_err(),
            LayerError::Evicted
        );
        assert_eq!(agent.requests().len(), sent);

        layer.close(fd).redirected().unwrap();
        assert_eq!(fds.released.lock().unwrap().as_slice(), &[fd]);
        assert!(layer.read(fd, &mut buf).is_passthrough());
    }

    #[test]
    fn path_operations_fail_with_eio_on_transport_failure() {
        let (layer, agent, _) = layer_with(MemoryAgent::default());
        agent.broken.store(true, Ordering::SeqCst);

        let err = layer
            .open(Path::new("/app/test.txt"), libc::O_RDONLY, 0)
            .redirected()
            .unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
        let err = layer.access(Path::new("/app"), libc::F_OK).redirected().unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
        assert!(layer.shadow_table().is_empty());
    }

    #[test]
    fn seek_end_asks_the_agent() {
        let (layer, agent, _) =
            layer_with(MemoryAgent::default().with_file("/app/test.txt", SHORT_TEXT));
        let fd = layer
            .open(Path::new("/app/test.txt"), libc::O_RDONLY, 0)
            .redirected()
            .unwrap();

        assert_eq!(layer.lseek(fd, -3, libc::SEEK_END).redirected().unwrap(), 8);
        assert!(agent.requests().contains(&"seek"));

        let mut buf = [0u8; 8];
        let n = layer.read(fd, &mut buf).redirected().unwrap();
        assert_eq!(&buf[..n], b"es.");
    }

    #[test]
    fn invalid_seeks_leave_offset_unchanged() {
        let (layer, _, _) =
            layer_with(MemoryAgent::default().with_file("/app/test.txt", SHORT_TEXT));
        let fd = layer
            .open(Path::new("/app/test.txt"), libc::O_RDONLY, 0)
            .redirected()
            .unwrap();
        assert_eq!(layer.lseek(fd, 4, libc::SEEK_SET).redirected().unwrap(), 4);

        for (offset, whence) in [
            (-1, libc::SEEK_SET),
            (-5, libc::SEEK_CUR),
            (-100, libc::SEEK_END),
            (0, 42),
        ] {
            let err = layer.lseek(fd, offset, whence).redirected().unwrap_err();
            assert_eq!(err.errno(), libc::EINVAL);
        }
        assert_eq!(layer.lseek(fd, 0, libc::SEEK_CUR).redirected().unwrap(), 4);
        assert_eq!(layer.lseek(fd, 2, libc::SEEK_CUR).redirected().unwrap(), 6);
    }

    #[test]
    fn append_writes_follow_remote_end_of_file() {
        let (layer, agent, _) =
            layer_with(MemoryAgent::default().with_file("/app/log.txt", b"abc"));
        let fd = layer
            .open(Path::new("/app/log.txt"), libc::O_WRONLY | libc::O_APPEND, 0)
            .redirected()
            .unwrap();

        assert_eq!(layer.write(fd, b"def").redirected().unwrap(), 3);
        assert_eq!(layer.lseek(fd, 0, libc::SEEK_CUR).redirected().unwrap(), 6);
        assert_eq!(agent.file("/app/log.txt").unwrap(), b"abcdef");
    }

    #[test]
    fn short_writes_advance_by_accepted_bytes() {
        let (layer, agent, _) = layer_with(
            MemoryAgent::default()
                .with_file("/app/data.bin", b"0123456789")
                .with_write_limit(2),
        );
        let fd = layer
            .open(Path::new("/app/data.bin"), libc::O_WRONLY, 0)
            .redirected()
            .unwrap();
        assert_eq!(layer.lseek(fd, 4, libc::SEEK_SET).redirected().unwrap(), 4);

        assert_eq!(layer.write(fd, b"abcde").redirected().unwrap(), 2);
        assert_eq!(layer.lseek(fd, 0, libc::SEEK_CUR).redirected().unwrap(), 6);

        assert_eq!(layer.write(fd, b"cde").redirected().unwrap(), 2);
        assert_eq!(layer.lseek(fd, 0, libc::SEEK_CUR).redirected().unwrap(), 8);
        assert_eq!(agent.file("/app/data.bin").unwrap(), b"0123abcd89");
    }

    #[test]
    fn openat_resolves_relative_to_redirected_directory() {
        let (layer, agent, _) = layer_with(
            MemoryAgent::default()
                .with_dir("/app", vec![DirEntry::new("test.txt", FileKind::File)])
                .with_file("/app/test.txt", SHORT_TEXT),
        );
        let dirfd = layer
            .open(Path::new("/app"), libc::O_RDONLY | libc::O_DIRECTORY, 0)
            .redirected()
            .unwrap();

        let fd = layer
            .openat(dirfd, Path::new("test.txt"), libc::O_RDONLY, 0)
            .redirected()
            .unwrap();
        assert_eq!(read_all(&layer, fd, 4), SHORT_TEXT);

        let before = agent.requests().len();
        assert!(layer
            .openat(libc::AT_FDCWD, Path::new("test.txt"), libc::O_RDONLY, 0)
            .is_passthrough());
        match layer.openat(dirfd, Path::new("../etc/passwd"), libc::O_RDONLY, 0) {
            Dispatch::Relocated(local) => assert_eq!(local, Path::new("/etc/passwd")),
            other => panic!("expected a local absolute path, got {other:?}"),
        }
        match layer.faccessat(dirfd, Path::new("./../tmp"), libc::F_OK, 0) {
            Dispatch::Relocated(local) => assert_eq!(local, Path::new("/tmp")),
            other => panic!("expected a local absolute path, got {other:?}"),
        }
        assert_eq!(agent.requests().len(), before);

        layer
            .faccessat(dirfd, Path::new("test.txt"), libc::R_OK, 0)
            .redirected()
            .unwrap();
    }

    #[test]
    fn fdopendir_stream_owns_descriptor() {
        let (layer, agent, fds) = layer_with(MemoryAgent::default().with_dir(
            "/app",
            vec![
                DirEntry::new("test.txt", FileKind::File),
                DirEntry::new("app.py", FileKind::File),
            ],
        ));
        let dirfd = layer
            .open(Path::new("/app"), libc::O_RDONLY | libc::O_DIRECTORY, 0)
            .redirected()
            .unwrap();
        let dirp = layer.fdopendir(dirfd).redirected().unwrap();
        assert_eq!(layer.dirfd(dirp).redirected().unwrap(), dirfd);

        let first = layer.readdir(dirp).redirected().unwrap();
        let name = unsafe { CStr::from_ptr((*first).d_name.as_ptr()) };
        assert_eq!(name.to_bytes(), b"test.txt");

        layer.rewinddir(dirp).redirected().unwrap();
        let again = layer.readdir(dirp).redirected().unwrap();
        let name = unsafe { CStr::from_ptr((*again).d_name.as_ptr()) };
        assert_eq!(name.to_bytes(), b"test.txt");

        layer.closedir(dirp).redirected().unwrap();
        assert!(!layer.shadow_table().contains(dirfd));
        assert_eq!(fds.released.lock().unwrap().as_slice(), &[dirfd]);
        assert_eq!(agent.open_handles(), 0);
    }

    #[test]
    fn concurrent_reads_on_one_descriptor_serialize() {
        let text = long_text();
        let (layer, _, _) = layer_with(MemoryAgent::default().with_file("/app/test.txt", &text));
        let layer = Arc::new(layer);
        let fd = layer
            .open(Path::new("/app/test.txt"), libc::O_RDONLY, 0)
            .redirected()
            .unwrap();

        let chunk = 64;
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let layer = Arc::clone(&layer);
                thread::spawn(move || {
                    let mut buf = vec![0u8; chunk];
                    let n = layer.read(fd, &mut buf).redirected().unwrap();
                    buf.truncate(n);
                    buf
                })
            })
            .collect();

        let mut chunks: Vec<Vec<u8>> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        chunks.sort_by_key(|c| text.windows(chunk).position(|w| w == c.as_slice()));
        assert_eq!(chunks.concat(), &text[..4 * chunk]);
        assert_eq!(
            layer.lseek(fd, 0, libc::SEEK_CUR).redirected().unwrap(),
            4 * chunk as u64
        );
    }

    #[test]
    fn close_sends_remote_close_and_releases_placeholder() {
        let (layer, agent, fds) =
            layer_with(MemoryAgent::default().with_file("/app/test.txt", SHORT_TEXT));
        let fd = layer
            .open(Path::new("/app/test.txt"), libc::O_RDONLY, 0)
            .redirected()
            .unwrap();
        assert_eq!(agent.open_handles(), 1);

        layer.close(fd).redirected().unwrap();
        assert_eq!(agent.open_handles(), 0);
        assert_eq!(agent.requests().last(), Some(&"close"));
        assert_eq!(fds.released.lock().unwrap().as_slice(), &[fd]);
        assert!(layer.close(fd).is_passthrough());
    }
}
