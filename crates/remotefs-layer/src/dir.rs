// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory streams backed by a remote listing.

use remotefs_proto::{DirEntry, FileKind};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Longest name that fits `d_name` together with its terminator.
const MAX_NAME_LEN: usize = 255;

fn d_type(kind: FileKind) -> u8 {
    match kind {
        FileKind::File => libc::DT_REG,
        FileKind::Directory => libc::DT_DIR,
        FileKind::Symlink => libc::DT_LNK,
        FileKind::Other => libc::DT_UNKNOWN,
    }
}

// `dirent` and `dirent64` share field names but not types on every target.
macro_rules! fill_dirent {
    ($dirent:expr, $index:expr, $entry:expr) => {{
        let dirent = &mut $dirent;
        dirent.d_ino = ($index + 1) as _;
        dirent.d_off = ($index + 1) as _;
        dirent.d_reclen = std::mem::size_of_val(&*dirent) as u16;
        dirent.d_type = d_type($entry.file_kind());
        dirent.d_name.fill(0);
        for (dst, src) in dirent.d_name.iter_mut().zip($entry.name.iter()) {
            *dst = *src as libc::c_char;
        }
    }};
}

/// An open directory stream over entries received from the agent
pub struct RemoteDir {
    entries: Vec<DirEntry>,
    position: usize,
    /// Redirected descriptor owned by a stream created with `fdopendir`
    owned_fd: Option<RawFd>,
    dirent: libc::dirent,
    dirent64: libc::dirent64,
}

impl RemoteDir {
    pub fn new(entries: Vec<DirEntry>, owned_fd: Option<RawFd>) -> Self {
        Self {
            entries,
            position: 0,
            owned_fd,
            dirent: unsafe { std::mem::zeroed() },
            dirent64: unsafe { std::mem::zeroed() },
        }
    }

    pub fn owned_fd(&self) -> Option<RawFd> {
        self.owned_fd
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Next entry in agent order, skipping names a `dirent` cannot hold.
    pub fn next_entry(&mut self) -> Option<(usize, &DirEntry)> {
        while self.position < self.entries.len() {
            let index = self.position;
            self.position += 1;
            let name = &self.entries[index].name;
            if name.len() > MAX_NAME_LEN || name.contains(&0) {
                warn!(
                    name = %String::from_utf8_lossy(name),
                    "skipping directory entry that does not fit a dirent"
                );
                continue;
            }
            return Some((index, &self.entries[index]));
        }
        None
    }

    /// `readdir` semantics: pointer valid until the next call on this stream,
    /// null at the end.
    pub fn next_dirent(&mut self) -> *mut libc::dirent {
        let mut dirent = self.dirent;
        if !self.next_into(&mut dirent) {
            return std::ptr::null_mut();
        }
        self.dirent = dirent;
        &mut self.dirent
    }

    pub fn next_dirent64(&mut self) -> *mut libc::dirent64 {
        let mut dirent = self.dirent64;
        if !self.next_into64(&mut dirent) {
            return std::ptr::null_mut();
        }
        self.dirent64 = dirent;
        &mut self.dirent64
    }

    /// `readdir_r` semantics: fill a caller buffer; false at the end.
    pub fn next_into(&mut self, dirent: &mut libc::dirent) -> bool {
        match self.next_entry() {
            Some((index, entry)) => {
                let entry = entry.clone();
                fill_dirent!(*dirent, index, entry);
                true
            }
            None => false,
        }
    }

    pub fn next_into64(&mut self, dirent: &mut libc::dirent64) -> bool {
        match self.next_entry() {
            Some((index, entry)) => {
                let entry = entry.clone();
                fill_dirent!(*dirent, index, entry);
                true
            }
            None => false,
        }
    }
}

/// Live remote streams keyed by the `DIR *` handed to the process
#[derive(Default)]
pub struct DirStreams {
    streams: Mutex<HashMap<usize, Box<RemoteDir>>>,
}

impl DirStreams {
    fn streams(&self) -> MutexGuard<'_, HashMap<usize, Box<RemoteDir>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of `dir` and return the opaque handle identifying it.
    pub fn register(&self, dir: RemoteDir) -> *mut libc::DIR {
        let mut boxed = Box::new(dir);
        let handle = &mut *boxed as *mut RemoteDir as *mut libc::DIR;
        self.streams().insert(handle as usize, boxed);
        handle
    }

    pub fn contains(&self, handle: *mut libc::DIR) -> bool {
        self.streams().contains_key(&(handle as usize))
    }

    pub fn with_stream<R>(
        &self,
        handle: *mut libc::DIR,
        f: impl FnOnce(&mut RemoteDir) -> R,
    ) -> Option<R> {
        self.streams()
            .get_mut(&(handle as usize))
            .map(|dir| f(dir.as_mut()))
    }

    pub fn remove(&self, handle: *mut libc::DIR) -> Option<Box<RemoteDir>> {
        self.streams().remove(&(handle as usize))
    }
}
