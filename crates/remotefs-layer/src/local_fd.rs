// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Placeholder descriptors handed to the target process for redirected files.
//!
//! A real kernel descriptor backs every redirected local id so that the
//! numbers never collide with descriptors the process opens natively.

use std::io;
use std::os::unix::io::RawFd;

/// Source of local descriptor numbers
pub trait LocalFds: Send + Sync {
    fn allocate(&self) -> io::Result<RawFd>;
    fn release(&self, fd: RawFd);
}

/// Anonymous `memfd_create` descriptors. Closed on exec: shadow state does
/// not survive into a new program image.
pub struct MemfdPlaceholders;

impl LocalFds for MemfdPlaceholders {
    fn allocate(&self) -> io::Result<RawFd> {
        let fd = unsafe {
            libc::memfd_create(
                b"remotefs-placeholder\0".as_ptr() as *const libc::c_char,
                libc::MFD_CLOEXEC,
            )
        };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }

    fn release(&self, fd: RawFd) {
        native_close(fd);
    }
}

#[cfg(all(target_os = "linux", not(test)))]
fn native_close(fd: RawFd) {
    unsafe {
        crate::hooks::next_close(fd);
    }
}

#[cfg(not(all(target_os = "linux", not(test))))]
fn native_close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
