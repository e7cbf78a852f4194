// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Socket I/O for the agent channel that never enters the layer's hooks.
//!
//! `read`, `write` and `close` are exported by this library, so the channel
//! calls the next definitions directly. The reader thread runs outside any
//! hook and would otherwise route its own reads through the layer.

use crate::hooks::{next_close, next_read, next_write};
use remotefs_client::io_trait::SocketIo;
use std::io::{self, Error, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

pub struct HookSafeIo;

impl SocketIo for HookSafeIo {
    fn connect(&self, path: &Path) -> io::Result<RawFd> {
        let bytes = path.as_os_str().as_bytes();
        if bytes.contains(&0) {
            return Err(Error::new(ErrorKind::InvalidInput, "path contains null byte"));
        }

        unsafe {
            let mut addr: libc::sockaddr_un = std::mem::zeroed();
            addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
            if bytes.len() >= addr.sun_path.len() {
                return Err(Error::new(ErrorKind::InvalidInput, "socket path too long"));
            }
            for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }

            let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
            if fd < 0 {
                return Err(Error::last_os_error());
            }

            let result = libc::connect(
                fd,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            );
            if result < 0 {
                let err = Error::last_os_error();
                next_close(fd);
                return Err(err);
            }
            Ok(fd)
        }
    }

    fn write_all(&self, fd: RawFd, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let rest = &buf[written..];
            let result = unsafe { next_write(fd, rest.as_ptr() as *const libc::c_void, rest.len()) };
            if result < 0 {
                let err = Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            written += result as usize;
        }
        Ok(())
    }

    fn read_exact(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let rest = &mut buf[filled..];
            let result = unsafe { next_read(fd, rest.as_mut_ptr() as *mut libc::c_void, rest.len()) };
            if result < 0 {
                let err = Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if result == 0 {
                return Err(Error::new(ErrorKind::UnexpectedEof, "agent closed the channel"));
            }
            filled += result as usize;
        }
        Ok(())
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        if unsafe { next_close(fd) } < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }
}
