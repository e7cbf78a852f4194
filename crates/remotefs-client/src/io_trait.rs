// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! I/O abstraction trait for the remote filesystem client
//!
//! The client talks to the agent through raw descriptors so that the
//! interception layer can substitute an implementation that calls the next
//! definition of each symbol directly and never re-enters its own hooks.

use std::io::{self, Error, ErrorKind};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::Duration;

/// Abstraction for Unix socket I/O operations
///
/// Implementations must be usable from several threads at once: the reader
/// thread blocks in [`SocketIo::read_exact`] while callers write frames.
pub trait SocketIo: Send + Sync + 'static {
    /// Connect to a Unix domain socket at the given path
    fn connect(&self, path: &Path) -> io::Result<RawFd>;

    /// Write all bytes to the file descriptor
    fn write_all(&self, fd: RawFd, buf: &[u8]) -> io::Result<()>;

    /// Read exact number of bytes from the file descriptor
    fn read_exact(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<()>;

    /// Shut down both directions, waking a reader blocked on the descriptor
    fn shutdown(&self, fd: RawFd) -> io::Result<()> {
        let result = unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
        if result < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Close the file descriptor
    fn close(&self, fd: RawFd) -> io::Result<()>;

    /// Set write timeout on the socket
    fn set_write_timeout(&self, fd: RawFd, timeout: Duration) -> io::Result<()> {
        set_timeout(fd, libc::SO_SNDTIMEO, timeout)
    }
}

/// Apply `SO_SNDTIMEO`/`SO_RCVTIMEO` on a socket.
pub fn set_timeout(fd: RawFd, option: libc::c_int, timeout: Duration) -> io::Result<()> {
    let timeval = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let result = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &timeval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if result < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Standard I/O implementation using normal syscalls
///
/// Calls go through whatever symbol resolution the process has, including
/// installed hooks. Suitable for the agent side and for tests.
pub struct StandardIo;

impl SocketIo for StandardIo {
    fn connect(&self, path: &Path) -> io::Result<RawFd> {
        use std::os::unix::io::IntoRawFd;
        use std::os::unix::net::UnixStream;
        let stream = UnixStream::connect(path)?;
        Ok(stream.into_raw_fd())
    }

    fn write_all(&self, fd: RawFd, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let result = unsafe {
                libc::write(
                    fd,
                    buf[written..].as_ptr() as *const libc::c_void,
                    buf.len() - written,
                )
            };
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
        let mut read_bytes = 0;
        while read_bytes < buf.len() {
            let result = unsafe {
                libc::read(
                    fd,
                    buf[read_bytes..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - read_bytes,
                )
            };
            if result < 0 {
                let err = Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if result == 0 {
                return Err(Error::new(ErrorKind::UnexpectedEof, "unexpected EOF"));
            }
            read_bytes += result as usize;
        }
        Ok(())
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        let result = unsafe { libc::close(fd) };
        if result < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }
}
