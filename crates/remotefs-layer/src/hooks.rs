// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Exported replacements for the intercepted libc functions.
//!
//! Every hook first checks the reentrancy guard and the layer singleton.
//! A body returning `None`, or panicking, hands the call to the next
//! definition of the symbol.

use crate::detour::{
    finish, finish_at, hooks_allowed, set_errno, HookGuard, HookReturn, NextSymbol,
};
use crate::ops::Dispatch;
use libc::{c_char, c_int, c_void, mode_t, off64_t, off_t, size_t, ssize_t, DIR};
use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

macro_rules! hook {
    (
        fn $name:ident ( $( $arg:ident : $ty:ty ),* ) -> $ret:ty ;
        next $next:ident ;
        |$layer:ident| $body:block
    ) => {
        /// Calls the definition `dlsym(RTLD_NEXT)` finds behind this library.
        #[allow(dead_code)]
        pub unsafe fn $next($( $arg: $ty ),*) -> $ret {
            static SYMBOL: NextSymbol = NextSymbol::new(concat!(stringify!($name), "\0"));
            match SYMBOL.get::<unsafe extern "C" fn($( $ty ),*) -> $ret>() {
                Some(next) => next($( $arg ),*),
                None => {
                    set_errno(libc::ENOSYS);
                    <$ret as HookReturn>::failure()
                }
            }
        }

        #[no_mangle]
        pub unsafe extern "C" fn $name($( $arg: $ty ),*) -> $ret {
            if hooks_allowed() {
                if let Some($layer) = crate::layer() {
                    let _guard = HookGuard::new();
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Option<$ret> { $body }));
                    if let Ok(Some(result)) = outcome {
                        return result;
                    }
                }
            }
            $next($( $arg ),*)
        }
    };
}

/// Borrow a C path argument; null pointers are left to the native call.
unsafe fn path_arg<'a>(path: *const c_char) -> Option<&'a Path> {
    if path.is_null() {
        return None;
    }
    Some(Path::new(OsStr::from_bytes(CStr::from_ptr(path).to_bytes())))
}

/// The variadic mode argument only carries a value for creating opens.
fn creation_mode(flags: c_int, mode: mode_t) -> u32 {
    if flags & libc::O_CREAT != 0 || flags & libc::O_TMPFILE == libc::O_TMPFILE {
        mode as u32
    } else {
        0
    }
}

unsafe fn read_buf<'a>(buf: *mut c_void, count: size_t) -> Option<&'a mut [u8]> {
    match (buf.is_null(), count) {
        (_, 0) => Some(&mut []),
        (true, _) => None,
        (false, _) => Some(std::slice::from_raw_parts_mut(buf as *mut u8, count)),
    }
}

unsafe fn write_buf<'a>(buf: *const c_void, count: size_t) -> Option<&'a [u8]> {
    match (buf.is_null(), count) {
        (_, 0) => Some(&[]),
        (true, _) => None,
        (false, _) => Some(std::slice::from_raw_parts(buf as *const u8, count)),
    }
}

// open family

hook! {
    fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int;
    next next_open;
    |layer| {
        finish(layer.open(path_arg(path)?, flags, creation_mode(flags, mode)), |fd| fd)
    }
}

hook! {
    fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int;
    next next_open64;
    |layer| {
        finish(layer.open(path_arg(path)?, flags, creation_mode(flags, mode)), |fd| fd)
    }
}

hook! {
    fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int;
    next next_openat;
    |layer| {
        let mode = creation_mode(flags, mode);
        finish_at(layer.openat(dirfd, path_arg(path)?, flags, mode), |fd| fd, |local| {
            next_openat(libc::AT_FDCWD, local, flags, mode as mode_t)
        })
    }
}

hook! {
    fn openat64(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int;
    next next_openat64;
    |layer| {
        let mode = creation_mode(flags, mode);
        finish_at(layer.openat(dirfd, path_arg(path)?, flags, mode), |fd| fd, |local| {
            next_openat64(libc::AT_FDCWD, local, flags, mode as mode_t)
        })
    }
}

// _FORTIFY_SOURCE entry points; these never take a mode.

hook! {
    fn __open_2(path: *const c_char, flags: c_int) -> c_int;
    next next_open_2;
    |layer| { finish(layer.open(path_arg(path)?, flags, 0), |fd| fd) }
}

hook! {
    fn __open64_2(path: *const c_char, flags: c_int) -> c_int;
    next next_open64_2;
    |layer| { finish(layer.open(path_arg(path)?, flags, 0), |fd| fd) }
}

hook! {
    fn __openat_2(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int;
    next next_openat_2;
    |layer| {
        finish_at(layer.openat(dirfd, path_arg(path)?, flags, 0), |fd| fd, |local| {
            next_openat_2(libc::AT_FDCWD, local, flags)
        })
    }
}

hook! {
    fn __openat64_2(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int;
    next next_openat64_2;
    |layer| {
        finish_at(layer.openat(dirfd, path_arg(path)?, flags, 0), |fd| fd, |local| {
            next_openat64_2(libc::AT_FDCWD, local, flags)
        })
    }
}

// descriptor I/O

hook! {
    fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t;
    next next_read;
    |layer| {
        let buf = read_buf(buf, count)?;
        finish(layer.read(fd, buf), |n| n as ssize_t)
    }
}

hook! {
    fn __read_chk(fd: c_int, buf: *mut c_void, count: size_t, buflen: size_t) -> ssize_t;
    next next_read_chk;
    |layer| {
        // Oversized requests go native so glibc reports the overflow.
        if count > buflen {
            return None;
        }
        let buf = read_buf(buf, count)?;
        finish(layer.read(fd, buf), |n| n as ssize_t)
    }
}

hook! {
    fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t;
    next next_write;
    |layer| {
        let buf = write_buf(buf, count)?;
        finish(layer.write(fd, buf), |n| n as ssize_t)
    }
}

hook! {
    fn lseek(fd: c_int, offset: off_t, whence: c_int) -> off_t;
    next next_lseek;
    |layer| { finish(layer.lseek(fd, offset, whence), |pos| pos as off_t) }
}

hook! {
    fn lseek64(fd: c_int, offset: off64_t, whence: c_int) -> off64_t;
    next next_lseek64;
    |layer| { finish(layer.lseek(fd, offset, whence), |pos| pos as off64_t) }
}

hook! {
    fn close(fd: c_int) -> c_int;
    next next_close;
    |layer| { finish(layer.close(fd), |()| 0) }
}

// permission checks

hook! {
    fn access(path: *const c_char, mode: c_int) -> c_int;
    next next_access;
    |layer| { finish(layer.access(path_arg(path)?, mode), |()| 0) }
}

hook! {
    fn faccessat(dirfd: c_int, path: *const c_char, mode: c_int, flags: c_int) -> c_int;
    next next_faccessat;
    |layer| {
        let dispatch = layer.faccessat(dirfd, path_arg(path)?, mode, flags);
        finish_at(dispatch, |()| 0, |local| next_faccessat(libc::AT_FDCWD, local, mode, flags))
    }
}

// directory streams

hook! {
    fn opendir(path: *const c_char) -> *mut DIR;
    next next_opendir;
    |layer| { finish(layer.opendir(path_arg(path)?), |dirp| dirp) }
}

hook! {
    fn fdopendir(fd: c_int) -> *mut DIR;
    next next_fdopendir;
    |layer| { finish(layer.fdopendir(fd), |dirp| dirp) }
}

hook! {
    fn readdir(dirp: *mut DIR) -> *mut libc::dirent;
    next next_readdir;
    |layer| { finish(layer.readdir(dirp), |dirent| dirent) }
}

hook! {
    fn readdir64(dirp: *mut DIR) -> *mut libc::dirent64;
    next next_readdir64;
    |layer| { finish(layer.readdir64(dirp), |dirent| dirent) }
}

/// `readdir_r` reports failure through its return value, not `errno`.
unsafe fn finish_r<D>(
    dispatch: Dispatch<bool>,
    entry: *mut D,
    result: *mut *mut D,
) -> Option<c_int> {
    match dispatch {
        Dispatch::Redirected(Ok(filled)) => {
            *result = if filled { entry } else { std::ptr::null_mut() };
            Some(0)
        }
        Dispatch::Redirected(Err(err)) => Some(err.errno()),
        Dispatch::Passthrough | Dispatch::Relocated(_) => None,
    }
}

hook! {
    fn readdir_r(
        dirp: *mut DIR,
        entry: *mut libc::dirent,
        result: *mut *mut libc::dirent
    ) -> c_int;
    next next_readdir_r;
    |layer| {
        if entry.is_null() || result.is_null() {
            return None;
        }
        finish_r(layer.readdir_r(dirp, &mut *entry), entry, result)
    }
}

hook! {
    fn readdir64_r(
        dirp: *mut DIR,
        entry: *mut libc::dirent64,
        result: *mut *mut libc::dirent64
    ) -> c_int;
    next next_readdir64_r;
    |layer| {
        if entry.is_null() || result.is_null() {
            return None;
        }
        finish_r(layer.readdir64_r(dirp, &mut *entry), entry, result)
    }
}

hook! {
    fn rewinddir(dirp: *mut DIR) -> ();
    next next_rewinddir;
    |layer| { finish(layer.rewinddir(dirp), |()| ()) }
}

hook! {
    fn dirfd(dirp: *mut DIR) -> c_int;
    next next_dirfd;
    |layer| { finish(layer.dirfd(dirp), |fd| fd) }
}

hook! {
    fn closedir(dirp: *mut DIR) -> c_int;
    next next_closedir;
    |layer| { finish(layer.closedir(dirp), |()| 0) }
}
