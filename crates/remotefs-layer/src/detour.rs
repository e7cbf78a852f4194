// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Building blocks for the exported hooks: reentrancy tracking, lazy
//! resolution of the next definition of a symbol, and translation of
//! [`Dispatch`] results into C return conventions.

use crate::error::LayerError;
use crate::ops::Dispatch;
use core::cell::Cell;
use core::ffi::c_void;
use libc::c_char;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

thread_local! {
    static HOOK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// True when no hook is running on this thread.
pub fn hooks_allowed() -> bool {
    HOOK_DEPTH.try_with(|depth| depth.get() == 0).unwrap_or(false)
}

/// Marks the current thread as inside a hook; nested calls go native.
pub struct HookGuard;

impl HookGuard {
    pub fn new() -> Self {
        let _ = HOOK_DEPTH.try_with(|depth| depth.set(depth.get() + 1));
        HookGuard
    }
}

impl Default for HookGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        let _ = HOOK_DEPTH.try_with(|depth| {
            let current = depth.get();
            if current > 0 {
                depth.set(current - 1);
            }
        });
    }
}

/// Next definition of an interposed symbol, resolved on first use
pub struct NextSymbol {
    /// NUL-terminated symbol name
    name: &'static str,
    addr: AtomicUsize,
}

impl NextSymbol {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            addr: AtomicUsize::new(0),
        }
    }

    /// # Safety
    ///
    /// `F` must be a function pointer type matching the C signature of the
    /// symbol.
    pub unsafe fn get<F: Copy>(&self) -> Option<F> {
        debug_assert_eq!(core::mem::size_of::<F>(), core::mem::size_of::<usize>());
        debug_assert!(self.name.ends_with('\0'));

        let mut addr = self.addr.load(Ordering::Acquire);
        if addr == 0 {
            let ptr: *mut c_void =
                libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr() as *const libc::c_char);
            if ptr.is_null() {
                return None;
            }
            addr = ptr as usize;
            self.addr.store(addr, Ordering::Release);
        }
        Some(core::mem::transmute_copy::<usize, F>(&addr))
    }
}

/// Failure value of a hooked function's C return type
pub trait HookReturn {
    fn failure() -> Self;
}

macro_rules! minus_one {
    ($($t:ty),*) => {
        $(impl HookReturn for $t {
            fn failure() -> Self {
                -1
            }
        })*
    };
}

minus_one!(i32, i64, isize);

impl<T> HookReturn for *mut T {
    fn failure() -> Self {
        core::ptr::null_mut()
    }
}

impl HookReturn for () {
    fn failure() -> Self {}
}

pub fn set_errno(errno: i32) {
    unsafe {
        *libc::__errno_location() = errno;
    }
}

/// Value a hook returns for `dispatch`; `None` hands the call to the next
/// definition.
pub fn finish<T, R: HookReturn>(dispatch: Dispatch<T>, map: impl FnOnce(T) -> R) -> Option<R> {
    match dispatch {
        // Only `*at` calls relocate, and those go through `finish_at`.
        Dispatch::Passthrough | Dispatch::Relocated(_) => None,
        Dispatch::Redirected(Ok(value)) => Some(map(value)),
        Dispatch::Redirected(Err(err)) => Some(fail(&err)),
    }
}

/// [`finish`] for `*at` calls: a relocated call runs `native` with the
/// absolute local path in place of the original `dirfd`-relative one.
pub fn finish_at<T, R: HookReturn>(
    dispatch: Dispatch<T>,
    map: impl FnOnce(T) -> R,
    native: impl FnOnce(*const c_char) -> R,
) -> Option<R> {
    match dispatch {
        Dispatch::Relocated(path) => match CString::new(path.as_os_str().as_bytes()) {
            Ok(c_path) => Some(native(c_path.as_ptr())),
            Err(_) => Some(fail(&LayerError::InvalidArgument("path contains a NUL byte"))),
        },
        dispatch => finish(dispatch, map),
    }
}

fn fail<R: HookReturn>(err: &LayerError) -> R {
    let errno = err.errno();
    debug!(%err, errno, "redirected call failed");
    set_errno(errno);
    R::failure()
}
