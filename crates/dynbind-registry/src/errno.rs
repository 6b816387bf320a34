//! Platform last-error introspection.
//!
//! [`last_error`] reads `errno` live at query time. Foreign calls preserve
//! the value the callee left behind, so querying right after a failed call
//! sees the callee's error:
//!
//! ```ignore
//! let chdir = lib.declare_function(FunctionDecl::new("chdir").param("path", TypeMarker::Str))?;
//! lib.bind()?;
//! lib.call(chdir, &["/does/not/exist".into()])?;
//! assert_eq!(last_error().code, "ENOENT");
//! ```
//!
//! Callbacks declared with errno capture see the foreign `errno` through
//! [`captured_errno`], and whatever it holds when the callback returns is
//! restored for the foreign caller.

use std::cell::RefCell;

/// Snapshot of the platform's last error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Raw error number.
    pub num: i32,
    /// Symbolic name, e.g. `ENOENT`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

#[cfg(unix)]
mod imp {
    use nix::errno::Errno;

    use super::ErrorInfo;

    pub fn raw() -> i32 {
        Errno::last_raw()
    }

    pub fn set_raw(num: i32) {
        Errno::set_raw(num);
    }

    pub fn describe(num: i32) -> ErrorInfo {
        let errno = Errno::from_raw(num);
        ErrorInfo {
            num,
            code: format!("{errno:?}"),
            message: errno.desc().to_string(),
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::io;

    use super::ErrorInfo;

    pub fn raw() -> i32 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    pub fn set_raw(_num: i32) {}

    pub fn describe(num: i32) -> ErrorInfo {
        let err = io::Error::from_raw_os_error(num);
        ErrorInfo {
            num,
            code: format!("{:?}", err.kind()),
            message: err.to_string(),
        }
    }
}

/// Read the platform's last error.
pub fn last_error() -> ErrorInfo {
    imp::describe(imp::raw())
}

/// Overwrite the platform's last error number.
pub fn set_last_error(num: i32) {
    imp::set_raw(num);
}

/// Describe an arbitrary error number.
pub fn describe(num: i32) -> ErrorInfo {
    imp::describe(num)
}

// ============================================================================
// Preservation across host-side work
// ============================================================================

/// Holds the error number observed at creation until [`SavedErrno::restore`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct SavedErrno(i32);

impl SavedErrno {
    pub(crate) fn capture() -> Self {
        SavedErrno(imp::raw())
    }

    pub(crate) fn restore(self) {
        imp::set_raw(self.0);
    }
}

// ============================================================================
// Callback capture
// ============================================================================

thread_local! {
    static CAPTURED: RefCell<Vec<i32>> = const { RefCell::new(Vec::new()) };
}

/// The foreign `errno` captured on entry to the innermost running callback
/// declared with errno capture, if any.
pub fn captured_errno() -> Option<i32> {
    CAPTURED.with(|c| c.borrow().last().copied())
}

/// Replace the value restored when the innermost capturing callback returns.
///
/// Returns `false` outside a capturing callback.
pub fn set_captured_errno(num: i32) -> bool {
    CAPTURED.with(|c| match c.borrow_mut().last_mut() {
        Some(slot) => {
            *slot = num;
            true
        }
        None => false,
    })
}

/// Captures `errno` on creation and restores the captured value on drop.
pub(crate) struct CaptureGuard(());

impl CaptureGuard {
    pub(crate) fn enter() -> Self {
        let num = imp::raw();
        CAPTURED.with(|c| c.borrow_mut().push(num));
        CaptureGuard(())
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if let Some(num) = CAPTURED.with(|c| c.borrow_mut().pop()) {
            imp::set_raw(num);
        }
    }
}
