//! Ownership of one reference-count contribution to a foreign object.
//!
//! A [`ForeignHandle`] is born holding exactly one reference and gives it back
//! exactly once, when dropped. The two construction modes differ only in who
//! paid for that reference:
//!
//! - [`Ownership::Retain`]: the handle increments the count itself; the
//!   caller keeps whatever reference it had.
//! - [`Ownership::Adopt`]: the caller already owns a reference (a "new
//!   reference" returned by a raw call) and hands it over.

use std::fmt;
use std::ptr::NonNull;

use pyo3::ffi;

use crate::runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Retain,
    Adopt,
}

pub struct ForeignHandle {
    ptr: NonNull<ffi::PyObject>,
}

// Refcount traffic and every use of `ptr` go through `runtime::enter`, which
// serializes raw calls process-wide.
unsafe impl Send for ForeignHandle {}
unsafe impl Sync for ForeignHandle {}

impl ForeignHandle {
    /// # Safety
    /// `ptr` must point to a live foreign object. With [`Ownership::Adopt`]
    /// the caller must own one reference to it and must not release it.
    pub unsafe fn new(ptr: NonNull<ffi::PyObject>, ownership: Ownership) -> Self {
        if ownership == Ownership::Retain {
            runtime::enter(|_| unsafe { ffi::Py_IncRef(ptr.as_ptr()) });
        }
        Self { ptr }
    }

    /// Retain a borrowed pointer. Returns `None` for null.
    ///
    /// # Safety
    /// See [`ForeignHandle::new`].
    pub unsafe fn retain(ptr: *mut ffi::PyObject) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| unsafe { Self::new(ptr, Ownership::Retain) })
    }

    /// Adopt an owned pointer. Returns `None` for null.
    ///
    /// # Safety
    /// See [`ForeignHandle::new`].
    pub unsafe fn adopt(ptr: *mut ffi::PyObject) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| unsafe { Self::new(ptr, Ownership::Adopt) })
    }

    /// The pointer, without touching the count. Valid only while `self` lives.
    pub fn borrowed(&self) -> *mut ffi::PyObject {
        self.ptr.as_ptr()
    }

    /// The pointer plus a fresh reference the caller must hand to the
    /// runtime (e.g. a reference-stealing setter) or release.
    pub fn owned(&self) -> *mut ffi::PyObject {
        runtime::enter(|_| unsafe { ffi::Py_IncRef(self.ptr.as_ptr()) });
        self.ptr.as_ptr()
    }
}

impl Drop for ForeignHandle {
    fn drop(&mut self) {
        runtime::enter(|_| unsafe { ffi::Py_DecRef(self.ptr.as_ptr()) });
    }
}

impl fmt::Debug for ForeignHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForeignHandle({:p})", self.ptr)
    }
}
