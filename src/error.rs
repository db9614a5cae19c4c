//! Error reflection for the interpreter's global error indicator.
//!
//! The indicator is process-wide mutable state. Every wrapper that makes a raw
//! call which can set it drains it before returning, using one of two paths:
//!
//! - [`take_pending`] snapshots the exception into a [`PendingError`] so it
//!   can be surfaced as a [`BridgeError`].
//! - [`discard_pending`] clears it for probe-and-miss lookups, where the
//!   failure is reported as `None`.
//!
//! Either way the next, unrelated raw call starts from a clean indicator.

use std::fmt;
use std::ptr;

use pyo3::ffi;
use pyo3::Python;
use thiserror::Error;

use crate::convert::{FromForeign, ToForeign};
use crate::runtime;
use crate::value::ForeignValue;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures surfaced by throwing bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The foreign code raised.
    #[error("foreign exception: {0}")]
    Exception(PendingError),

    /// The callee rejected the call without raising, e.g. it is not callable.
    #[error("invalid call: {reason}")]
    InvalidCall { reason: String },

    /// A module import failed.
    #[error("cannot import module `{name}`")]
    InvalidModule {
        name: String,
        cause: Option<PendingError>,
    },
}

impl BridgeError {
    pub(crate) fn invalid_call(reason: impl Into<String>) -> Self {
        BridgeError::InvalidCall {
            reason: reason.into(),
        }
    }

    /// The drained foreign exception behind this error, if any.
    pub fn pending(&self) -> Option<&PendingError> {
        match self {
            BridgeError::Exception(pending) => Some(pending),
            BridgeError::InvalidModule { cause, .. } => cause.as_ref(),
            BridgeError::InvalidCall { .. } => None,
        }
    }
}

/// Snapshot of an exception drained from the global indicator.
#[derive(Clone)]
pub struct PendingError {
    exception: ForeignValue,
    traceback: Option<ForeignValue>,
    kind: String,
    message: String,
}

impl PendingError {
    /// The exception instance, or the exception type if no instance was set.
    pub fn exception(&self) -> &ForeignValue {
        &self.exception
    }

    pub fn traceback(&self) -> Option<&ForeignValue> {
        self.traceback.as_ref()
    }

    /// Exception type name, e.g. `KeyError`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// `str()` of the exception.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Formatted traceback followed by `kind: message`, or just the latter
    /// when there is no traceback or it cannot be formatted.
    pub fn render(&self) -> String {
        let Some(traceback) = &self.traceback else {
            return self.to_string();
        };
        let frames = runtime::import_module("traceback")
            .and_then(|module| module.try_call_method("format_tb", &[traceback.clone()]))
            .ok()
            .and_then(|lines| Vec::<String>::from_foreign(&lines));
        match frames {
            Some(frames) => format!(
                "Traceback (most recent call last):\n{}{}",
                frames.concat(),
                self
            ),
            None => self.to_string(),
        }
    }
}

impl fmt::Display for PendingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl fmt::Debug for PendingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("traceback", &self.traceback.is_some())
            .finish()
    }
}

/// Fetch and clear the global error indicator.
///
/// Returns `None` when nothing is pending. Never fails itself.
///
/// The indicator lives in the calling thread's interpreter state, which only
/// exists for the duration of one bridge operation. Every operation in this
/// crate drains it before returning, so from outside the crate this only
/// ever observes errors raised by raw calls made on the same thread within
/// one still-running bridge operation.
pub fn drain_pending_error() -> Option<PendingError> {
    runtime::enter(take_pending)
}

// `PyErr_Fetch` is deprecated from 3.12 on but still exported.
#[allow(deprecated)]
pub(crate) fn take_pending(_py: Python<'_>) -> Option<PendingError> {
    unsafe {
        if ffi::PyErr_Occurred().is_null() {
            return None;
        }
        let mut ptype = ptr::null_mut();
        let mut pvalue = ptr::null_mut();
        let mut ptraceback = ptr::null_mut();
        ffi::PyErr_Fetch(&mut ptype, &mut pvalue, &mut ptraceback);
        ffi::PyErr_NormalizeException(&mut ptype, &mut pvalue, &mut ptraceback);

        let kind = ForeignValue::from_owned_ptr(ptype);
        let value = ForeignValue::from_owned_ptr(pvalue);
        let traceback = ForeignValue::from_owned_ptr(ptraceback);

        let exception = value.or_else(|| kind.clone())?;
        let kind = kind
            .and_then(|kind| kind.get_attr("__name__"))
            .and_then(|name| String::from_foreign(&name))
            .unwrap_or_else(|| "<unknown exception>".to_owned());
        let message = exception.text(ffi::PyObject_Str).unwrap_or_default();

        // Rendering the message must not leave anything behind.
        ffi::PyErr_Clear();

        tracing::debug!(kind = %kind, message = %message, "drained foreign exception");
        Some(PendingError {
            exception,
            traceback,
            kind,
            message,
        })
    }
}

/// Clear the indicator, dropping whatever was pending.
pub(crate) fn discard_pending(_py: Python<'_>) {
    unsafe {
        if !ffi::PyErr_Occurred().is_null() {
            ffi::PyErr_Clear();
            tracing::trace!("discarded foreign exception");
        }
    }
}

/// The pending exception, or an [`BridgeError::InvalidCall`] naming
/// `operation` when a raw call failed without raising.
pub(crate) fn raised_or_invalid(py: Python<'_>, operation: &str) -> BridgeError {
    match take_pending(py) {
        Some(pending) => BridgeError::Exception(pending),
        None => {
            tracing::debug!(operation, "foreign operation failed without an exception");
            BridgeError::invalid_call(format!("{operation} failed without raising"))
        }
    }
}

/// Abort a fatal-tier operation whose precondition did not hold.
pub(crate) fn fatal(operation: &str, error: BridgeError) -> ! {
    let detail = match error.pending() {
        Some(pending) => pending.render(),
        None => error.to_string(),
    };
    panic!("{operation} failed: {detail}")
}

impl ToForeign for PendingError {
    fn to_foreign(&self) -> ForeignValue {
        self.exception.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Set a `ValueError`. Must run inside `runtime::enter`.
    fn raise_value_error(message: &'static [u8]) {
        unsafe { ffi::PyErr_SetString(ffi::PyExc_ValueError, message.as_ptr().cast()) };
    }

    #[test]
    fn drain_is_idempotent() {
        runtime::enter(|_| {
            raise_value_error(b"boom\0");
            let first = drain_pending_error().expect("pending error");
            assert_eq!(first.kind(), "ValueError");
            assert_eq!(first.message(), "boom");
            assert_eq!(first.to_string(), "ValueError: boom");
            assert!(drain_pending_error().is_none());
        });
    }

    #[test]
    fn nothing_pending() {
        assert!(drain_pending_error().is_none());
    }

    #[test]
    fn discard_clears_indicator() {
        runtime::enter(|py| {
            raise_value_error(b"ignored\0");
            discard_pending(py);
            assert!(take_pending(py).is_none());
        });
    }

    #[test]
    fn failure_without_exception_is_invalid_call() {
        let err = runtime::enter(|py| raised_or_invalid(py, "lookup"));
        assert!(matches!(err, BridgeError::InvalidCall { .. }));
        assert!(err.pending().is_none());
    }

    #[test]
    fn raised_error_becomes_exception() {
        let err = runtime::enter(|py| {
            raise_value_error(b"bad input\0");
            raised_or_invalid(py, "parse")
        });
        assert_eq!(err.pending().map(PendingError::kind), Some("ValueError"));
        assert!(drain_pending_error().is_none());
    }

    #[test]
    fn exception_without_traceback_renders_message() {
        let pending = runtime::enter(|py| {
            raise_value_error(b"plain\0");
            take_pending(py)
        })
        .expect("pending error");
        assert!(pending.traceback().is_none());
        assert_eq!(pending.render(), "ValueError: plain");
    }
}
