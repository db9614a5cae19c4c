//! Iteration over foreign iterables.
//!
//! [`ForeignIter`] is lazy, forward-only and single-pass: it asks the
//! runtime for one iterator and then for one element at a time. As an
//! [`Iterator`] it treats a mid-iteration exception as fatal;
//! [`ForeignIter::try_next`] is the throwing alternative.

use std::iter::FusedIterator;

use pyo3::ffi;

use crate::error::{self, BridgeError, Result};
use crate::runtime;
use crate::value::ForeignValue;

pub struct ForeignIter {
    iterator: ForeignValue,
    exhausted: bool,
}

impl ForeignIter {
    /// The next element, `Ok(None)` once exhausted.
    pub fn try_next(&mut self) -> Result<Option<ForeignValue>> {
        if self.exhausted {
            return Ok(None);
        }
        let step = runtime::enter(|py| {
            let raw = unsafe { ffi::PyIter_Next(self.iterator.as_ptr()) };
            match unsafe { ForeignValue::from_owned_ptr(raw) } {
                Some(element) => Ok(Some(element)),
                None => error::take_pending(py).map_or(Ok(None), |pending| Err(BridgeError::Exception(pending))),
            }
        });
        if !matches!(step, Ok(Some(_))) {
            self.exhausted = true;
        }
        step
    }
}

impl Iterator for ForeignIter {
    type Item = ForeignValue;

    /// # Panics
    /// If the foreign iterator raises.
    fn next(&mut self) -> Option<ForeignValue> {
        self.try_next()
            .unwrap_or_else(|e| error::fatal("foreign iteration", e))
    }
}

impl FusedIterator for ForeignIter {}

impl ForeignValue {
    /// `iter(self)`, or `None` when the object is not iterable.
    pub fn try_iter(&self) -> Option<ForeignIter> {
        runtime::enter(|py| {
            let raw = unsafe { ffi::PyObject_GetIter(self.as_ptr()) };
            match unsafe { ForeignValue::from_owned_ptr(raw) } {
                Some(iterator) => Some(ForeignIter {
                    iterator,
                    exhausted: false,
                }),
                None => {
                    error::discard_pending(py);
                    None
                }
            }
        })
    }

    /// # Panics
    /// If the object is not iterable.
    pub fn iter(&self) -> ForeignIter {
        match self.try_iter() {
            Some(iter) => iter,
            None => panic!("`{}` object is not iterable", self.type_name()),
        }
    }
}

impl IntoIterator for &ForeignValue {
    type Item = ForeignValue;
    type IntoIter = ForeignIter;

    fn into_iter(self) -> ForeignIter {
        self.iter()
    }
}
