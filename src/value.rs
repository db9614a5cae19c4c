//! `ForeignValue`: a shared host-side handle on a foreign object.
//!
//! Cloning a `ForeignValue` shares one [`ForeignHandle`]; the foreign
//! reference is released when the last clone goes away. The raw pointer never
//! leaves the crate except through the `unsafe` constructors.
//!
//! Lookups come in tiers:
//!
//! | tier | member | item | on failure |
//! |---|---|---|---|
//! | probe | [`get_attr`](ForeignValue::get_attr) | [`get_item`](ForeignValue::get_item) | `None`, indicator cleared |
//! | throwing | [`try_attr`](ForeignValue::try_attr) | [`set_item`](ForeignValue::set_item) | [`BridgeError`] |
//! | fatal | [`attr`](ForeignValue::attr) | [`item`](ForeignValue::item) | panic |

use std::fmt;
use std::os::raw::c_int;
use std::sync::Arc;

use pyo3::ffi;

use crate::convert::{FromForeign, ToForeign};
use crate::error::{self, Result};
use crate::handle::ForeignHandle;
use crate::runtime;

type RenderFn = unsafe extern "C" fn(*mut ffi::PyObject) -> *mut ffi::PyObject;

#[derive(Clone)]
pub struct ForeignValue {
    handle: Arc<ForeignHandle>,
}

impl ForeignValue {
    pub fn from_handle(handle: ForeignHandle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// Wrap a new reference returned by a raw call. `None` for null.
    ///
    /// # Safety
    /// `ptr` must be null or a live object whose reference the caller owns.
    pub unsafe fn from_owned_ptr(ptr: *mut ffi::PyObject) -> Option<Self> {
        unsafe { ForeignHandle::adopt(ptr) }.map(Self::from_handle)
    }

    /// Wrap a borrowed reference, taking a reference of our own.
    ///
    /// # Safety
    /// `ptr` must be null or a live object.
    pub unsafe fn from_borrowed_ptr(ptr: *mut ffi::PyObject) -> Option<Self> {
        unsafe { ForeignHandle::retain(ptr) }.map(Self::from_handle)
    }

    /// Convert a host value.
    pub fn new<T: ToForeign + ?Sized>(value: &T) -> Self {
        value.to_foreign()
    }

    pub(crate) fn as_ptr(&self) -> *mut ffi::PyObject {
        self.handle.borrowed()
    }

    /// A fresh reference for raw calls that steal it.
    pub(crate) fn to_owned_ptr(&self) -> *mut ffi::PyObject {
        self.handle.owned()
    }

    /// The foreign `None`.
    pub fn none() -> Self {
        runtime::enter(|_| unsafe { borrowed_or_abort(ffi::Py_None(), "None lookup") })
    }

    pub fn is_none(&self) -> bool {
        runtime::enter(|_| unsafe { self.as_ptr() == ffi::Py_None() })
    }

    /// Identity comparison (`is`).
    pub fn ptr_eq(&self, other: &ForeignValue) -> bool {
        self.as_ptr() == other.as_ptr()
    }

    /// Convert to a host value; `None` if unrepresentable.
    pub fn extract<T: FromForeign>(&self) -> Option<T> {
        T::from_foreign(self)
    }

    // ==================== Member access ====================

    /// Probe an attribute. A miss is `None` and leaves no pending error.
    pub fn get_attr(&self, name: &str) -> Option<ForeignValue> {
        let key = name.to_foreign();
        runtime::enter(|py| {
            let raw = unsafe { ffi::PyObject_GetAttr(self.as_ptr(), key.as_ptr()) };
            let attr = unsafe { Self::from_owned_ptr(raw) };
            if attr.is_none() {
                error::discard_pending(py);
            }
            attr
        })
    }

    /// Look up an attribute, surfacing the foreign `AttributeError`.
    pub fn try_attr(&self, name: &str) -> Result<ForeignValue> {
        let key = name.to_foreign();
        runtime::enter(|py| {
            let raw = unsafe { ffi::PyObject_GetAttr(self.as_ptr(), key.as_ptr()) };
            unsafe { Self::from_owned_ptr(raw) }
                .ok_or_else(|| error::raised_or_invalid(py, "attribute lookup"))
        })
    }

    /// Attribute the caller knows exists.
    ///
    /// # Panics
    /// If the lookup fails.
    pub fn attr(&self, name: &str) -> ForeignValue {
        self.try_attr(name)
            .unwrap_or_else(|e| error::fatal(&format!("attribute `{name}`"), e))
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.get_attr(name).is_some()
    }

    pub fn set_attr<T: ToForeign>(&self, name: &str, value: T) -> Result<()> {
        let key = name.to_foreign();
        let value = value.to_foreign();
        runtime::enter(|py| {
            let status = unsafe { ffi::PyObject_SetAttr(self.as_ptr(), key.as_ptr(), value.as_ptr()) };
            check_status(py, status, "attribute assignment")
        })
    }

    // ==================== Item access ====================

    /// Probe `self[k0, k1, ...]`. Several keys form one tuple key; a single
    /// key is used as is. A miss is `None` and leaves no pending error.
    pub fn subscript(&self, keys: &[ForeignValue]) -> Option<ForeignValue> {
        let key = subscript_key(keys);
        runtime::enter(|py| {
            let raw = unsafe { ffi::PyObject_GetItem(self.as_ptr(), key.as_ptr()) };
            let item = unsafe { Self::from_owned_ptr(raw) };
            if item.is_none() {
                error::discard_pending(py);
            }
            item
        })
    }

    /// Assign `self[k0, k1, ...] = value`, or delete the key when `value`
    /// is `None`.
    pub fn set_subscript(&self, keys: &[ForeignValue], value: Option<&ForeignValue>) -> Result<()> {
        let key = subscript_key(keys);
        runtime::enter(|py| {
            let status = unsafe {
                match value {
                    Some(value) => ffi::PyObject_SetItem(self.as_ptr(), key.as_ptr(), value.as_ptr()),
                    None => ffi::PyObject_DelItem(self.as_ptr(), key.as_ptr()),
                }
            };
            check_status(py, status, "item assignment")
        })
    }

    pub fn get_item<K: ToForeign>(&self, key: K) -> Option<ForeignValue> {
        self.subscript(&[key.to_foreign()])
    }

    /// Item the caller knows exists.
    ///
    /// # Panics
    /// If the lookup fails.
    pub fn item<K: ToForeign>(&self, key: K) -> ForeignValue {
        let key = key.to_foreign();
        match self.get_item(&key) {
            Some(item) => item,
            None => panic!("item {key:?} missing from {}", self.type_name()),
        }
    }

    pub fn set_item<K: ToForeign, V: ToForeign>(&self, key: K, value: V) -> Result<()> {
        self.set_subscript(&[key.to_foreign()], Some(&value.to_foreign()))
    }

    pub fn del_item<K: ToForeign>(&self, key: K) -> Result<()> {
        self.set_subscript(&[key.to_foreign()], None)
    }

    // ==================== Introspection ====================

    /// `len(self)`, or `None` for objects without a length.
    pub fn len(&self) -> Option<usize> {
        runtime::enter(|py| {
            let n = unsafe { ffi::PyObject_Size(self.as_ptr()) };
            if n < 0 {
                error::discard_pending(py);
                None
            } else {
                Some(n as usize)
            }
        })
    }

    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|n| n == 0)
    }

    /// Foreign truthiness (`bool(self)`).
    ///
    /// # Panics
    /// If `__bool__` or `__len__` raises.
    pub fn is_truthy(&self) -> bool {
        let truth = runtime::enter(|py| match unsafe { ffi::PyObject_IsTrue(self.as_ptr()) } {
            -1 => Err(error::raised_or_invalid(py, "truth test")),
            n => Ok(n != 0),
        });
        truth.unwrap_or_else(|e| error::fatal("truth test", e))
    }

    pub fn is_callable(&self) -> bool {
        runtime::enter(|_| unsafe { ffi::PyCallable_Check(self.as_ptr()) != 0 })
    }

    /// Qualified name of the object's type, e.g. `int` or `OrderedDict`.
    pub fn type_name(&self) -> String {
        let ty = runtime::enter(|_| unsafe { Self::from_owned_ptr(ffi::PyObject_Type(self.as_ptr())) });
        ty.and_then(|ty| ty.get_attr("__qualname__"))
            .and_then(|name| String::from_foreign(&name))
            .unwrap_or_else(|| "<unknown type>".to_owned())
    }

    /// `str(self)` or `repr(self)` as host text; `None` if rendering raised.
    pub(crate) fn text(&self, render: RenderFn) -> Option<String> {
        runtime::enter(|py| {
            let rendered = unsafe { Self::from_owned_ptr(render(self.as_ptr())) };
            match rendered {
                Some(text) => String::from_foreign(&text),
                None => {
                    error::discard_pending(py);
                    None
                }
            }
        })
    }

    // ==================== Containers ====================

    /// A foreign tuple holding `items` in order.
    pub fn tuple(items: &[ForeignValue]) -> Self {
        runtime::enter(|_| unsafe {
            let tuple = adopt_or_abort(ffi::PyTuple_New(items.len() as ffi::Py_ssize_t), "tuple construction");
            for (index, item) in items.iter().enumerate() {
                // Steals the fresh reference.
                ffi::PyTuple_SetItem(tuple.as_ptr(), index as ffi::Py_ssize_t, item.to_owned_ptr());
            }
            tuple
        })
    }

    /// A foreign list holding `items` in order.
    pub fn list(items: &[ForeignValue]) -> Self {
        runtime::enter(|_| unsafe {
            let list = adopt_or_abort(ffi::PyList_New(items.len() as ffi::Py_ssize_t), "list construction");
            for (index, item) in items.iter().enumerate() {
                // Steals the fresh reference.
                ffi::PyList_SetItem(list.as_ptr(), index as ffi::Py_ssize_t, item.to_owned_ptr());
            }
            list
        })
    }

    /// A foreign dict built from `pairs`; a repeated key keeps its last value.
    ///
    /// # Panics
    /// If a key is unhashable.
    pub fn dict<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (ForeignValue, ForeignValue)>,
    {
        let dict = runtime::enter(|_| unsafe { adopt_or_abort(ffi::PyDict_New(), "dict construction") });
        for (key, value) in pairs {
            let inserted = runtime::enter(|py| {
                let status = unsafe { ffi::PyDict_SetItem(dict.as_ptr(), key.as_ptr(), value.as_ptr()) };
                check_status(py, status, "dict insertion")
            });
            if let Err(e) = inserted {
                error::fatal("dict construction", e);
            }
        }
        dict
    }
}

fn subscript_key(keys: &[ForeignValue]) -> ForeignValue {
    match keys {
        [single] => single.clone(),
        _ => ForeignValue::tuple(keys),
    }
}

fn check_status(py: pyo3::Python<'_>, status: c_int, operation: &str) -> Result<()> {
    if status < 0 {
        Err(error::raised_or_invalid(py, operation))
    } else {
        Ok(())
    }
}

/// Adopt the result of a raw constructor that only fails on exhaustion.
///
/// # Safety
/// As [`ForeignValue::from_owned_ptr`]; must run inside `runtime::enter`.
pub(crate) unsafe fn adopt_or_abort(ptr: *mut ffi::PyObject, operation: &str) -> ForeignValue {
    match unsafe { ForeignValue::from_owned_ptr(ptr) } {
        Some(value) => value,
        None => abort_with_pending(operation),
    }
}

/// # Safety
/// As [`ForeignValue::from_borrowed_ptr`]; must run inside `runtime::enter`.
pub(crate) unsafe fn borrowed_or_abort(ptr: *mut ffi::PyObject, operation: &str) -> ForeignValue {
    match unsafe { ForeignValue::from_borrowed_ptr(ptr) } {
        Some(value) => value,
        None => abort_with_pending(operation),
    }
}

fn abort_with_pending(operation: &str) -> ! {
    let error = runtime::enter(|py| error::raised_or_invalid(py, operation));
    error::fatal(operation, error)
}

impl fmt::Display for ForeignValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.text(ffi::PyObject_Str) {
            Some(text) => f.write_str(&text),
            None => write!(f, "<unprintable {}>", self.type_name()),
        }
    }
}

impl fmt::Debug for ForeignValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.text(ffi::PyObject_Repr) {
            Some(text) => f.write_str(&text),
            None => write!(f, "<unrepresentable {}>", self.type_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{drain_pending_error, BridgeError};
    use crate::runtime::Runtime;

    fn eval(expression: &str) -> ForeignValue {
        Runtime::get().eval(expression).expect("eval")
    }

    #[test]
    fn missing_attribute_is_a_miss() {
        let list = eval("[3, 1, 2]");
        assert!(list.get_attr("no_such_member").is_none());
        assert!(drain_pending_error().is_none());
        assert!(list.has_attr("append"));
    }

    #[test]
    fn try_attr_surfaces_attribute_error() {
        let err = eval("object()").try_attr("missing").expect_err("lookup should fail");
        assert_eq!(err.pending().expect("pending").kind(), "AttributeError");
    }

    #[test]
    #[should_panic(expected = "attribute `missing`")]
    fn fatal_attr_panics() {
        eval("object()").attr("missing");
    }

    #[test]
    fn set_attr_round_trip() {
        Runtime::get()
            .exec("class PybridgeBox:\n    pass\n")
            .expect("exec");
        let boxed = eval("PybridgeBox()");
        boxed.set_attr("width", 12i64).expect("set_attr");
        assert_eq!(boxed.attr("width").extract::<i64>(), Some(12));
    }

    #[test]
    fn set_attr_on_builtin_raises() {
        let err = 5i64.to_foreign().set_attr("real", 1i64).expect_err("read-only");
        assert!(matches!(err, BridgeError::Exception(_)));
        assert!(drain_pending_error().is_none());
    }

    #[test]
    fn item_access_and_deletion() {
        let dict = eval("{'a': 1}");
        assert_eq!(dict.item("a").extract::<i64>(), Some(1));
        assert!(dict.get_item("b").is_none());
        assert!(drain_pending_error().is_none());

        dict.set_item("b", 2i64).expect("set_item");
        assert_eq!(dict.len(), Some(2));
        dict.del_item("a").expect("del_item");
        assert_eq!(dict.len(), Some(1));
        assert!(dict.del_item("a").is_err());
    }

    #[test]
    fn several_keys_form_a_tuple_key() {
        let grid = eval("{(1, 2): 'x'}");
        let hit = grid.subscript(&[1i64.to_foreign(), 2i64.to_foreign()]);
        assert_eq!(hit.and_then(|v| v.extract::<String>()).as_deref(), Some("x"));

        grid.set_subscript(&[1i64.to_foreign(), 2i64.to_foreign()], None)
            .expect("delete");
        assert_eq!(grid.len(), Some(0));
    }

    #[test]
    fn display_and_debug_use_str_and_repr() {
        let text = "hi".to_foreign();
        assert_eq!(text.to_string(), "hi");
        assert_eq!(format!("{text:?}"), "'hi'");
    }

    #[test]
    fn introspection() {
        let none = ForeignValue::none();
        assert!(none.is_none());
        assert!(!none.is_truthy());
        assert_eq!(none.len(), None);
        assert!(drain_pending_error().is_none());

        let list = ForeignValue::list(&[1i64.to_foreign()]);
        assert_eq!(list.type_name(), "list");
        assert!(list.is_truthy());
        assert_eq!(list.is_empty(), Some(false));
        assert!(!list.is_callable());
        assert!(Runtime::get().builtin("len").is_callable());
    }

    #[test]
    fn identity() {
        let list = ForeignValue::list(&[]);
        let alias = list.clone();
        assert!(list.ptr_eq(&alias));
        assert!(!list.ptr_eq(&ForeignValue::list(&[])));
    }
}
