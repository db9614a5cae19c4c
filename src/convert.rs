//! Conversion registry between host values and foreign objects.
//!
//! [`ToForeign`] is total: every host value has a foreign rendering.
//! [`FromForeign`] is partial: an unrepresentable foreign value yields `None`
//! and leaves no pending error behind.
//!
//! | host | foreign |
//! |---|---|
//! | `bool` | `bool` (exact type, not truthiness) |
//! | `String`, `&str` | `str` |
//! | integers | `int` or any `__index__` object; out-of-range is a miss |
//! | `f32`, `f64` | `float`; a finite value beyond `f32` range is a miss |
//! | `Option<T>` | `None` or `T` |
//! | `Vec<T>`, `[T]` | `list` out, any iterable in |
//! | `HashMap`, `BTreeMap` | `dict`; sequence keys become tuples |
//! | `(A, B)`, `(A, B, C)` | `tuple` of that arity |
//! | `Range`, `RangeFrom`, `RangeTo`, `RangeFull` | `slice` with no step |
//!
//! When two foreign keys convert to the same host key, the entry visited
//! later in the dict's iteration order wins. Keys that are themselves maps
//! have no hashable rendering, so converting such a map panics.

use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};
use std::os::raw::{c_long, c_longlong, c_ulonglong};
use std::ptr;

use pyo3::ffi;
use pyo3::Python;

use crate::error;
use crate::runtime;
use crate::value::{adopt_or_abort, ForeignValue};

/// Host values with a foreign rendering.
pub trait ToForeign {
    fn to_foreign(&self) -> ForeignValue;
}

/// Host values that some foreign objects convert into.
pub trait FromForeign: Sized {
    fn from_foreign(value: &ForeignValue) -> Option<Self>;
}

impl<T: ToForeign + ?Sized> ToForeign for &T {
    fn to_foreign(&self) -> ForeignValue {
        (**self).to_foreign()
    }
}

impl ToForeign for ForeignValue {
    fn to_foreign(&self) -> ForeignValue {
        self.clone()
    }
}

impl FromForeign for ForeignValue {
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        Some(value.clone())
    }
}

/// `raw` unless it equals `sentinel` *and* the indicator is set.
fn unless_sentinel<T: PartialEq>(py: Python<'_>, raw: T, sentinel: T) -> Option<T> {
    if raw == sentinel && unsafe { !ffi::PyErr_Occurred().is_null() } {
        error::discard_pending(py);
        None
    } else {
        Some(raw)
    }
}

// ==================== Booleans ====================

impl ToForeign for bool {
    fn to_foreign(&self) -> ForeignValue {
        runtime::enter(|_| unsafe { adopt_or_abort(ffi::PyBool_FromLong(*self as c_long), "bool construction") })
    }
}

impl FromForeign for bool {
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        runtime::enter(|_| unsafe {
            let ptr = value.as_ptr();
            if ffi::Py_TYPE(ptr) != ptr::addr_of_mut!(ffi::PyBool_Type) {
                return None;
            }
            Some(ptr == ffi::Py_True())
        })
    }
}

// ==================== Strings ====================

impl ToForeign for str {
    fn to_foreign(&self) -> ForeignValue {
        runtime::enter(|_| unsafe {
            adopt_or_abort(
                ffi::PyUnicode_FromStringAndSize(self.as_ptr().cast(), self.len() as ffi::Py_ssize_t),
                "str construction",
            )
        })
    }
}

impl ToForeign for String {
    fn to_foreign(&self) -> ForeignValue {
        self.as_str().to_foreign()
    }
}

impl FromForeign for String {
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        runtime::enter(|py| unsafe {
            let mut size: ffi::Py_ssize_t = 0;
            let data = ffi::PyUnicode_AsUTF8AndSize(value.as_ptr(), &mut size);
            if data.is_null() {
                error::discard_pending(py);
                return None;
            }
            let bytes = std::slice::from_raw_parts(data.cast::<u8>(), size as usize);
            std::str::from_utf8(bytes).ok().map(str::to_owned)
        })
    }
}

// ==================== Numbers ====================

macro_rules! signed_conversions {
    ($($ty:ty),*) => {$(
        impl ToForeign for $ty {
            fn to_foreign(&self) -> ForeignValue {
                runtime::enter(|_| unsafe {
                    adopt_or_abort(ffi::PyLong_FromLongLong(*self as c_longlong), "int construction")
                })
            }
        }

        impl FromForeign for $ty {
            fn from_foreign(value: &ForeignValue) -> Option<Self> {
                let wide = runtime::enter(|py| {
                    let raw = unsafe { ffi::PyLong_AsLongLong(value.as_ptr()) };
                    unless_sentinel(py, raw, -1)
                })?;
                <$ty>::try_from(wide).ok()
            }
        }
    )*};
}

macro_rules! unsigned_conversions {
    ($($ty:ty),*) => {$(
        impl ToForeign for $ty {
            fn to_foreign(&self) -> ForeignValue {
                runtime::enter(|_| unsafe {
                    adopt_or_abort(ffi::PyLong_FromUnsignedLongLong(*self as c_ulonglong), "int construction")
                })
            }
        }

        impl FromForeign for $ty {
            fn from_foreign(value: &ForeignValue) -> Option<Self> {
                let wide = runtime::enter(|py| {
                    // `PyLong_AsUnsignedLongLong` only takes real ints; go
                    // through `__index__` first like the signed path does.
                    let index = unsafe { ForeignValue::from_owned_ptr(ffi::PyNumber_Index(value.as_ptr())) };
                    let Some(index) = index else {
                        error::discard_pending(py);
                        return None;
                    };
                    let raw = unsafe { ffi::PyLong_AsUnsignedLongLong(index.as_ptr()) };
                    unless_sentinel(py, raw, c_ulonglong::MAX)
                })?;
                <$ty>::try_from(wide).ok()
            }
        }
    )*};
}

signed_conversions!(i8, i16, i32, i64, isize);
unsigned_conversions!(u8, u16, u32, u64, usize);

impl ToForeign for f64 {
    fn to_foreign(&self) -> ForeignValue {
        runtime::enter(|_| unsafe { adopt_or_abort(ffi::PyFloat_FromDouble(*self), "float construction") })
    }
}

impl FromForeign for f64 {
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        runtime::enter(|py| {
            let raw = unsafe { ffi::PyFloat_AsDouble(value.as_ptr()) };
            unless_sentinel(py, raw, -1.0)
        })
    }
}

impl ToForeign for f32 {
    fn to_foreign(&self) -> ForeignValue {
        f64::from(*self).to_foreign()
    }
}

impl FromForeign for f32 {
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        let wide = f64::from_foreign(value)?;
        let narrow = wide as f32;
        // Finite values beyond `f32::MAX` are out of range, not infinite.
        (narrow.is_finite() || !wide.is_finite()).then_some(narrow)
    }
}

// ==================== Optionals ====================

impl<T: ToForeign> ToForeign for Option<T> {
    fn to_foreign(&self) -> ForeignValue {
        match self {
            Some(value) => value.to_foreign(),
            None => ForeignValue::none(),
        }
    }
}

impl<T: FromForeign> FromForeign for Option<T> {
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        if value.is_none() {
            Some(None)
        } else {
            T::from_foreign(value).map(Some)
        }
    }
}

// ==================== Sequences ====================

impl<T: ToForeign> ToForeign for [T] {
    fn to_foreign(&self) -> ForeignValue {
        let items: Vec<ForeignValue> = self.iter().map(ToForeign::to_foreign).collect();
        ForeignValue::list(&items)
    }
}

impl<T: ToForeign> ToForeign for Vec<T> {
    fn to_foreign(&self) -> ForeignValue {
        self.as_slice().to_foreign()
    }
}

impl<T: FromForeign> FromForeign for Vec<T> {
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        let mut elements = value.try_iter()?;
        // No capacity hint: a foreign `__len__` may report anything.
        let mut converted = Vec::new();
        // Any failing element discards everything converted so far.
        while let Some(element) = elements.try_next().ok()? {
            converted.push(T::from_foreign(&element)?);
        }
        Some(converted)
    }
}

// ==================== Mappings ====================

/// Snapshot of a foreign dict's entries, in iteration order.
fn dict_entries(value: &ForeignValue) -> Option<Vec<(ForeignValue, ForeignValue)>> {
    runtime::enter(|_| unsafe {
        let dict = value.as_ptr();
        if ffi::PyDict_Check(dict) == 0 {
            return None;
        }
        let mut position: ffi::Py_ssize_t = 0;
        let mut key = ptr::null_mut();
        let mut item = ptr::null_mut();
        let mut entries = Vec::new();
        // Both pointers are borrowed from the dict.
        while ffi::PyDict_Next(dict, &mut position, &mut key, &mut item) != 0 {
            entries.push((
                ForeignValue::from_borrowed_ptr(key)?,
                ForeignValue::from_borrowed_ptr(item)?,
            ));
        }
        Some(entries)
    })
}

/// A key's foreign rendering with every list, at any depth inside lists and
/// tuples, rebuilt as a tuple.
fn dict_key(key: ForeignValue) -> ForeignValue {
    let (is_list, is_tuple) = runtime::enter(|_| unsafe {
        let ptr = key.as_ptr();
        (ffi::PyList_Check(ptr) != 0, ffi::PyTuple_Check(ptr) != 0)
    });
    if !is_list && !is_tuple {
        return key;
    }
    let items: Vec<ForeignValue> = key.iter().map(dict_key).collect();
    ForeignValue::tuple(&items)
}

/// # Panics
/// If a key is a map, which has no hashable foreign rendering.
impl<K: ToForeign, V: ToForeign, S> ToForeign for HashMap<K, V, S> {
    fn to_foreign(&self) -> ForeignValue {
        ForeignValue::dict(
            self.iter()
                .map(|(key, value)| (dict_key(key.to_foreign()), value.to_foreign())),
        )
    }
}

impl<K, V, S> FromForeign for HashMap<K, V, S>
where
    K: FromForeign + Eq + Hash,
    V: FromForeign,
    S: BuildHasher + Default,
{
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        let mut map = HashMap::with_hasher(S::default());
        for (key, item) in dict_entries(value)? {
            map.insert(K::from_foreign(&key)?, V::from_foreign(&item)?);
        }
        Some(map)
    }
}

/// # Panics
/// If a key is a map, which has no hashable foreign rendering.
impl<K: ToForeign, V: ToForeign> ToForeign for BTreeMap<K, V> {
    fn to_foreign(&self) -> ForeignValue {
        ForeignValue::dict(
            self.iter()
                .map(|(key, value)| (dict_key(key.to_foreign()), value.to_foreign())),
        )
    }
}

impl<K: FromForeign + Ord, V: FromForeign> FromForeign for BTreeMap<K, V> {
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        let mut map = BTreeMap::new();
        for (key, item) in dict_entries(value)? {
            map.insert(K::from_foreign(&key)?, V::from_foreign(&item)?);
        }
        Some(map)
    }
}

// ==================== Tuples ====================

/// Items of a foreign tuple of exactly `arity` elements.
fn tuple_items(value: &ForeignValue, arity: usize) -> Option<Vec<ForeignValue>> {
    runtime::enter(|_| unsafe {
        let tuple = value.as_ptr();
        if ffi::PyTuple_Check(tuple) == 0 || ffi::PyTuple_Size(tuple) != arity as ffi::Py_ssize_t {
            return None;
        }
        (0..arity)
            .map(|index| ForeignValue::from_borrowed_ptr(ffi::PyTuple_GetItem(tuple, index as ffi::Py_ssize_t)))
            .collect()
    })
}

macro_rules! tuple_conversions {
    ($arity:expr; $($name:ident : $index:tt),+) => {
        impl<$($name: ToForeign),+> ToForeign for ($($name,)+) {
            fn to_foreign(&self) -> ForeignValue {
                ForeignValue::tuple(&[$(self.$index.to_foreign()),+])
            }
        }

        impl<$($name: FromForeign),+> FromForeign for ($($name,)+) {
            fn from_foreign(value: &ForeignValue) -> Option<Self> {
                let items = tuple_items(value, $arity)?;
                Some(($($name::from_foreign(&items[$index])?,)+))
            }
        }
    };
}

tuple_conversions!(2; A: 0, B: 1);
tuple_conversions!(3; A: 0, B: 1, C: 2);

// ==================== Ranges ====================

fn slice(start: Option<ForeignValue>, stop: Option<ForeignValue>) -> ForeignValue {
    // Absent bounds become null, which the runtime reads as `None`.
    let start_ptr = start.as_ref().map_or(ptr::null_mut(), ForeignValue::as_ptr);
    let stop_ptr = stop.as_ref().map_or(ptr::null_mut(), ForeignValue::as_ptr);
    runtime::enter(|_| unsafe {
        adopt_or_abort(ffi::PySlice_New(start_ptr, stop_ptr, ptr::null_mut()), "slice construction")
    })
}

/// `(start, stop)` of a foreign slice whose step is `None`.
fn slice_bounds(value: &ForeignValue) -> Option<(ForeignValue, ForeignValue)> {
    let is_slice = runtime::enter(|_| unsafe { ffi::PySlice_Check(value.as_ptr()) != 0 });
    if !is_slice || !value.get_attr("step")?.is_none() {
        return None;
    }
    Some((value.get_attr("start")?, value.get_attr("stop")?))
}

/// A present bound, converted. Foreign `None` is unrepresentable here.
fn bound<T: FromForeign>(value: &ForeignValue) -> Option<T> {
    if value.is_none() {
        None
    } else {
        T::from_foreign(value)
    }
}

impl<T: ToForeign> ToForeign for Range<T> {
    fn to_foreign(&self) -> ForeignValue {
        slice(Some(self.start.to_foreign()), Some(self.end.to_foreign()))
    }
}

impl<T: FromForeign> FromForeign for Range<T> {
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        let (start, stop) = slice_bounds(value)?;
        Some(bound(&start)?..bound(&stop)?)
    }
}

impl<T: ToForeign> ToForeign for RangeFrom<T> {
    fn to_foreign(&self) -> ForeignValue {
        slice(Some(self.start.to_foreign()), None)
    }
}

impl<T: FromForeign> FromForeign for RangeFrom<T> {
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        let (start, stop) = slice_bounds(value)?;
        if !stop.is_none() {
            return None;
        }
        Some(bound(&start)?..)
    }
}

impl<T: ToForeign> ToForeign for RangeTo<T> {
    fn to_foreign(&self) -> ForeignValue {
        slice(None, Some(self.end.to_foreign()))
    }
}

impl<T: FromForeign> FromForeign for RangeTo<T> {
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        let (start, stop) = slice_bounds(value)?;
        if !start.is_none() {
            return None;
        }
        Some(..bound(&stop)?)
    }
}

impl ToForeign for RangeFull {
    fn to_foreign(&self) -> ForeignValue {
        slice(None, None)
    }
}

impl FromForeign for RangeFull {
    fn from_foreign(value: &ForeignValue) -> Option<Self> {
        let (start, stop) = slice_bounds(value)?;
        (start.is_none() && stop.is_none()).then_some(..)
    }
}
