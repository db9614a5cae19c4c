//! Call layer: marshal host arguments and invoke foreign callables.
//!
//! Every call builds a positional tuple and, when there are named arguments,
//! a keyword dict, then hands both to the runtime's generic call entry point.
//! The containers are released as soon as the call returns.
//!
//! Keyword arguments are `(name, value)` pairs. An empty name makes the
//! argument positional. A repeated name does not raise the way it would in
//! foreign call syntax: the later value overwrites the earlier one.

use std::ptr;

use pyo3::ffi;

use crate::convert::ToForeign;
use crate::error::{self, BridgeError, Result};
use crate::runtime;
use crate::value::ForeignValue;

/// Foreign containers for one call.
pub(crate) struct Marshaled {
    pub(crate) positional: ForeignValue,
    pub(crate) keywords: Option<ForeignValue>,
}

/// Split `(name, value)` pairs into a positional tuple and a keyword dict.
pub(crate) fn marshal(args: &[(&str, ForeignValue)]) -> Marshaled {
    let positional: Vec<ForeignValue> = args
        .iter()
        .filter(|(name, _)| name.is_empty())
        .map(|(_, value)| value.clone())
        .collect();
    let named: Vec<(ForeignValue, ForeignValue)> = args
        .iter()
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.to_foreign(), value.clone()))
        .collect();
    Marshaled {
        positional: ForeignValue::tuple(&positional),
        keywords: (!named.is_empty()).then(|| ForeignValue::dict(named)),
    }
}

impl ForeignValue {
    /// `self(*args)`.
    pub fn try_call(&self, args: &[ForeignValue]) -> Result<ForeignValue> {
        let marshaled = Marshaled {
            positional: ForeignValue::tuple(args),
            keywords: None,
        };
        self.invoke(&marshaled)
    }

    /// `self(*positional, **named)`; see the module docs for how names are
    /// treated.
    pub fn try_call_with_keywords(&self, args: &[(&str, ForeignValue)]) -> Result<ForeignValue> {
        self.invoke(&marshal(args))
    }

    /// [`try_call`](Self::try_call) for callers that know the call succeeds.
    ///
    /// # Panics
    /// If the call raises or is rejected.
    pub fn call(&self, args: &[ForeignValue]) -> ForeignValue {
        self.try_call(args)
            .unwrap_or_else(|e| error::fatal(&format!("call of `{}`", self.type_name()), e))
    }

    /// # Panics
    /// If the call raises or is rejected.
    pub fn call_with_keywords(&self, args: &[(&str, ForeignValue)]) -> ForeignValue {
        self.try_call_with_keywords(args)
            .unwrap_or_else(|e| error::fatal(&format!("call of `{}`", self.type_name()), e))
    }

    /// `self.name(*args)`. A missing method surfaces as the foreign
    /// `AttributeError`.
    pub fn try_call_method(&self, name: &str, args: &[ForeignValue]) -> Result<ForeignValue> {
        self.try_attr(name)?.try_call(args)
    }

    pub fn try_call_method_with_keywords(
        &self,
        name: &str,
        args: &[(&str, ForeignValue)],
    ) -> Result<ForeignValue> {
        self.try_attr(name)?.try_call_with_keywords(args)
    }

    /// # Panics
    /// If the method is missing, raises, or is rejected.
    pub fn call_method(&self, name: &str, args: &[ForeignValue]) -> ForeignValue {
        self.try_call_method(name, args)
            .unwrap_or_else(|e| error::fatal(&format!("method `{name}`"), e))
    }

    fn invoke(&self, args: &Marshaled) -> Result<ForeignValue> {
        runtime::enter(|py| {
            if unsafe { ffi::PyCallable_Check(self.as_ptr()) } == 0 {
                let reason = format!("`{}` object is not callable", self.type_name());
                tracing::debug!(%reason, "rejected foreign call");
                return Err(BridgeError::invalid_call(reason));
            }
            let keywords = args.keywords.as_ref().map_or(ptr::null_mut(), ForeignValue::as_ptr);
            let raw = unsafe { ffi::PyObject_Call(self.as_ptr(), args.positional.as_ptr(), keywords) };
            unsafe { ForeignValue::from_owned_ptr(raw) }.ok_or_else(|| error::raised_or_invalid(py, "call"))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::drain_pending_error;
    use crate::runtime::Runtime;

    fn eval(expression: &str) -> ForeignValue {
        Runtime::get().eval(expression).expect("eval")
    }

    #[test]
    fn marshal_splits_positional_and_named() {
        let marshaled = marshal(&[
            ("", 1i64.to_foreign()),
            ("b", 2i64.to_foreign()),
            ("", 3i64.to_foreign()),
            ("c", 4i64.to_foreign()),
        ]);
        assert_eq!(marshaled.positional.extract::<(i64, i64)>(), Some((1, 3)));
        let keywords = marshaled.keywords.expect("keywords");
        let keywords: HashMap<String, i64> = keywords.extract().expect("dict");
        assert_eq!(keywords, HashMap::from([("b".to_owned(), 2), ("c".to_owned(), 4)]));
    }

    #[test]
    fn marshal_without_names_has_no_dict() {
        let marshaled = marshal(&[("", 1i64.to_foreign())]);
        assert!(marshaled.keywords.is_none());
        assert_eq!(marshaled.positional.len(), Some(1));
    }

    #[test]
    fn repeated_keyword_overwrites() {
        let marshaled = marshal(&[("k", 1i64.to_foreign()), ("k", 2i64.to_foreign())]);
        let keywords: HashMap<String, i64> = marshaled.keywords.expect("keywords").extract().expect("dict");
        assert_eq!(keywords, HashMap::from([("k".to_owned(), 2)]));
    }

    #[test]
    fn call_reaches_callee_with_split_arguments() {
        let echo = eval("lambda *args, **kwargs: (args, kwargs)");
        let result = echo.call_with_keywords(&[
            ("", "p".to_foreign()),
            ("scale", 2.5f64.to_foreign()),
        ]);
        let (args, kwargs) = result.extract::<(Vec<String>, HashMap<String, f64>)>().expect("pair");
        assert_eq!(args, vec!["p".to_owned()]);
        assert_eq!(kwargs, HashMap::from([("scale".to_owned(), 2.5)]));
    }

    #[test]
    fn non_callable_is_invalid_call() {
        let err = 42i64.to_foreign().try_call(&[]).expect_err("not callable");
        match err {
            BridgeError::InvalidCall { reason } => assert!(reason.contains("int")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(drain_pending_error().is_none());
    }

    #[test]
    fn raising_callee_is_exception() {
        let int = Runtime::get().builtin("int");
        let err = int.try_call(&["abc".to_foreign()]).expect_err("bad literal");
        assert_eq!(err.pending().expect("pending").kind(), "ValueError");
        assert!(drain_pending_error().is_none());
    }

    #[test]
    fn bad_arity_is_exception() {
        let unary = eval("lambda x: x");
        let err = unary.try_call(&[]).expect_err("missing argument");
        assert_eq!(err.pending().expect("pending").kind(), "TypeError");
    }

    #[test]
    fn methods() {
        let list = ForeignValue::list(&[]);
        list.call_method("append", &[7i64.to_foreign()]);
        assert_eq!(list.extract::<Vec<i64>>(), Some(vec![7]));

        let err = list.try_call_method("no_such_method", &[]).expect_err("missing");
        assert_eq!(err.pending().expect("pending").kind(), "AttributeError");

        let sorted = Runtime::get().builtin("sorted").call_with_keywords(&[
            ("", vec![1i64, 3, 2].to_foreign()),
            ("reverse", true.to_foreign()),
        ]);
        assert_eq!(sorted.extract::<Vec<i64>>(), Some(vec![3, 2, 1]));
    }

    #[test]
    #[should_panic(expected = "ZeroDivisionError")]
    fn fatal_call_panics_with_the_exception() {
        eval("lambda: 1 / 0").call(&[]);
    }
}
