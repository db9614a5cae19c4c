//! Operator and comparison protocols.
//!
//! [`ForeignValue::binary`], [`ForeignValue::compare`] and friends are the
//! throwing forms. The `std::ops`, `PartialEq`, `PartialOrd` and `Hash` impls
//! are the fatal tier: incompatible operands there are a programming error
//! and panic with the drained exception.
//!
//! `!` is not overloaded. Bitwise inversion is
//! `value.unary(UnaryOp::Invert)`.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::os::raw::c_int;

use pyo3::ffi;

use crate::convert::ToForeign;
use crate::error::{self, Result};
use crate::runtime;
use crate::value::ForeignValue;

type BinaryFn = unsafe extern "C" fn(*mut ffi::PyObject, *mut ffi::PyObject) -> *mut ffi::PyObject;
type UnaryFn = unsafe extern "C" fn(*mut ffi::PyObject) -> *mut ffi::PyObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::TrueDiv => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Rem => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
        }
    }

    fn entry(self) -> BinaryFn {
        match self {
            BinaryOp::Add => ffi::PyNumber_Add,
            BinaryOp::Sub => ffi::PyNumber_Subtract,
            BinaryOp::Mul => ffi::PyNumber_Multiply,
            BinaryOp::TrueDiv => ffi::PyNumber_TrueDivide,
            BinaryOp::FloorDiv => ffi::PyNumber_FloorDivide,
            BinaryOp::Rem => ffi::PyNumber_Remainder,
            BinaryOp::BitAnd => ffi::PyNumber_And,
            BinaryOp::BitOr => ffi::PyNumber_Or,
            BinaryOp::BitXor => ffi::PyNumber_Xor,
        }
    }

    fn in_place_entry(self) -> BinaryFn {
        match self {
            BinaryOp::Add => ffi::PyNumber_InPlaceAdd,
            BinaryOp::Sub => ffi::PyNumber_InPlaceSubtract,
            BinaryOp::Mul => ffi::PyNumber_InPlaceMultiply,
            BinaryOp::TrueDiv => ffi::PyNumber_InPlaceTrueDivide,
            BinaryOp::FloorDiv => ffi::PyNumber_InPlaceFloorDivide,
            BinaryOp::Rem => ffi::PyNumber_InPlaceRemainder,
            BinaryOp::BitAnd => ffi::PyNumber_InPlaceAnd,
            BinaryOp::BitOr => ffi::PyNumber_InPlaceOr,
            BinaryOp::BitXor => ffi::PyNumber_InPlaceXor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Pos,
    Invert,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
            UnaryOp::Invert => "~",
        }
    }

    fn entry(self) -> UnaryFn {
        match self {
            UnaryOp::Neg => ffi::PyNumber_Negative,
            UnaryOp::Pos => ffi::PyNumber_Positive,
            UnaryOp::Invert => ffi::PyNumber_Invert,
        }
    }
}

/// Rich comparison operator codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn code(self) -> c_int {
        match self {
            CompareOp::Lt => ffi::Py_LT,
            CompareOp::Le => ffi::Py_LE,
            CompareOp::Eq => ffi::Py_EQ,
            CompareOp::Ne => ffi::Py_NE,
            CompareOp::Gt => ffi::Py_GT,
            CompareOp::Ge => ffi::Py_GE,
        }
    }
}

impl ForeignValue {
    /// `self <op> rhs`.
    pub fn binary(&self, op: BinaryOp, rhs: &ForeignValue) -> Result<ForeignValue> {
        self.apply(op.symbol(), |lhs| unsafe { op.entry()(lhs, rhs.as_ptr()) })
    }

    /// `self <op>= rhs`. Mutable objects may be updated in place; the result
    /// is the value to rebind to.
    pub fn in_place(&self, op: BinaryOp, rhs: &ForeignValue) -> Result<ForeignValue> {
        self.apply(op.symbol(), |lhs| unsafe { op.in_place_entry()(lhs, rhs.as_ptr()) })
    }

    /// `<op>self`.
    pub fn unary(&self, op: UnaryOp) -> Result<ForeignValue> {
        self.apply(op.symbol(), |operand| unsafe { op.entry()(operand) })
    }

    /// `self <op> rhs` reduced to a boolean.
    pub fn compare(&self, op: CompareOp, rhs: &ForeignValue) -> Result<bool> {
        runtime::enter(|py| {
            match unsafe { ffi::PyObject_RichCompareBool(self.as_ptr(), rhs.as_ptr(), op.code()) } {
                -1 => Err(error::raised_or_invalid(py, op.symbol())),
                n => Ok(n != 0),
            }
        })
    }

    /// `self <op> rhs` as the foreign result object, for types whose
    /// comparisons do not return plain booleans.
    pub fn rich_compare(&self, op: CompareOp, rhs: &ForeignValue) -> Result<ForeignValue> {
        self.apply(op.symbol(), |lhs| unsafe {
            ffi::PyObject_RichCompare(lhs, rhs.as_ptr(), op.code())
        })
    }

    /// `hash(self)`.
    pub fn foreign_hash(&self) -> Result<isize> {
        runtime::enter(|py| {
            let hash = unsafe { ffi::PyObject_Hash(self.as_ptr()) };
            if hash == -1 && unsafe { !ffi::PyErr_Occurred().is_null() } {
                Err(error::raised_or_invalid(py, "hash"))
            } else {
                Ok(hash as isize)
            }
        })
    }

    fn apply(
        &self,
        symbol: &str,
        raw: impl FnOnce(*mut ffi::PyObject) -> *mut ffi::PyObject,
    ) -> Result<ForeignValue> {
        runtime::enter(|py| {
            let result = raw(self.as_ptr());
            unsafe { ForeignValue::from_owned_ptr(result) }
                .ok_or_else(|| error::raised_or_invalid(py, &format!("operator `{symbol}`")))
        })
    }
}

fn fatal_op<T>(symbol: &str, result: Result<T>) -> T {
    result.unwrap_or_else(|e| error::fatal(&format!("operator `{symbol}`"), e))
}

macro_rules! binary_operator {
    ($op:expr, $trait:ident, $method:ident, $assign_trait:ident, $assign_method:ident) => {
        impl<T: ToForeign> std::ops::$trait<T> for &ForeignValue {
            type Output = ForeignValue;

            fn $method(self, rhs: T) -> ForeignValue {
                fatal_op($op.symbol(), self.binary($op, &rhs.to_foreign()))
            }
        }

        impl<T: ToForeign> std::ops::$trait<T> for ForeignValue {
            type Output = ForeignValue;

            fn $method(self, rhs: T) -> ForeignValue {
                std::ops::$trait::$method(&self, rhs)
            }
        }

        impl<T: ToForeign> std::ops::$assign_trait<T> for ForeignValue {
            fn $assign_method(&mut self, rhs: T) {
                *self = fatal_op($op.symbol(), self.in_place($op, &rhs.to_foreign()));
            }
        }
    };
}

binary_operator!(BinaryOp::Add, Add, add, AddAssign, add_assign);
binary_operator!(BinaryOp::Sub, Sub, sub, SubAssign, sub_assign);
binary_operator!(BinaryOp::Mul, Mul, mul, MulAssign, mul_assign);
binary_operator!(BinaryOp::TrueDiv, Div, div, DivAssign, div_assign);
binary_operator!(BinaryOp::Rem, Rem, rem, RemAssign, rem_assign);
binary_operator!(BinaryOp::BitAnd, BitAnd, bitand, BitAndAssign, bitand_assign);
binary_operator!(BinaryOp::BitOr, BitOr, bitor, BitOrAssign, bitor_assign);
binary_operator!(BinaryOp::BitXor, BitXor, bitxor, BitXorAssign, bitxor_assign);

impl std::ops::Neg for &ForeignValue {
    type Output = ForeignValue;

    fn neg(self) -> ForeignValue {
        fatal_op("-", self.unary(UnaryOp::Neg))
    }
}

impl std::ops::Neg for ForeignValue {
    type Output = ForeignValue;

    fn neg(self) -> ForeignValue {
        -&self
    }
}

impl PartialEq for ForeignValue {
    fn eq(&self, other: &Self) -> bool {
        fatal_op("==", self.compare(CompareOp::Eq, other))
    }

    #[allow(clippy::partialeq_ne_impl)]
    fn ne(&self, other: &Self) -> bool {
        fatal_op("!=", self.compare(CompareOp::Ne, other))
    }
}

impl PartialOrd for ForeignValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if fatal_op("==", self.compare(CompareOp::Eq, other)) {
            Some(Ordering::Equal)
        } else if fatal_op("<", self.compare(CompareOp::Lt, other)) {
            Some(Ordering::Less)
        } else if fatal_op(">", self.compare(CompareOp::Gt, other)) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }

    fn lt(&self, other: &Self) -> bool {
        fatal_op("<", self.compare(CompareOp::Lt, other))
    }

    fn le(&self, other: &Self) -> bool {
        fatal_op("<=", self.compare(CompareOp::Le, other))
    }

    fn gt(&self, other: &Self) -> bool {
        fatal_op(">", self.compare(CompareOp::Gt, other))
    }

    fn ge(&self, other: &Self) -> bool {
        fatal_op(">=", self.compare(CompareOp::Ge, other))
    }
}

impl Hash for ForeignValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_isize(fatal_op("hash", self.foreign_hash()));
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
    fn arithmetic() {
        let seven = 7i64.to_foreign();
        assert_eq!((&seven + 3i64).extract::<i64>(), Some(10));
        assert_eq!((&seven - 10i64).extract::<i64>(), Some(-3));
        assert_eq!((&seven * 2i64).extract::<i64>(), Some(14));
        assert_eq!((&seven / 2i64).extract::<f64>(), Some(3.5));
        assert_eq!((&seven % 4i64).extract::<i64>(), Some(3));
        assert_eq!((-&seven).extract::<i64>(), Some(-7));
        let inverted = seven.unary(UnaryOp::Invert).expect("~");
        assert_eq!(inverted.extract::<i64>(), Some(-8));
    }

    #[test]
    fn bitwise_and_floor_division() {
        let twelve = 12i64.to_foreign();
        assert_eq!((&twelve & 10i64).extract::<i64>(), Some(8));
        assert_eq!((&twelve | 3i64).extract::<i64>(), Some(15));
        assert_eq!((&twelve ^ 4i64).extract::<i64>(), Some(8));
        let floored = twelve.binary(BinaryOp::FloorDiv, &5i64.to_foreign()).expect("//");
        assert_eq!(floored.extract::<i64>(), Some(2));
        let positive = (-5i64).to_foreign().unary(UnaryOp::Pos).expect("+");
        assert_eq!(positive.extract::<i64>(), Some(-5));
    }

    #[test]
    fn strings_concatenate() {
        let greeting = "foo".to_foreign() + "bar";
        assert_eq!(greeting.extract::<String>().as_deref(), Some("foobar"));
    }

    #[test]
    fn in_place_mutates_lists() {
        let list = ForeignValue::list(&[1i64.to_foreign()]);
        let mut alias = list.clone();
        alias += vec![2i64];
        assert!(alias.ptr_eq(&list));
        assert_eq!(list.extract::<Vec<i64>>(), Some(vec![1, 2]));

        let mut counter = 1i64.to_foreign();
        counter *= 5i64;
        counter -= 1i64;
        assert_eq!(counter.extract::<i64>(), Some(4));
    }

    #[test]
    fn incompatible_operands_throw() {
        let err = 1i64
            .to_foreign()
            .binary(BinaryOp::Add, &"a".to_foreign())
            .expect_err("int + str");
        match err {
            BridgeError::Exception(pending) => assert_eq!(pending.kind(), "TypeError"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(drain_pending_error().is_none());
    }

    #[test]
    #[should_panic(expected = "operator `+`")]
    fn incompatible_operands_are_fatal() {
        let _ = 1i64.to_foreign() + "a";
    }

    #[test]
    fn comparisons() {
        let two = 2i64.to_foreign();
        let three = 3i64.to_foreign();
        assert!(two < three);
        assert!(two <= three);
        assert!(three > two);
        assert!(three >= three.clone());
        assert!(two != three);
        assert_eq!(two, 2.0f64.to_foreign());
        assert_eq!(two.partial_cmp(&three), Some(Ordering::Less));
        assert_eq!(three.partial_cmp(&two), Some(Ordering::Greater));
        assert!(two.compare(CompareOp::Ge, &three).is_ok_and(|ge| !ge));
    }

    #[test]
    fn unordered_values() {
        let left = eval("{1}");
        let right = eval("{2}");
        assert_eq!(left.partial_cmp(&right), None);
    }

    #[test]
    fn ordering_mismatch_throws() {
        let err = 1i64
            .to_foreign()
            .compare(CompareOp::Lt, &"a".to_foreign())
            .expect_err("int < str");
        assert_eq!(err.pending().expect("pending").kind(), "TypeError");
        assert!(drain_pending_error().is_none());
    }

    #[test]
    fn rich_compare_returns_foreign_result() {
        let result = 1i64
            .to_foreign()
            .rich_compare(CompareOp::Lt, &2i64.to_foreign())
            .expect("<");
        assert_eq!(result.extract::<bool>(), Some(true));
    }

    #[test]
    fn hashing() {
        let first = "key".to_foreign().foreign_hash().expect("hash");
        let second = "key".to_owned().to_foreign().foreign_hash().expect("hash");
        assert_eq!(first, second);

        let err = eval("[]").foreign_hash().expect_err("lists are unhashable");
        assert_eq!(err.pending().expect("pending").kind(), "TypeError");
    }
}
