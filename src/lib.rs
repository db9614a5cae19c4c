//! pybridge: host-side access to objects living in an embedded Python runtime.
//!
//! The bridge wraps the interpreter's raw C entry points in a small, typed
//! surface:
//!
//! - Reference ownership (`ForeignHandle`, retain/adopt, release on drop)
//! - A shared value type (`ForeignValue`) with member/item access, calls,
//!   operators, comparisons and iteration
//! - Host ↔ foreign conversions (`ToForeign` / `FromForeign`)
//! - Exception reflection (`PendingError`, `BridgeError`)
//! - A process-wide runtime interface (`Runtime`) for imports and builtins
//!
//! Every raw call runs under one process-wide lock and the GIL, and every
//! call that can raise drains the interpreter's error indicator before
//! returning.
//!
//! ```no_run
//! use pybridge::{Runtime, ToForeign};
//!
//! let math = Runtime::get().import("math")?;
//! let root = math.call_method("sqrt", &[16.0f64.to_foreign()]);
//! assert_eq!(root.extract::<f64>(), Some(4.0));
//! # Ok::<(), pybridge::BridgeError>(())
//! ```

pub mod call;
pub mod convert;
pub mod error;
pub mod handle;
pub mod iter;
pub mod ops;
pub mod runtime;
pub mod value;

pub use convert::{FromForeign, ToForeign};
pub use error::{drain_pending_error, BridgeError, PendingError, Result};
pub use handle::{ForeignHandle, Ownership};
pub use iter::ForeignIter;
pub use ops::{BinaryOp, CompareOp, UnaryOp};
pub use runtime::{Runtime, RuntimeConfig, SEARCH_PATH_ENV};
pub use value::ForeignValue;
