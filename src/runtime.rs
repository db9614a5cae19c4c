//! Runtime interface: process-wide access to the embedded interpreter.
//!
//! Every raw entry-point call made by this crate runs inside [`enter`], which
//! takes a process-wide re-entrant lock and then the GIL, always in that
//! order. The lock serializes bridge traffic across host threads without
//! leaning on any locking the interpreter may or may not do internally.
//!
//! **Lock order:** do not call into the bridge from code that already holds
//! the GIL through some other path. A thread parked on the bridge lock while
//! holding the GIL can deadlock against a bridge call waiting for the GIL.
//!
//! The [`Runtime`] singleton is created once per process on first use and is
//! never torn down; interpreter finalization belongs to the host.

use std::env;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::ReentrantMutex;
use pyo3::ffi;
use pyo3::Python;

use crate::convert::{FromForeign, ToForeign};
use crate::error::{self, BridgeError, Result};
use crate::value::ForeignValue;

/// Environment variable holding extra module search paths, in the
/// platform's path-list syntax (`:`-separated on Unix).
pub const SEARCH_PATH_ENV: &str = "PYBRIDGE_PATH";

/// Gate around every raw entry-point call.
static RAW_CALLS: Lazy<ReentrantMutex<()>> = Lazy::new(|| ReentrantMutex::new(()));

static BOOT: OnceCell<()> = OnceCell::new();

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Run `f` with the bridge lock and the GIL held.
///
/// Re-entrant: nested bridge operations on the same thread are fine.
pub(crate) fn enter<R>(f: impl FnOnce(Python<'_>) -> R) -> R {
    BOOT.get_or_init(boot_interpreter);
    let _guard = RAW_CALLS.lock();
    Python::with_gil(f)
}

fn boot_interpreter() {
    #[cfg(target_os = "linux")]
    promote_libpython_symbols();

    // No signal handlers: the host owns the process.
    pyo3::prepare_freethreaded_python();
    tracing::debug!("embedded interpreter ready");
}

/// Re-open `libpython` with `RTLD_GLOBAL` so native extension modules
/// (NumPy and friends) can resolve interpreter symbols.
#[cfg(target_os = "linux")]
fn promote_libpython_symbols() {
    use libc::{dlopen, RTLD_GLOBAL, RTLD_NOLOAD, RTLD_NOW};

    let candidates: &[&[u8]] = &[
        b"libpython3.so\0",
        b"libpython3.13.so\0",
        b"libpython3.12.so\0",
        b"libpython3.11.so\0",
        b"libpython3.10.so\0",
    ];
    for name in candidates {
        unsafe {
            let loaded = dlopen(name.as_ptr().cast(), RTLD_NOW | RTLD_NOLOAD);
            if !loaded.is_null() {
                dlopen(name.as_ptr().cast(), RTLD_NOW | RTLD_GLOBAL);
                tracing::trace!(
                    library = %String::from_utf8_lossy(&name[..name.len() - 1]),
                    "promoted interpreter symbols to global scope"
                );
                return;
            }
        }
    }
}

/// Import a module by dotted name.
pub(crate) fn import_module(name: &str) -> Result<ForeignValue> {
    let c_name = CString::new(name).map_err(|_| BridgeError::InvalidModule {
        name: name.to_owned(),
        cause: None,
    })?;
    enter(|py| {
        let raw = unsafe { ffi::PyImport_ImportModule(c_name.as_ptr()) };
        match unsafe { ForeignValue::from_owned_ptr(raw) } {
            Some(module) => {
                tracing::trace!(module = name, "imported");
                Ok(module)
            }
            None => {
                let cause = error::take_pending(py);
                tracing::debug!(module = name, cause = ?cause, "import failed");
                Err(BridgeError::InvalidModule {
                    name: name.to_owned(),
                    cause,
                })
            }
        }
    })
}

// ==================== Configuration ====================

/// Settings applied when the [`Runtime`] singleton is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Directories prepended to `sys.path`, highest priority first.
    pub search_paths: Vec<PathBuf>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Build a configuration from [`SEARCH_PATH_ENV`].
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(paths) = env::var_os(SEARCH_PATH_ENV) {
            config.search_paths.extend(
                env::split_paths(&paths).filter(|path| !path.as_os_str().is_empty()),
            );
        }
        config
    }
}

// ==================== Runtime interface ====================

/// Process-wide handle on the interpreter's builtins and import machinery.
pub struct Runtime {
    builtins: ForeignValue,
    sys: ForeignValue,
    main_namespace: ForeignValue,
}

impl Runtime {
    /// Create the singleton with `config`.
    ///
    /// If the singleton already exists it is returned unchanged and `config`
    /// is ignored.
    pub fn init(config: RuntimeConfig) -> Result<&'static Runtime> {
        let mut created = false;
        let runtime = RUNTIME.get_or_try_init(|| {
            created = true;
            Runtime::create(&config)
        })?;
        if !created && !config.search_paths.is_empty() {
            tracing::warn!(
                paths = ?config.search_paths,
                "runtime already initialized; search paths ignored"
            );
        }
        Ok(runtime)
    }

    /// The singleton, created from [`RuntimeConfig::from_env`] on first use.
    ///
    /// # Panics
    /// If the interpreter cannot provide `builtins`, `sys` or `__main__`.
    pub fn get() -> &'static Runtime {
        if let Some(runtime) = RUNTIME.get() {
            return runtime;
        }
        match Runtime::init(RuntimeConfig::from_env()) {
            Ok(runtime) => runtime,
            Err(e) => panic!("cannot create the runtime interface: {e}"),
        }
    }

    fn create(config: &RuntimeConfig) -> Result<Runtime> {
        let builtins = import_module("builtins")?;
        let sys = import_module("sys")?;
        let main_namespace = import_module("__main__")?.try_attr("__dict__")?;
        let runtime = Runtime {
            builtins,
            sys,
            main_namespace,
        };
        for path in &config.search_paths {
            runtime.add_search_path(path)?;
        }
        tracing::debug!(version = %runtime.version(), "runtime interface created");
        Ok(runtime)
    }

    /// Prepend `path` to `sys.path`.
    pub fn add_search_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let entry = path.as_ref().to_string_lossy().into_owned();
        self.sys
            .try_attr("path")?
            .try_call_method("insert", &[0i64.to_foreign(), entry.to_foreign()])?;
        tracing::debug!(path = %entry, "prepended to sys.path");
        Ok(())
    }

    /// Import a module, failing with [`BridgeError::InvalidModule`].
    pub fn import(&self, name: &str) -> Result<ForeignValue> {
        import_module(name)
    }

    pub fn builtins(&self) -> &ForeignValue {
        &self.builtins
    }

    /// A builtin by name, e.g. `len` or `isinstance`.
    ///
    /// # Panics
    /// If no such builtin exists.
    pub fn builtin(&self, name: &str) -> ForeignValue {
        self.builtins.attr(name)
    }

    pub fn none(&self) -> ForeignValue {
        ForeignValue::none()
    }

    /// The `__main__` module's globals, used by [`eval`](Self::eval) and
    /// [`exec`](Self::exec).
    pub fn main_namespace(&self) -> &ForeignValue {
        &self.main_namespace
    }

    /// `sys.version`.
    pub fn version(&self) -> String {
        self.sys
            .get_attr("version")
            .and_then(|version| String::from_foreign(&version))
            .unwrap_or_default()
    }

    /// `(major, minor, micro)` from `sys.version_info`.
    pub fn version_info(&self) -> (u32, u32, u32) {
        let info = self.sys.get_attr("version_info");
        let part = |name: &str| {
            info.as_ref()
                .and_then(|info| info.get_attr(name))
                .and_then(|part| u32::from_foreign(&part))
                .unwrap_or(0)
        };
        (part("major"), part("minor"), part("micro"))
    }

    /// Evaluate an expression in the `__main__` namespace.
    pub fn eval(&self, expression: &str) -> Result<ForeignValue> {
        self.builtin("eval")
            .try_call(&[expression.to_foreign(), self.main_namespace.clone()])
    }

    /// Execute statements in the `__main__` namespace.
    pub fn exec(&self, code: &str) -> Result<()> {
        self.builtin("exec")
            .try_call(&[code.to_foreign(), self.main_namespace.clone()])
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder_keeps_order() {
        let config = RuntimeConfig::new()
            .with_search_path("/first")
            .with_search_path("/second");
        assert_eq!(
            config.search_paths,
            vec![PathBuf::from("/first"), PathBuf::from("/second")]
        );
    }

    #[test]
    fn singleton_is_shared() {
        let first = Runtime::get() as *const Runtime;
        let second = Runtime::init(RuntimeConfig::new()).expect("runtime") as *const Runtime;
        assert_eq!(first, second);
    }

    #[test]
    fn reports_python_three() {
        let (major, _, _) = Runtime::get().version_info();
        assert_eq!(major, 3);
        assert!(Runtime::get().version().starts_with('3'));
    }

    #[test]
    fn missing_module_is_invalid_module() {
        let err = Runtime::get()
            .import("pybridge_no_such_module")
            .expect_err("import should fail");
        match err {
            BridgeError::InvalidModule { name, cause } => {
                assert_eq!(name, "pybridge_no_such_module");
                assert_eq!(cause.expect("pending error").kind(), "ModuleNotFoundError");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(error::drain_pending_error().is_none());
    }

    #[test]
    fn exec_then_eval_share_main_namespace() {
        let runtime = Runtime::get();
        runtime.exec("pybridge_answer = 6 * 7").expect("exec");
        let answer = runtime.eval("pybridge_answer").expect("eval");
        assert_eq!(i64::from_foreign(&answer), Some(42));
    }

    #[test]
    fn builtin_lookup() {
        let len = Runtime::get().builtin("len");
        let n = len.call(&[vec![1i64, 2, 3].to_foreign()]);
        assert_eq!(usize::from_foreign(&n), Some(3));
    }
}
