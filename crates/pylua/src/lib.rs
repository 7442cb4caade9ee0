//! Lua embedded in Python.
//!
//! This crate builds the `lua` extension module: a Lua 5.4 interpreter living
//! inside the Python process, with values flowing both ways. Lua tables,
//! functions and userdata reach Python as [`LuaObject`] proxies; Python
//! objects reach Lua as `python.object` userdata. Both directions preserve
//! identity: a value that crosses and comes back is the same value.
//!
//! Module-level functions run against a lazily created default interpreter;
//! [`LuaState`] instances are independent of it and of each other.

mod alloc;
mod call;
mod convert;
mod error;
mod exceptions;
mod host_object;
mod object;
mod options;
mod registry;
mod stack;
mod state;
mod trace;
mod trampoline;

use std::sync::OnceLock;

pub use alloc::MemoryBudget;
pub use convert::GuestKind;
pub use error::BridgeError;
pub use exceptions::{
    LuaCompileError, LuaConversionError, LuaError, LuaRuntimeError, LuaSetupError, LuaStaleReferenceError,
};
pub use host_object::TYPE_NAME as HOST_OBJECT_TYPE_NAME;
pub use object::LuaObject;
pub use options::{DEFAULT_CHUNK_NAME, MAX_MEMORY_ENV, StateOptions, TRACE_ENV};
use pyo3::{prelude::*, sync::PyOnceLock, types::PyTuple};
pub use state::{LuaState, RuntimeState, STATE_GLOBAL};
use state::source_bytes;
pub use trace::{BridgeTracer, NoopTracer, RecordingTracer, RunMode, StderrTracer, TraceEvent};
pub use trampoline::GuestError;

/// The process-wide interpreter behind the module-level functions.
///
/// Created on first use from [`StateOptions::from_env`] and kept until the
/// process exits; it is never closed, because Python's allocator (which Lua
/// uses) is already gone by the time statics could be torn down.
static DEFAULT_STATE: PyOnceLock<Py<LuaState>> = PyOnceLock::new();

/// Returns the default interpreter, creating it on first use.
pub fn default_state(py: Python<'_>) -> PyResult<&Bound<'_, LuaState>> {
    DEFAULT_STATE
        .get_or_try_init(py, || {
            let state = LuaState::open(py, &StateOptions::from_env()).map_err(|e| LuaError::new_err(py, e))?;
            Py::new(py, state)
        })
        .map(|state| state.bind(py))
}

/// Returns the package version, converting Cargo's format to Python's PEP 440.
fn get_version() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();

    VERSION.get_or_init(|| {
        let version = env!("CARGO_PKG_VERSION");
        // "1.0-alpha1" in cargo is "1.0a1" in python
        version.replace("-alpha", "a").replace("-beta", "b")
    })
}

/// Runs `source` in the default interpreter and returns what the chunk returns.
#[pyfunction]
fn execute(py: Python<'_>, source: &Bound<'_, PyAny>) -> PyResult<Py<PyAny>> {
    let source = source_bytes(source)?;
    let state = default_state(py)?;
    state
        .get()
        .runtime()
        .run(py, &source, RunMode::Execute)
        .map_err(|e| LuaError::new_err(py, e))
}

/// Evaluates the expression `source` in the default interpreter.
#[pyfunction]
fn eval(py: Python<'_>, source: &Bound<'_, PyAny>) -> PyResult<Py<PyAny>> {
    let source = source_bytes(source)?;
    let state = default_state(py)?;
    state
        .get()
        .runtime()
        .run(py, &source, RunMode::Evaluate)
        .map_err(|e| LuaError::new_err(py, e))
}

/// The default interpreter's globals table.
#[pyfunction]
fn globals(py: Python<'_>) -> PyResult<Py<PyAny>> {
    let state = default_state(py)?;
    state.get().runtime().globals(py).map_err(|e| LuaError::new_err(py, e))
}

/// Calls `require(name, *args)` in the default interpreter.
#[pyfunction]
#[pyo3(signature = (name, *args))]
fn require(py: Python<'_>, name: &Bound<'_, PyAny>, args: &Bound<'_, PyTuple>) -> PyResult<Py<PyAny>> {
    let args: Vec<Bound<'_, PyAny>> = args.iter().collect();
    let state = default_state(py)?;
    state
        .get()
        .runtime()
        .require(py, name, &args)
        .map_err(|e| LuaError::new_err(py, e))
}

/// Creates a new, independent interpreter.
#[pyfunction]
#[pyo3(signature = (*, max_memory=None, open_libs=true, trace=false))]
fn new_instance(py: Python<'_>, max_memory: Option<usize>, open_libs: bool, trace: bool) -> PyResult<LuaState> {
    let options = StateOptions::from_kwargs(max_memory, open_libs, trace);
    LuaState::open(py, &options).map_err(|e| LuaError::new_err(py, e))
}

/// Alias of `new_instance`.
#[pyfunction]
#[pyo3(signature = (*, max_memory=None, open_libs=true, trace=false))]
fn new_state(py: Python<'_>, max_memory: Option<usize>, open_libs: bool, trace: bool) -> PyResult<LuaState> {
    new_instance(py, max_memory, open_libs, trace)
}

/// Lua as a Python module.
#[pymodule]
pub mod lua {
    use pyo3::prelude::*;

    #[pymodule_export]
    use super::LuaCompileError;
    #[pymodule_export]
    use super::LuaConversionError;
    #[pymodule_export]
    use super::LuaError;
    #[pymodule_export]
    use super::LuaObject;
    #[pymodule_export]
    use super::LuaRuntimeError;
    #[pymodule_export]
    use super::LuaSetupError;
    #[pymodule_export]
    use super::LuaStaleReferenceError;
    #[pymodule_export]
    use super::LuaState;
    use super::get_version;
    #[pymodule_export]
    use super::eval;
    #[pymodule_export]
    use super::execute;
    #[pymodule_export]
    use super::globals;
    #[pymodule_export]
    use super::new_instance;
    #[pymodule_export]
    use super::new_state;
    #[pymodule_export]
    use super::require;

    #[pymodule_init]
    fn init(m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add("__version__", get_version())?;
        Ok(())
    }
}
