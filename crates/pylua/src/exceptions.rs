//! Python exception classes raised by the bridge.
//!
//! ## Exception Hierarchy
//!
//! ```text
//! LuaError(Exception)            # Base class for all bridge exceptions
//! ├── LuaSetupError              # The interpreter could not be created
//! ├── LuaConversionError         # A value could not cross the boundary
//! ├── LuaCompileError            # Lua source failed to load
//! ├── LuaRuntimeError            # Lua code raised or ran out of memory
//! └── LuaStaleReferenceError     # The proxy's interpreter is gone
//! ```
//!
//! Structural misuse (writing into a non-table, iterating a function) raises
//! the builtin `TypeError` instead, and Python exceptions raised while
//! inspecting host values propagate unchanged.

use pyo3::{PyClassInitializer, exceptions, prelude::*};

use crate::error::BridgeError;

/// Base exception for all bridge errors.
///
/// Catching `LuaError` catches every exception class listed in the module docs.
#[pyclass(name = "LuaError", extends = exceptions::PyException, module = "lua", subclass)]
#[derive(Debug, Clone)]
pub struct LuaError {
    /// The human-readable message, without class prefix.
    message: String,
}

impl LuaError {
    /// Converts a [`BridgeError`] into the matching Python exception.
    #[must_use]
    pub fn new_err(py: Python<'_>, err: BridgeError) -> PyErr {
        match err {
            BridgeError::Setup(msg) => LuaSetupError::new_err(py, msg),
            BridgeError::Conversion(msg) => LuaConversionError::new_err(py, msg),
            BridgeError::Compile(msg) => LuaCompileError::new_err(py, msg),
            BridgeError::Runtime(msg) => LuaRuntimeError::new_err(py, msg),
            BridgeError::StaleReference(msg) => LuaStaleReferenceError::new_err(py, msg),
            BridgeError::Type(msg) => exceptions::PyTypeError::new_err(msg),
            BridgeError::Host(err) => err,
        }
    }

    fn base(message: String) -> Self {
        Self { message }
    }
}

#[pymethods]
impl LuaError {
    /// The error message reported by the bridge or by Lua.
    #[getter]
    fn message(&self) -> &str {
        &self.message
    }

    fn __str__(&self) -> String {
        self.message.clone()
    }

    fn __repr__(slf: &Bound<'_, Self>) -> PyResult<String> {
        let name = slf.get_type().name()?;
        Ok(format!("{name}({:?})", slf.borrow().message))
    }
}

/// Declares a `LuaError` subclass plus its `new_err` constructor.
macro_rules! lua_error_subclass {
    ($(#[$doc:meta])* $rust_name:ident, $py_name:literal) => {
        $(#[$doc])*
        #[pyclass(name = $py_name, extends = LuaError, module = "lua")]
        #[derive(Debug, Clone)]
        pub struct $rust_name;

        impl $rust_name {
            /// Creates the exception with the given message.
            #[must_use]
            pub fn new_err(py: Python<'_>, message: String) -> PyErr {
                let init = PyClassInitializer::from(LuaError::base(message)).add_subclass(Self);
                match Py::new(py, init) {
                    Ok(err) => PyErr::from_value(err.into_bound(py).into_any()),
                    Err(e) => e,
                }
            }
        }
    };
}

lua_error_subclass!(
    /// Raised when an interpreter instance cannot be created or bootstrapped.
    ///
    /// The instance that failed is never returned to the caller.
    LuaSetupError,
    "LuaSetupError"
);

lua_error_subclass!(
    /// Raised when a value cannot be converted across the boundary, e.g. `None`
    /// used as a table key or call argument.
    LuaConversionError,
    "LuaConversionError"
);

lua_error_subclass!(
    /// Raised when Lua source fails to load. The instance remains usable.
    LuaCompileError,
    "LuaCompileError"
);

lua_error_subclass!(
    /// Raised when Lua code errors during execution. The instance remains usable.
    LuaRuntimeError,
    "LuaRuntimeError"
);

lua_error_subclass!(
    /// Raised by any operation on a proxy whose interpreter was closed.
    LuaStaleReferenceError,
    "LuaStaleReferenceError"
);

impl From<BridgeError> for PyErr {
    fn from(err: BridgeError) -> Self {
        Python::attach(|py| LuaError::new_err(py, err))
    }
}
