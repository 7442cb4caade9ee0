use std::fmt;

use pyo3::PyErr;

use crate::trampoline::GuestError;

/// Error type for every bridge operation, separated by failure class.
///
/// Keeping setup/conversion/compile/runtime/stale failures distinct lets the
/// Python layer raise the matching exception class without string matching.
#[derive(Debug)]
pub enum BridgeError {
    /// The Lua interpreter could not be created or bootstrapped.
    Setup(String),
    /// A value could not cross the boundary.
    Conversion(String),
    /// Lua source failed to load.
    Compile(String),
    /// Lua code raised an error (or ran out of memory) while executing.
    Runtime(String),
    /// The proxy's runtime was closed or its registry slot is gone.
    StaleReference(String),
    /// Structural misuse, e.g. writing a key on something that is not a table.
    Type(String),
    /// A Python exception raised while inspecting or building host values.
    Host(PyErr),
}

impl BridgeError {
    /// The error every operation on a stale proxy reports.
    #[must_use]
    pub fn lost_reference() -> Self {
        Self::StaleReference("lost reference".to_owned())
    }

    /// Human-readable message without the class prefix.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Setup(msg)
            | Self::Conversion(msg)
            | Self::Compile(msg)
            | Self::Runtime(msg)
            | Self::StaleReference(msg)
            | Self::Type(msg) => msg.clone(),
            Self::Host(err) => err.to_string(),
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(msg) => write!(f, "setup error: {msg}"),
            Self::Conversion(msg) => write!(f, "conversion error: {msg}"),
            Self::Compile(msg) => write!(f, "compile error: {msg}"),
            Self::Runtime(msg) => write!(f, "runtime error: {msg}"),
            Self::StaleReference(msg) => write!(f, "stale reference: {msg}"),
            Self::Type(msg) => write!(f, "type error: {msg}"),
            Self::Host(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<PyErr> for BridgeError {
    fn from(err: PyErr) -> Self {
        Self::Host(err)
    }
}

impl From<GuestError> for BridgeError {
    /// A guest error with no better context is a runtime error.
    fn from(err: GuestError) -> Self {
        Self::Runtime(err.into_message())
    }
}
