//! Configuration for a Lua interpreter instance.

use std::{env, sync::Arc};

use crate::trace::{BridgeTracer, NoopTracer, StderrTracer};

/// Environment variable enabling [`StderrTracer`] for instances built by
/// [`StateOptions::from_env`] (`1`, `true` or `stderr`).
pub const TRACE_ENV: &str = "PYLUA_TRACE";

/// Environment variable setting the memory budget, in bytes, for instances
/// built by [`StateOptions::from_env`].
pub const MAX_MEMORY_ENV: &str = "PYLUA_MAX_MEMORY";

/// Chunk name used for source loaded through `execute`/`eval`.
pub const DEFAULT_CHUNK_NAME: &str = "=<python>";

/// Options used when opening a [`RuntimeState`](crate::RuntimeState).
#[derive(Debug, Clone)]
pub struct StateOptions {
    /// Upper bound on bytes the interpreter may hold. `None` means unlimited.
    pub max_memory: Option<usize>,
    /// Whether the Lua standard library is opened.
    pub open_libs: bool,
    /// Chunk name reported in Lua error messages.
    pub chunk_name: String,
    /// Tracer receiving bridge events.
    pub tracer: Arc<dyn BridgeTracer>,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            max_memory: None,
            open_libs: true,
            chunk_name: DEFAULT_CHUNK_NAME.to_owned(),
            tracer: Arc::new(NoopTracer),
        }
    }
}

impl StateOptions {
    /// Creates the default options: unlimited memory, standard library opened,
    /// no tracing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds options from [`TRACE_ENV`] and [`MAX_MEMORY_ENV`].
    ///
    /// Unparseable values are ignored rather than failing interpreter creation.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(env::var(TRACE_ENV).ok().as_deref(), env::var(MAX_MEMORY_ENV).ok().as_deref())
    }

    fn from_vars(trace: Option<&str>, max_memory: Option<&str>) -> Self {
        let mut options = Self::default();
        if trace.is_some_and(trace_enabled) {
            options.tracer = Arc::new(StderrTracer);
        }
        options.max_memory = max_memory.and_then(|raw| raw.trim().parse().ok());
        options
    }

    /// Sets the memory budget in bytes.
    #[must_use]
    pub fn max_memory(mut self, limit: Option<usize>) -> Self {
        self.max_memory = limit;
        self
    }

    /// Sets whether the standard library is opened.
    #[must_use]
    pub fn open_libs(mut self, open: bool) -> Self {
        self.open_libs = open;
        self
    }

    /// Sets the chunk name reported in Lua error messages.
    #[must_use]
    pub fn chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }

    /// Sets the tracer.
    #[must_use]
    pub fn tracer(mut self, tracer: Arc<dyn BridgeTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Options as given by the Python keyword arguments of `LuaState(...)`.
    pub(crate) fn from_kwargs(max_memory: Option<usize>, open_libs: bool, trace: bool) -> Self {
        let options = Self::default().max_memory(max_memory).open_libs(open_libs);
        if trace {
            options.tracer(Arc::new(StderrTracer))
        } else {
            options
        }
    }
}

fn trace_enabled(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "stderr")
}
