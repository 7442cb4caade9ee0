use std::{
    borrow::Cow,
    ffi::{CStr, CString, c_int, c_void},
    fmt, ptr,
    sync::{
        Arc,
        atomic::{AtomicPtr, AtomicUsize, Ordering},
    },
};

use mlua_sys as ffi;
use pyo3::{
    exceptions::PyTypeError,
    prelude::*,
    types::{PyBytes, PyString, PyTuple},
};

use crate::{
    alloc::{MemoryBudget, host_alloc},
    call::call_pushed,
    convert::to_host,
    error::BridgeError,
    exceptions::LuaError,
    host_object,
    options::StateOptions,
    stack::{StackGuard, reserve},
    trace::{BridgeTracer, RunMode},
    trampoline::{GuestError, on_unprotected_error, protect},
};

/// Name of the Lua global holding the runtime handle. Informational only:
/// the bridge reads the registry copy, which Lua code cannot reach.
pub const STATE_GLOBAL: &CStr = c"_PyLuaState";

/// Registry key under which the runtime stores a pointer to itself.
static RUNTIME_KEY: u8 = 0;

fn runtime_key() -> *const c_void {
    (&raw const RUNTIME_KEY).cast()
}

/// One Lua interpreter plus the bookkeeping the bridge needs around it.
///
/// Shared through `Arc`: the owning [`LuaState`] and every registry anchor
/// hold a strong reference. The interpreter is torn down by [`close`] or when
/// the last reference drops, whichever comes first; after that the state
/// pointer is null and every operation reports a stale reference.
///
/// [`close`]: RuntimeState::close
pub struct RuntimeState {
    state: AtomicPtr<ffi::lua_State>,
    /// Allocator user data; must outlive the interpreter.
    budget: Box<MemoryBudget>,
    tracer: Arc<dyn BridgeTracer>,
    chunk_name: CString,
    /// Number of live stack guards.
    active: AtomicUsize,
}

impl RuntimeState {
    /// Creates and bootstraps a new interpreter.
    ///
    /// Requires the Python token because the allocator uses Python's heap.
    pub fn open(_py: Python<'_>, options: &StateOptions) -> Result<Arc<Self>, BridgeError> {
        let chunk_name = CString::new(options.chunk_name.as_str())
            .map_err(|_| BridgeError::Setup("chunk name contains a NUL byte".to_owned()))?;
        let budget = Box::new(MemoryBudget::new(options.max_memory));
        let ud = ptr::from_ref::<MemoryBudget>(&*budget).cast_mut().cast::<c_void>();
        // SAFETY: the budget is boxed and owned by the runtime, which closes
        // the interpreter before dropping it.
        let state = unsafe { ffi::lua_newstate(host_alloc, ud) };
        if state.is_null() {
            return Err(BridgeError::Setup("cannot create Lua state: not enough memory".to_owned()));
        }
        // SAFETY: `state` was just created.
        unsafe { ffi::lua_atpanic(state, on_unprotected_error) };

        let runtime = Arc::new(Self {
            state: AtomicPtr::new(state),
            budget,
            tracer: Arc::clone(&options.tracer),
            chunk_name,
            active: AtomicUsize::new(0),
        });
        // on failure `runtime` drops here, closing the half-built interpreter
        // SAFETY: `state` is live and empty.
        unsafe { runtime.bootstrap(state, options.open_libs) }?;
        runtime.tracer.on_open(runtime.budget.limit());
        Ok(runtime)
    }

    unsafe fn bootstrap(&self, state: *mut ffi::lua_State, open_libs: bool) -> Result<(), BridgeError> {
        let handle = ptr::from_ref(self).cast_mut().cast::<c_void>();
        // SAFETY: forwarded from the caller.
        unsafe {
            reserve(state, 3).map_err(|err| BridgeError::Setup(err.into_message()))?;
            ffi::lua_pushlightuserdata(state, handle);
            ffi::lua_pushboolean(state, c_int::from(open_libs));
            protect(state, bootstrap, 2, 0)
        }
        .map_err(|err| BridgeError::Setup(format!("can't initialize Lua state: {err}")))
    }

    /// Recovers the runtime from inside a C function called by Lua.
    ///
    /// # Safety
    /// `state` must be an interpreter created by [`RuntimeState::open`] (or
    /// one of its threads) that is currently running.
    pub(crate) unsafe fn from_lua(state: *mut ffi::lua_State) -> Result<Arc<Self>, BridgeError> {
        // SAFETY: forwarded from the caller; `lua_rawgetp` never raises.
        let handle = unsafe {
            reserve(state, 1)?;
            ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, runtime_key());
            let handle = ffi::lua_touserdata(state, -1).cast::<Self>().cast_const();
            ffi::lua_pop(state, 1);
            handle
        };
        if handle.is_null() {
            return Err(BridgeError::StaleReference("Lua state is closing".to_owned()));
        }
        // SAFETY: the registry entry points into a live `Arc` allocation; it
        // is cleared before the runtime is freed.
        unsafe {
            Arc::increment_strong_count(handle);
            Ok(Arc::from_raw(handle))
        }
    }

    /// The live interpreter, or a stale-reference error once closed.
    pub(crate) fn raw(&self) -> Result<*mut ffi::lua_State, BridgeError> {
        let state = self.state.load(Ordering::Acquire);
        if state.is_null() {
            Err(BridgeError::lost_reference())
        } else {
            Ok(state)
        }
    }

    /// Starts a guarded operation.
    pub(crate) fn guard(&self) -> Result<StackGuard<'_>, BridgeError> {
        StackGuard::new(self)
    }

    pub(crate) fn enter(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Reports a guest error to the tracer and passes it on.
    pub(crate) fn observe(&self, err: GuestError) -> GuestError {
        self.tracer.on_guest_error(err.message());
        err
    }

    /// The tracer receiving this runtime's events.
    #[must_use]
    pub fn tracer(&self) -> &dyn BridgeTracer {
        self.tracer.as_ref()
    }

    /// Whether the interpreter has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire).is_null()
    }

    /// Bytes currently held by the interpreter.
    #[must_use]
    pub fn memory_used(&self) -> usize {
        self.budget.used()
    }

    /// The configured memory budget, if any.
    #[must_use]
    pub fn memory_limit(&self) -> Option<usize> {
        self.budget.limit()
    }

    /// Current depth of the Lua stack; 0 when closed.
    #[must_use]
    pub fn stack_depth(&self) -> usize {
        self.raw().map_or(0, |state| {
            // SAFETY: `raw` only returns live interpreters.
            usize::try_from(unsafe { ffi::lua_gettop(state) }).unwrap_or_default()
        })
    }

    /// Runs a chunk of Lua source.
    ///
    /// `Evaluate` turns the source into `return <source>`. The result is the
    /// chunk's first return value, `None` when there is none.
    pub fn run(self: &Arc<Self>, py: Python<'_>, source: &[u8], mode: RunMode) -> Result<Py<PyAny>, BridgeError> {
        self.tracer.on_run(mode, source.len());
        let code: Cow<'_, [u8]> = match mode {
            RunMode::Execute => Cow::Borrowed(source),
            RunMode::Evaluate => Cow::Owned([b"return ".as_slice(), source].concat()),
        };
        let guard = self.guard()?;
        let state = guard.state();
        // SAFETY: the guard holds a live interpreter; loading reports errors
        // through its status and never raises.
        let status = unsafe {
            reserve(state, 1)?;
            ffi::luaL_loadbufferx(
                state,
                code.as_ptr().cast(),
                code.len(),
                self.chunk_name.as_ptr(),
                c"t".as_ptr(),
            )
        };
        if status != ffi::LUA_OK {
            // SAFETY: a failed load leaves the error value on top.
            let err = self.observe(unsafe { GuestError::pop(state, status) });
            let message = format!("error loading code: {err}");
            // running out of memory while parsing is not a syntax problem
            return Err(if err.is_memory_error() {
                BridgeError::Runtime(message)
            } else {
                BridgeError::Compile(message)
            });
        }
        // SAFETY: the compiled chunk is on top.
        let status = unsafe { ffi::lua_pcall(state, 0, 1, 0) };
        if status != ffi::LUA_OK {
            // SAFETY: a failed call leaves the error value on top.
            let err = self.observe(unsafe { GuestError::pop(state, status) });
            return Err(BridgeError::Runtime(format!("error executing code: {err}")));
        }
        // SAFETY: the single result is on top.
        unsafe { to_host(py, self, state, -1) }
    }

    /// A proxy for the globals table.
    pub fn globals(self: &Arc<Self>, py: Python<'_>) -> Result<Py<PyAny>, BridgeError> {
        let guard = self.guard()?;
        let state = guard.state();
        // SAFETY: the guard holds a live interpreter; `lua_rawgeti` never raises.
        unsafe {
            reserve(state, 1)?;
            ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS);
            to_host(py, self, state, -1)
        }
    }

    /// Calls the global `require` with `name` followed by `args`.
    pub fn require(
        self: &Arc<Self>,
        py: Python<'_>,
        name: &Bound<'_, PyAny>,
        args: &[Bound<'_, PyAny>],
    ) -> Result<Py<PyAny>, BridgeError> {
        let guard = self.guard()?;
        let state = guard.state();
        // SAFETY: the guard holds a live interpreter.
        unsafe { protect(state, fetch_require, 0, 1) }.map_err(|err| self.observe(err))?;
        // SAFETY: `fetch_require` left one value on top.
        if unsafe { ffi::lua_type(state, -1) } == ffi::LUA_TNIL {
            return Err(BridgeError::Runtime("require is not defined".to_owned()));
        }
        let call_args: Vec<Bound<'_, PyAny>> = std::iter::once(name.clone()).chain(args.iter().cloned()).collect();
        // SAFETY: the callee is on top of the guarded stack.
        unsafe { call_pushed(py, self, state, &call_args) }
    }

    /// Tears the interpreter down now.
    ///
    /// Every proxy into this runtime becomes stale. Closing twice is a no-op;
    /// closing from inside one of the runtime's own callbacks is refused.
    pub fn close(&self) -> Result<(), BridgeError> {
        if self.active.load(Ordering::Acquire) > 0 {
            return Err(BridgeError::Runtime(
                "cannot close a Lua state while it is running".to_owned(),
            ));
        }
        self.shutdown();
        Ok(())
    }

    fn shutdown(&self) {
        let state = self.state.swap(ptr::null_mut(), Ordering::AcqRel);
        if state.is_null() {
            return;
        }
        // `lua_close` frees through `PyMem_Free` and runs `__gc` callbacks
        Python::attach(|_py| {
            // SAFETY: no guard is alive, so nothing else uses the stack; the
            // registry entry is cleared first so finalizers cannot recover a
            // runtime that is going away.
            unsafe {
                ffi::lua_settop(state, 0);
                ffi::lua_pushnil(state);
                ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, runtime_key());
                ffi::lua_close(state);
            }
        });
        self.tracer.on_close();
    }
}

impl fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeState")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("memory_used", &self.memory_used())
            .field("memory_limit", &self.memory_limit())
            .field("tracer", &self.tracer)
            .finish_non_exhaustive()
    }
}

impl Drop for RuntimeState {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `(handle, open_libs)`: opens the libraries and installs the bridge.
unsafe extern "C-unwind" fn bootstrap(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by `protect` with a light userdata and a boolean.
    unsafe {
        if ffi::lua_toboolean(state, 2) != 0 {
            ffi::luaL_openlibs(state);
        }
        ffi::lua_pushvalue(state, 1);
        ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, runtime_key());
        ffi::lua_pushvalue(state, 1);
        ffi::lua_setglobal(state, STATE_GLOBAL.as_ptr());
        host_object::install(state);
    }
    0
}

/// `() -> require`: raw read of the global `require`.
unsafe extern "C-unwind" fn fetch_require(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by `protect`; C functions start with LUA_MINSTACK free slots.
    unsafe {
        ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS);
        ffi::lua_pushlstring(state, c"require".as_ptr(), "require".len());
        ffi::lua_rawget(state, -2);
    }
    1
}

/// An independent Lua interpreter.
///
/// ```python
/// import lua
///
/// state = lua.LuaState(max_memory=1 << 20)
/// state.execute("x = 40")
/// assert state.eval("x + 2") == 42
/// state.close()
/// ```
#[pyclass(name = "LuaState", module = "lua", frozen)]
#[derive(Debug)]
pub struct LuaState {
    runtime: Arc<RuntimeState>,
}

impl LuaState {
    /// Opens a new interpreter with the given options.
    pub fn open(py: Python<'_>, options: &StateOptions) -> Result<Self, BridgeError> {
        Ok(Self {
            runtime: RuntimeState::open(py, options)?,
        })
    }

    /// The runtime behind this instance.
    #[must_use]
    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.runtime
    }
}

#[pymethods]
impl LuaState {
    /// Creates a new interpreter.
    ///
    /// # Arguments
    /// * `max_memory` - Upper bound in bytes on memory held by the interpreter
    /// * `open_libs` - Whether to open the Lua standard library
    /// * `trace` - Whether to log bridge events to stderr
    #[new]
    #[pyo3(signature = (*, max_memory=None, open_libs=true, trace=false))]
    fn py_new(py: Python<'_>, max_memory: Option<usize>, open_libs: bool, trace: bool) -> PyResult<Self> {
        let options = StateOptions::from_kwargs(max_memory, open_libs, trace);
        Self::open(py, &options).map_err(|e| LuaError::new_err(py, e))
    }

    /// Runs `source` as a chunk of statements and returns what it returns.
    ///
    /// # Raises
    /// * `LuaCompileError` if the source does not load
    /// * `LuaRuntimeError` if it raises while running
    fn execute(&self, py: Python<'_>, source: &Bound<'_, PyAny>) -> PyResult<Py<PyAny>> {
        let source = source_bytes(source)?;
        self.runtime
            .run(py, &source, RunMode::Execute)
            .map_err(|e| LuaError::new_err(py, e))
    }

    /// Evaluates `source` as a single expression and returns its value.
    fn eval(&self, py: Python<'_>, source: &Bound<'_, PyAny>) -> PyResult<Py<PyAny>> {
        let source = source_bytes(source)?;
        self.runtime
            .run(py, &source, RunMode::Evaluate)
            .map_err(|e| LuaError::new_err(py, e))
    }

    /// Returns the globals table. Writes through it are visible to Lua code.
    fn globals(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        self.runtime.globals(py).map_err(|e| LuaError::new_err(py, e))
    }

    /// Calls Lua's `require(name, *args)`.
    #[pyo3(signature = (name, *args))]
    fn require(&self, py: Python<'_>, name: &Bound<'_, PyAny>, args: &Bound<'_, PyTuple>) -> PyResult<Py<PyAny>> {
        let args: Vec<Bound<'_, PyAny>> = args.iter().collect();
        self.runtime
            .require(py, name, &args)
            .map_err(|e| LuaError::new_err(py, e))
    }

    /// Tears the interpreter down. Outstanding proxies become stale.
    fn close(&self, py: Python<'_>) -> PyResult<()> {
        self.runtime.close().map_err(|e| LuaError::new_err(py, e))
    }

    /// Whether `close()` has been called.
    #[getter]
    fn closed(&self) -> bool {
        self.runtime.is_closed()
    }

    /// Bytes currently held by the interpreter.
    #[getter]
    fn memory_used(&self) -> usize {
        self.runtime.memory_used()
    }

    /// The memory budget given at creation, or `None`.
    #[getter]
    fn memory_limit(&self) -> Option<usize> {
        self.runtime.memory_limit()
    }

    fn __repr__(slf: &Bound<'_, Self>) -> String {
        let state = slf.get().runtime.state.load(Ordering::Acquire);
        format!("<LuaState {state:p} at {:p}>", slf.as_ptr())
    }
}

/// Lua source may be given as `str` or `bytes`.
pub(crate) fn source_bytes(source: &Bound<'_, PyAny>) -> PyResult<Vec<u8>> {
    if let Ok(text) = source.cast::<PyString>() {
        Ok(text.to_str()?.as_bytes().to_vec())
    } else if let Ok(bytes) = source.cast::<PyBytes>() {
        Ok(bytes.as_bytes().to_vec())
    } else {
        Err(PyTypeError::new_err("Lua source must be str or bytes"))
    }
}
