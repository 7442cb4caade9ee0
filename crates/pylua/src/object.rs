use std::{
    ffi::c_int,
    slice,
    sync::{Arc, Mutex, PoisonError},
};

use mlua_sys as ffi;
use pyo3::{prelude::*, types::PyTuple};

use crate::{
    call::call_pushed,
    convert::{GuestKind, GuestValue, prepare, push_all, to_host},
    error::BridgeError,
    exceptions::LuaError,
    registry::Anchor,
    state::RuntimeState,
    trampoline::{protect, string_bytes, type_name},
};

/// A Lua value that has no Python counterpart: a table, function, userdata
/// or thread.
///
/// The value stays alive in the Lua registry for as long as this object
/// does. Attribute access and subscription read and write the table raw
/// (metatables are ignored for tables), calling invokes the value, and
/// iterating walks the table with `next`, yielding values.
///
/// Once the interpreter is closed every operation raises
/// `LuaStaleReferenceError`.
#[pyclass(name = "LuaObject", module = "lua", frozen)]
pub struct LuaObject {
    anchor: Anchor,
    /// Key last yielded by iteration; `None` before the first step.
    cursor: Mutex<Option<Anchor>>,
}

impl LuaObject {
    pub(crate) fn new(anchor: Anchor) -> Self {
        Self {
            anchor,
            cursor: Mutex::new(None),
        }
    }

    pub(crate) fn anchor(&self) -> &Anchor {
        &self.anchor
    }

    /// The runtime this object lives in.
    #[must_use]
    pub fn runtime(&self) -> &Arc<RuntimeState> {
        self.anchor.runtime()
    }

    /// The registry key anchoring the value.
    #[must_use]
    pub fn key(&self) -> c_int {
        self.anchor.key()
    }

    fn prepare_key(&self, key: &Bound<'_, PyAny>) -> Result<GuestValue, BridgeError> {
        prepare(key, self.runtime(), false).map_err(|err| match err {
            BridgeError::Conversion(_) => BridgeError::Conversion("can't convert attr/key".to_owned()),
            other => other,
        })
    }

    /// Reads `self[key]`; missing keys read as `None`.
    pub fn get(&self, py: Python<'_>, key: &Bound<'_, PyAny>) -> Result<Py<PyAny>, BridgeError> {
        let mut key = self.prepare_key(key)?;
        let runtime = self.runtime();
        let guard = runtime.guard()?;
        let state = guard.state();
        // SAFETY: the guard holds a live interpreter; the value and key are
        // pushed before they are used.
        unsafe {
            self.anchor.push(state)?;
            push_all(state, slice::from_mut(&mut key)).map_err(|err| runtime.observe(err.error))?;
            if GuestKind::at(state, -2) == GuestKind::Table {
                ffi::lua_rawget(state, -2);
            } else {
                // strings and userdata only index through their metatable
                protect(state, index_value, 2, 1).map_err(|err| runtime.observe(err))?;
            }
            to_host(py, runtime, state, -1)
        }
    }

    /// Writes `self[key] = value` without invoking metamethods.
    pub fn set(&self, key: &Bound<'_, PyAny>, value: &Bound<'_, PyAny>) -> Result<(), BridgeError> {
        let key = self.prepare_key(key)?;
        let value = prepare(value, self.runtime(), false)
            .map_err(|err| match err {
                BridgeError::Conversion(_) => BridgeError::Conversion("can't convert value".to_owned()),
                other => other,
            })?;
        self.raw_set(key, value)
    }

    /// Removes `key` by writing nil to it.
    pub fn delete(&self, key: &Bound<'_, PyAny>) -> Result<(), BridgeError> {
        let key = self.prepare_key(key)?;
        self.raw_set(key, GuestValue::Nil)
    }

    fn raw_set(&self, key: GuestValue, value: GuestValue) -> Result<(), BridgeError> {
        let runtime = self.runtime();
        let guard = runtime.guard()?;
        let state = guard.state();
        let mut pair = [key, value];
        // SAFETY: the guard holds a live interpreter.
        unsafe {
            self.anchor.push(state)?;
            if GuestKind::at(state, -1) != GuestKind::Table {
                return Err(BridgeError::Type("Lua object is not a table".to_owned()));
            }
            push_all(state, &mut pair).map_err(|err| runtime.observe(err.error))?;
            protect(state, set_raw, 3, 0).map_err(|err| runtime.observe(err))?;
        }
        Ok(())
    }

    /// Calls the value with `args`.
    pub fn call(&self, py: Python<'_>, args: &[Bound<'_, PyAny>]) -> Result<Py<PyAny>, BridgeError> {
        let runtime = self.runtime();
        let guard = runtime.guard()?;
        let state = guard.state();
        // SAFETY: the guard holds a live interpreter; the callee goes on top.
        unsafe {
            self.anchor.push(state)?;
            call_pushed(py, runtime, state, args)
        }
    }

    /// `tostring(self)` when that works, a canonical description otherwise.
    pub fn describe(&self) -> Result<String, BridgeError> {
        let runtime = self.runtime();
        let guard = runtime.guard()?;
        let state = guard.state();
        // SAFETY: the guard holds a live interpreter; `lua_topointer` and
        // `lua_type` never raise.
        unsafe {
            self.anchor.push(state)?;
            crate::stack::reserve(state, 1)?;
            ffi::lua_pushvalue(state, -1);
            // a failing or missing `__tostring` falls back to the canonical form
            if protect(state, call_tostring, 1, 1).is_ok() {
                if ffi::lua_type(state, -1) == ffi::LUA_TSTRING {
                    return Ok(String::from_utf8_lossy(string_bytes(state, -1)).into_owned());
                }
                ffi::lua_pop(state, 1);
            }
            let tag = ffi::lua_type(state, -1);
            let kind = type_name(state, tag);
            let address = ffi::lua_topointer(state, -1);
            Ok(match GuestKind::at(state, -1) {
                GuestKind::Table | GuestKind::Function => {
                    format!("<Lua {kind} at {address:p}/ref={}>", self.key())
                }
                GuestKind::Userdata | GuestKind::LightUserdata | GuestKind::Thread => {
                    format!("<Lua {kind} at {address:p}>")
                }
                _ => format!("<Lua {kind}>"),
            })
        }
    }

    /// The raw length of the value (`#` without `__len`); 0 for values
    /// without one.
    pub(crate) fn len(&self) -> Result<usize, BridgeError> {
        let runtime = self.runtime();
        let guard = runtime.guard()?;
        let state = guard.state();
        // SAFETY: the guard holds a live interpreter; `lua_rawlen` never raises.
        unsafe {
            self.anchor.push(state)?;
            Ok(usize::try_from(ffi::lua_rawlen(state, -1)).unwrap_or(usize::MAX))
        }
    }

    /// One step of iteration: the next value, or `None` when the table is
    /// exhausted (which also resets the traversal).
    pub fn next_value(&self, py: Python<'_>) -> Result<Option<Py<PyAny>>, BridgeError> {
        let runtime = self.runtime();
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = runtime.guard()?;
        let state = guard.state();
        // SAFETY: the guard holds a live interpreter.
        unsafe {
            self.anchor.push(state)?;
            if GuestKind::at(state, -1) != GuestKind::Table {
                return Err(BridgeError::Type("Lua object is not iterable".to_owned()));
            }
            match cursor.as_ref() {
                Some(key) => key.push(state)?,
                None => {
                    crate::stack::reserve(state, 1)?;
                    ffi::lua_pushnil(state);
                }
            }
            // table, key -> [key, value] or [] on exhaustion
            protect(state, next_pair, 2, 2).map_err(|err| runtime.observe(err))?;
            if ffi::lua_type(state, -2) == ffi::LUA_TNIL {
                *cursor = None;
                return Ok(None);
            }
            let value = to_host(py, runtime, state, -1)?;
            match cursor.as_ref() {
                Some(key) => key.rebind(state, -2)?,
                None => *cursor = Some(Anchor::acquire(runtime, state, -2)?),
            }
            Ok(Some(value))
        }
    }
}

impl std::fmt::Debug for LuaObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaObject").field("key", &self.key()).finish_non_exhaustive()
    }
}

#[pymethods]
impl LuaObject {
    fn __getattr__(&self, py: Python<'_>, name: &Bound<'_, PyAny>) -> PyResult<Py<PyAny>> {
        self.get(py, name).map_err(|e| LuaError::new_err(py, e))
    }

    fn __getitem__(&self, py: Python<'_>, key: &Bound<'_, PyAny>) -> PyResult<Py<PyAny>> {
        self.get(py, key).map_err(|e| LuaError::new_err(py, e))
    }

    fn __setattr__(&self, py: Python<'_>, name: &Bound<'_, PyAny>, value: &Bound<'_, PyAny>) -> PyResult<()> {
        self.set(name, value).map_err(|e| LuaError::new_err(py, e))
    }

    fn __setitem__(&self, py: Python<'_>, key: &Bound<'_, PyAny>, value: &Bound<'_, PyAny>) -> PyResult<()> {
        self.set(key, value).map_err(|e| LuaError::new_err(py, e))
    }

    fn __delattr__(&self, py: Python<'_>, name: &Bound<'_, PyAny>) -> PyResult<()> {
        self.delete(name).map_err(|e| LuaError::new_err(py, e))
    }

    fn __delitem__(&self, py: Python<'_>, key: &Bound<'_, PyAny>) -> PyResult<()> {
        self.delete(key).map_err(|e| LuaError::new_err(py, e))
    }

    #[pyo3(signature = (*args))]
    fn __call__(&self, py: Python<'_>, args: &Bound<'_, PyTuple>) -> PyResult<Py<PyAny>> {
        let args: Vec<Bound<'_, PyAny>> = args.iter().collect();
        self.call(py, &args).map_err(|e| LuaError::new_err(py, e))
    }

    fn __str__(&self, py: Python<'_>) -> PyResult<String> {
        self.describe().map_err(|e| LuaError::new_err(py, e))
    }

    fn __repr__(&self, py: Python<'_>) -> PyResult<String> {
        self.describe().map_err(|e| LuaError::new_err(py, e))
    }

    fn __len__(&self, py: Python<'_>) -> PyResult<usize> {
        self.len().map_err(|e| LuaError::new_err(py, e))
    }

    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__(&self, py: Python<'_>) -> PyResult<Option<Py<PyAny>>> {
        self.next_value(py).map_err(|e| LuaError::new_err(py, e))
    }
}

/// `(value, key) -> value[key]`, honouring `__index`.
unsafe extern "C-unwind" fn index_value(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by `protect` with a value and a key.
    unsafe { ffi::lua_gettable(state, 1) };
    1
}

/// `(table, key, value)`: `rawset`.
unsafe extern "C-unwind" fn set_raw(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by `protect` with a table, a key and a value.
    unsafe { ffi::lua_rawset(state, 1) };
    0
}

/// `(value) -> string | nil`: the `__tostring` metamethod's result, if any.
unsafe extern "C-unwind" fn call_tostring(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by `protect` with one value.
    unsafe {
        if ffi::luaL_callmeta(state, 1, c"__tostring".as_ptr()) == 0 {
            ffi::lua_pushnil(state);
        }
    }
    1
}

/// `(table, key) -> key, value` or `nil, nil` once exhausted.
unsafe extern "C-unwind" fn next_pair(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by `protect` with a table and a key.
    unsafe {
        if ffi::lua_next(state, 1) == 0 {
            ffi::lua_pushnil(state);
            ffi::lua_pushnil(state);
        }
    }
    2
}
