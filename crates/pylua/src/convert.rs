//! Value conversion between Python objects and Lua values.
//!
//! Lua → Python reads the value at a stack index and dispatches over its
//! [`GuestKind`]. Primitives are copied, userdata wrapping a Python object is
//! unwrapped to that same object, and everything else becomes a
//! [`LuaObject`](crate::LuaObject) anchored in the registry.
//!
//! Python → Lua happens in two phases. [`prepare`] inspects the Python object
//! and produces a [`GuestValue`] without touching Lua. [`push_all`] then
//! pushes a batch of prepared values inside one protected call, so an
//! allocation failure in the middle of a batch is an error, never an abort.

use std::{
    ffi::{c_int, c_void},
    slice,
    sync::Arc,
};

use mlua_sys as ffi;
use pyo3::{
    prelude::*,
    types::{PyBool, PyBytes, PyFloat, PyInt, PyString},
};

use crate::{
    error::BridgeError,
    host_object,
    object::LuaObject,
    registry::Anchor,
    state::RuntimeState,
    trampoline::{GuestError, protect, string_bytes},
};

/// The type of a Lua value, as seen by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestKind {
    /// An index past the top of the stack.
    None,
    Nil,
    Boolean,
    LightUserdata,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Thread,
}

impl GuestKind {
    /// Classifies the value at `idx`.
    ///
    /// # Safety
    /// `state` must be a live interpreter and `idx` an acceptable index.
    pub(crate) unsafe fn at(state: *mut ffi::lua_State, idx: c_int) -> Self {
        // SAFETY: forwarded from the caller.
        match unsafe { ffi::lua_type(state, idx) } {
            ffi::LUA_TNIL => Self::Nil,
            ffi::LUA_TBOOLEAN => Self::Boolean,
            ffi::LUA_TLIGHTUSERDATA => Self::LightUserdata,
            ffi::LUA_TNUMBER => Self::Number,
            ffi::LUA_TSTRING => Self::String,
            ffi::LUA_TTABLE => Self::Table,
            ffi::LUA_TFUNCTION => Self::Function,
            ffi::LUA_TUSERDATA => Self::Userdata,
            ffi::LUA_TTHREAD => Self::Thread,
            _ => Self::None,
        }
    }
}

/// A Python value ready to be pushed onto the Lua stack.
#[derive(Debug)]
pub(crate) enum GuestValue {
    Nil,
    Boolean(bool),
    Integer(ffi::lua_Integer),
    Number(ffi::lua_Number),
    Bytes(Vec<u8>),
    /// A value already anchored in the target runtime's registry.
    Anchored(c_int),
    /// A Python object to wrap as host-object userdata. Taken (left `None`)
    /// once it has been handed to Lua.
    Host(Option<Py<PyAny>>),
}

/// Converts a Python object into a [`GuestValue`] for `runtime`.
///
/// `None` maps to nil only when `allow_none` is set. A [`LuaObject`] of
/// `runtime` is passed by reference; one of another runtime is wrapped like
/// any other Python object.
pub(crate) fn prepare(
    obj: &Bound<'_, PyAny>,
    runtime: &Arc<RuntimeState>,
    allow_none: bool,
) -> Result<GuestValue, BridgeError> {
    if obj.is_none() {
        return if allow_none {
            Ok(GuestValue::Nil)
        } else {
            Err(BridgeError::Conversion("None is not allowed here".to_owned()))
        };
    }
    // bool before int: `True` is an `int` in Python
    if let Ok(b) = obj.cast::<PyBool>() {
        return Ok(GuestValue::Boolean(b.is_true()));
    }
    if let Ok(i) = obj.cast::<PyInt>() {
        // integers beyond i64 degrade to floats, as Lua's own tonumber does
        return Ok(match i.extract::<i64>() {
            Ok(v) => GuestValue::Integer(v),
            Err(_) => GuestValue::Number(i.extract::<f64>()?),
        });
    }
    if let Ok(f) = obj.cast::<PyFloat>() {
        return Ok(GuestValue::Number(f.value()));
    }
    if let Ok(s) = obj.cast::<PyString>() {
        return Ok(GuestValue::Bytes(s.to_str()?.as_bytes().to_vec()));
    }
    if let Ok(b) = obj.cast::<PyBytes>() {
        return Ok(GuestValue::Bytes(b.as_bytes().to_vec()));
    }
    if let Ok(proxy) = obj.cast::<LuaObject>() {
        let anchor = proxy.get().anchor();
        if Arc::ptr_eq(anchor.runtime(), runtime) {
            return Ok(GuestValue::Anchored(anchor.key()));
        }
    }
    Ok(GuestValue::Host(Some(obj.clone().unbind())))
}

/// A failed [`push_all`]: which value could not be pushed, and why.
#[derive(Debug)]
pub(crate) struct PushError {
    /// Zero-based position in the batch.
    pub index: usize,
    pub error: GuestError,
}

struct PushBatch {
    values: *mut GuestValue,
    len: usize,
    pushed: usize,
}

/// Pushes every prepared value, in order, inside one protected call.
///
/// On success the values are on top of the stack. On failure nothing is left
/// behind. Host values already handed to Lua are owned by their userdata.
///
/// # Safety
/// `state` must be `runtime`'s live interpreter, where `runtime` is the one
/// the values were prepared for.
pub(crate) unsafe fn push_all(state: *mut ffi::lua_State, values: &mut [GuestValue]) -> Result<(), PushError> {
    let Ok(count) = c_int::try_from(values.len()) else {
        return Err(PushError {
            index: 0,
            error: GuestError::new(ffi::LUA_ERRMEM, "too many values"),
        });
    };
    let mut batch = PushBatch {
        values: values.as_mut_ptr(),
        len: values.len(),
        pushed: 0,
    };
    // SAFETY: `batch` outlives the protected call that reads it.
    let result = unsafe {
        crate::stack::reserve(state, 1).and_then(|()| {
            ffi::lua_pushlightuserdata(state, (&raw mut batch).cast::<c_void>());
            protect(state, push_batch, 1, count)
        })
    };
    result.map_err(|error| PushError {
        index: batch.pushed,
        error,
    })
}

/// `(batch) -> values...`
///
/// Holds no values with destructors: a Lua error raised by any push unwinds
/// straight through this frame.
unsafe extern "C-unwind" fn push_batch(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: `push_all` passes a pointer to a live `PushBatch` as the only
    // argument, and nothing else accesses it during the call.
    let batch = unsafe { &mut *ffi::lua_touserdata(state, 1).cast::<PushBatch>() };
    // SAFETY: the slice is the one `push_all` borrowed mutably.
    let values = unsafe { slice::from_raw_parts_mut(batch.values, batch.len) };
    let Ok(count) = c_int::try_from(batch.len) else {
        return 0;
    };
    // SAFETY: raises "stack overflow" inside the protected call on failure.
    unsafe { ffi::luaL_checkstack(state, count.saturating_add(2), c"too many values to convert".as_ptr()) };
    for value in values.iter_mut() {
        // SAFETY: stack space was checked above; every raising push is inside
        // the protected call.
        unsafe { push_one(state, value) };
        batch.pushed += 1;
    }
    count
}

/// Pushes a single prepared value.
///
/// # Safety
/// Must run inside a protected call with a free stack slot plus two spare.
unsafe fn push_one(state: *mut ffi::lua_State, value: &mut GuestValue) {
    // SAFETY: per the function contract.
    unsafe {
        match value {
            GuestValue::Nil => ffi::lua_pushnil(state),
            GuestValue::Boolean(b) => ffi::lua_pushboolean(state, c_int::from(*b)),
            GuestValue::Integer(i) => ffi::lua_pushinteger(state, *i),
            GuestValue::Number(n) => ffi::lua_pushnumber(state, *n),
            GuestValue::Bytes(bytes) => {
                ffi::lua_pushlstring(state, bytes.as_ptr().cast(), bytes.len());
            }
            GuestValue::Anchored(key) => {
                ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::lua_Integer::from(*key));
            }
            GuestValue::Host(obj) => host_object::push(state, obj),
        }
    }
}

/// Converts the value at `idx` into a Python object.
///
/// The stack is left unchanged.
///
/// # Safety
/// `state` must be `runtime`'s live interpreter and `idx` an acceptable index.
pub(crate) unsafe fn to_host(
    py: Python<'_>,
    runtime: &Arc<RuntimeState>,
    state: *mut ffi::lua_State,
    idx: c_int,
) -> Result<Py<PyAny>, BridgeError> {
    // SAFETY: forwarded from the caller.
    let kind = unsafe { GuestKind::at(state, idx) };
    let obj = match kind {
        GuestKind::None | GuestKind::Nil => py.None(),
        GuestKind::Boolean => {
            // SAFETY: the value is a boolean.
            let b = unsafe { ffi::lua_toboolean(state, idx) } != 0;
            PyBool::new(py, b).to_owned().into_any().unbind()
        }
        // SAFETY: the value is a number.
        GuestKind::Number => unsafe { number_to_host(py, state, idx) }?,
        GuestKind::String => {
            // SAFETY: the value is a string and stays on the stack while borrowed.
            let bytes = unsafe { string_bytes(state, idx) };
            match std::str::from_utf8(bytes) {
                Ok(text) => PyString::new(py, text).into_any().unbind(),
                Err(_) => PyBytes::new(py, bytes).into_any().unbind(),
            }
        }
        // SAFETY: the value is a full userdata at a valid index.
        GuestKind::Userdata => match unsafe { host_object::peek(state, idx) } {
            Some(obj) => obj.clone_ref(py),
            // SAFETY: forwarded from the caller.
            None => unsafe { proxy_at(py, runtime, state, idx) }?,
        },
        GuestKind::LightUserdata | GuestKind::Table | GuestKind::Function | GuestKind::Thread => {
            // SAFETY: forwarded from the caller.
            unsafe { proxy_at(py, runtime, state, idx) }?
        }
    };
    Ok(obj)
}

/// Lua numbers with no fractional part that fit in `i64` become `int`.
unsafe fn number_to_host(py: Python<'_>, state: *mut ffi::lua_State, idx: c_int) -> PyResult<Py<PyAny>> {
    // SAFETY: the caller checked the value is a number.
    if unsafe { ffi::lua_isinteger(state, idx) } != 0 {
        // SAFETY: as above.
        let i = unsafe { ffi::lua_tointegerx(state, idx, std::ptr::null_mut()) };
        return Ok(i.into_pyobject(py)?.into_any().unbind());
    }
    // SAFETY: as above.
    let n = unsafe { ffi::lua_tonumberx(state, idx, std::ptr::null_mut()) };
    match integral(n) {
        Some(i) => Ok(i.into_pyobject(py)?.into_any().unbind()),
        None => Ok(PyFloat::new(py, n).into_any().unbind()),
    }
}

/// Returns `n` as an `i64` when that loses nothing.
#[expect(clippy::cast_possible_truncation, reason = "range checked before the cast")]
fn integral(n: f64) -> Option<i64> {
    // 2^63 is exactly representable; i64::MAX is not
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (n.fract() == 0.0 && (-LIMIT..LIMIT).contains(&n)).then(|| n as i64)
}

unsafe fn proxy_at(
    py: Python<'_>,
    runtime: &Arc<RuntimeState>,
    state: *mut ffi::lua_State,
    idx: c_int,
) -> Result<Py<PyAny>, BridgeError> {
    // SAFETY: forwarded from the caller; the value is not nil.
    let anchor = unsafe { Anchor::acquire(runtime, state, idx) }?;
    Ok(Py::new(py, LuaObject::new(anchor))?.into_any())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_numbers() {
        assert_eq!(integral(3.0), Some(3));
        assert_eq!(integral(-0.0), Some(0));
        assert_eq!(integral(3.5), None);
        assert_eq!(integral(f64::NAN), None);
        assert_eq!(integral(f64::INFINITY), None);
        assert_eq!(integral(9_223_372_036_854_775_808.0), None);
        assert_eq!(integral(-9_223_372_036_854_775_808.0), Some(i64::MIN));
    }
}
