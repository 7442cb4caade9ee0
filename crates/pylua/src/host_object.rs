//! Python objects inside Lua.
//!
//! A Python object that crosses into Lua becomes a full userdata holding an
//! owned `Option<Py<PyAny>>`, with a shared metatable (`python.object`) that
//! forwards indexing, assignment, calls and `tostring` back to Python. The
//! global `python` table gives Lua code a way in: `python.eval`,
//! `python.import`, `python.builtins` and `python.globals`.
//!
//! Every callback here is entered from Lua. They all go through
//! [`callback`], which runs the Rust side under `catch_unwind` and inside
//! `Python::attach`, pushes results through a protected call, and only raises
//! a Lua error once every Rust value has been dropped.

use std::{
    ffi::{CString, c_int, c_void},
    mem,
    panic::{AssertUnwindSafe, catch_unwind},
    ptr,
    sync::Arc,
};

use mlua_sys as ffi;
use pyo3::{
    exceptions::{PyAttributeError, PyIndexError, PyKeyError},
    prelude::*,
    types::{PyMapping, PySequence, PyTuple},
};

use crate::{
    convert::{self, GuestValue},
    error::BridgeError,
    state::RuntimeState,
    trampoline::raise_message,
};

/// Name reported by `__name` (and so by Lua error messages) for host objects.
pub const TYPE_NAME: &str = "python.object";

/// Registry key of the host-object metatable.
static METATABLE_KEY: u8 = 0;

fn metatable_key() -> *const c_void {
    (&raw const METATABLE_KEY).cast()
}

type Slot = Option<Py<PyAny>>;

/// Wraps `obj` in a new host-object userdata and pushes it.
///
/// The object is taken out of `obj` only after the userdata and its
/// metatable are in place, so an allocation failure leaves it with the caller.
///
/// # Safety
/// Must run inside a protected call, in an interpreter bootstrapped by
/// [`install`], with two free stack slots.
pub(crate) unsafe fn push(state: *mut ffi::lua_State, obj: &mut Slot) {
    // SAFETY: per the function contract; the slot is initialised before
    // anything that can raise after the allocation.
    unsafe {
        let slot = ffi::lua_newuserdatauv(state, mem::size_of::<Slot>(), 0).cast::<Slot>();
        ptr::write(slot, None);
        ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, metatable_key());
        ffi::lua_setmetatable(state, -2);
        *slot = obj.take();
    }
}

/// Returns the slot of the host-object userdata at `idx`, or null when the
/// value is anything else.
unsafe fn slot_at(state: *mut ffi::lua_State, idx: c_int) -> *mut Slot {
    // SAFETY: the caller guarantees a live interpreter and a valid index.
    unsafe {
        if ffi::lua_type(state, idx) != ffi::LUA_TUSERDATA || ffi::lua_checkstack(state, 2) == 0 {
            return ptr::null_mut();
        }
        if ffi::lua_getmetatable(state, idx) == 0 {
            return ptr::null_mut();
        }
        ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, metatable_key());
        let ours = ffi::lua_rawequal(state, -1, -2) != 0;
        ffi::lua_pop(state, 2);
        if ours {
            ffi::lua_touserdata(state, idx).cast()
        } else {
            ptr::null_mut()
        }
    }
}

/// Borrows the Python object wrapped by the userdata at `idx`, if it is a
/// live host object.
///
/// # Safety
/// `state` must be a live interpreter and `idx` a valid index. The reference
/// is valid while the userdata stays on the stack.
pub(crate) unsafe fn peek<'a>(state: *mut ffi::lua_State, idx: c_int) -> Option<&'a Py<PyAny>> {
    // SAFETY: forwarded from the caller.
    let slot = unsafe { slot_at(state, idx) };
    // SAFETY: a non-null slot points into a host-object userdata.
    unsafe { slot.as_ref() }.and_then(Option::as_ref)
}

/// Creates the host-object metatable and the global `python` table.
///
/// # Safety
/// Must run inside a protected call.
pub(crate) unsafe fn install(state: *mut ffi::lua_State) {
    let metamethods: [(&std::ffi::CStr, ffi::lua_CFunction); 5] = [
        (c"__index", object_index),
        (c"__newindex", object_newindex),
        (c"__call", object_call),
        (c"__tostring", object_tostring),
        (c"__gc", object_gc),
    ];
    let functions: [(&std::ffi::CStr, ffi::lua_CFunction); 4] = [
        (c"eval", python_eval),
        (c"import", python_import),
        (c"builtins", python_builtins),
        (c"globals", python_globals),
    ];
    // SAFETY: per the function contract; every call below may raise, which
    // the surrounding protected call catches.
    unsafe {
        ffi::luaL_checkstack(state, 4, ptr::null());
        ffi::lua_createtable(state, 0, 7);
        for (name, func) in metamethods {
            ffi::lua_pushcfunction(state, func);
            ffi::lua_setfield(state, -2, name.as_ptr());
        }
        ffi::lua_pushlstring(state, TYPE_NAME.as_ptr().cast(), TYPE_NAME.len());
        ffi::lua_setfield(state, -2, c"__name".as_ptr());
        // hide the metatable from getmetatable(), so Lua code cannot call
        // the metamethods on foreign values
        ffi::lua_pushlstring(state, TYPE_NAME.as_ptr().cast(), TYPE_NAME.len());
        ffi::lua_setfield(state, -2, c"__metatable".as_ptr());
        ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, metatable_key());

        ffi::lua_createtable(state, 0, 4);
        for (name, func) in functions {
            ffi::lua_pushcfunction(state, func);
            ffi::lua_setfield(state, -2, name.as_ptr());
        }
        ffi::lua_setglobal(state, c"python".as_ptr());
    }
}

/// Runs a callback body and hands its results (or its error) to Lua.
///
/// `body` receives the arguments Lua passed, already converted, and returns
/// the values to give back.
unsafe fn callback<F>(state: *mut ffi::lua_State, body: F) -> c_int
where
    F: for<'py> FnOnce(Python<'py>, &Arc<RuntimeState>, Vec<Bound<'py, PyAny>>) -> Result<Vec<GuestValue>, BridgeError>,
{
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        Python::attach(|py| {
            // SAFETY: Lua invoked us on a live interpreter.
            unsafe { run(py, state, body) }
        })
    }));
    let message = match outcome {
        Ok(Ok(nresults)) => return nresults,
        Ok(Err(message)) => message,
        Err(payload) => panic_message(payload.as_ref()),
    };
    // SAFETY: we are inside a C function called by Lua and own nothing else.
    unsafe { raise_message(state, message) }
}

unsafe fn run<F>(py: Python<'_>, state: *mut ffi::lua_State, body: F) -> Result<c_int, String>
where
    F: for<'py> FnOnce(Python<'py>, &Arc<RuntimeState>, Vec<Bound<'py, PyAny>>) -> Result<Vec<GuestValue>, BridgeError>,
{
    // SAFETY: forwarded from the caller.
    let runtime = unsafe { RuntimeState::from_lua(state) }.map_err(|err| err.to_string())?;
    // SAFETY: as above; arguments occupy 1..=top.
    let top = unsafe { ffi::lua_gettop(state) };
    let mut args = Vec::with_capacity(usize::try_from(top).unwrap_or_default());
    for idx in 1..=top {
        // SAFETY: `idx` is within the callback's frame.
        let arg = unsafe { convert::to_host(py, &runtime, state, idx) }.map_err(|err| err.to_string())?;
        args.push(arg.into_bound(py));
    }
    // Python exceptions read as `TypeName: message`
    let mut results = body(py, &runtime, args).map_err(|err| err.to_string())?;
    // SAFETY: the values were prepared for this runtime.
    unsafe { convert::push_all(state, &mut results) }
        .map_err(|err| format!("can't convert value: {}", err.error))?;
    c_int::try_from(results.len()).map_err(|_| "too many results".to_owned())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    format!("Rust panic in Python callback: {detail}")
}

fn self_object<'py>(args: &[Bound<'py, PyAny>]) -> Result<Bound<'py, PyAny>, BridgeError> {
    args.first()
        .cloned()
        .ok_or_else(|| BridgeError::Type("missing self argument".to_owned()))
}

/// Mappings and sequences are indexed by item, everything else by attribute.
fn uses_items(obj: &Bound<'_, PyAny>) -> bool {
    obj.cast::<PyMapping>().is_ok() || obj.cast::<PySequence>().is_ok()
}

fn is_missing(py: Python<'_>, err: &PyErr) -> bool {
    err.is_instance_of::<PyKeyError>(py)
        || err.is_instance_of::<PyIndexError>(py)
        || err.is_instance_of::<PyAttributeError>(py)
}

fn attr_name(key: &Bound<'_, PyAny>) -> Result<String, BridgeError> {
    key.extract::<String>()
        .map_err(|_| BridgeError::Type("attribute name must be a string".to_owned()))
}

unsafe extern "C-unwind" fn object_index(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by Lua as the `__index` metamethod.
    unsafe {
        callback(state, |py, runtime, args| {
            let obj = self_object(&args)?;
            let key = args.get(1).cloned().unwrap_or_else(|| py.None().into_bound(py));
            let found = if uses_items(&obj) {
                obj.get_item(&key)
            } else {
                obj.getattr(attr_name(&key)?)
            };
            let value = match found {
                Ok(value) => value,
                Err(err) if is_missing(py, &err) => return Ok(vec![GuestValue::Nil]),
                Err(err) => return Err(err.into()),
            };
            Ok(vec![convert::prepare(&value, runtime, true)?])
        })
    }
}

unsafe extern "C-unwind" fn object_newindex(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by Lua as the `__newindex` metamethod.
    unsafe {
        callback(state, |py, _runtime, args| {
            let obj = self_object(&args)?;
            let none = py.None().into_bound(py);
            let key = args.get(1).unwrap_or(&none);
            let value = args.get(2).unwrap_or(&none);
            // assigning nil removes the entry, as it would in a Lua table
            let result = match (uses_items(&obj), value.is_none()) {
                (true, false) => obj.set_item(key, value),
                (true, true) => obj.del_item(key),
                (false, false) => obj.setattr(attr_name(key)?, value),
                (false, true) => obj.delattr(attr_name(key)?),
            };
            match result {
                Err(err) if !(value.is_none() && is_missing(py, &err)) => Err(err.into()),
                _ => Ok(Vec::new()),
            }
        })
    }
}

unsafe extern "C-unwind" fn object_call(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by Lua as the `__call` metamethod.
    unsafe {
        callback(state, |py, runtime, args| {
            let obj = self_object(&args)?;
            let call_args = PyTuple::new(py, &args[1..])?;
            let result = obj.call1(call_args)?;
            Ok(vec![convert::prepare(&result, runtime, true)?])
        })
    }
}

unsafe extern "C-unwind" fn object_tostring(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by Lua as the `__tostring` metamethod.
    unsafe {
        callback(state, |_py, _runtime, args| {
            let text = self_object(&args)?.str()?;
            Ok(vec![GuestValue::Bytes(text.to_str()?.as_bytes().to_vec())])
        })
    }
}

unsafe extern "C-unwind" fn object_gc(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by Lua as the `__gc` metamethod with the userdata at 1.
    let slot = unsafe { slot_at(state, 1) };
    // SAFETY: a non-null slot points into a host-object userdata that Lua is
    // about to free; taking the object leaves a valid `None` behind.
    let Some(obj) = (unsafe { slot.as_mut() }).and_then(Option::take) else {
        return 0;
    };
    // a panic cannot be reported from a finalizer; the object is dropped either way
    let _ = catch_unwind(AssertUnwindSafe(|| Python::attach(|_| drop(obj))));
    0
}

fn source_arg(args: &[Bound<'_, PyAny>], what: &str) -> Result<String, BridgeError> {
    args.first()
        .and_then(|arg| arg.extract::<String>().ok())
        .ok_or_else(|| BridgeError::Type(format!("bad argument #1 to '{what}' (string expected)")))
}

unsafe extern "C-unwind" fn python_eval(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by Lua as `python.eval`.
    unsafe {
        callback(state, |py, runtime, args| {
            let source = source_arg(&args, "eval")?;
            let code = CString::new(source)
                .map_err(|_| BridgeError::Conversion("source contains a NUL byte".to_owned()))?;
            let globals = py.import("__main__")?.dict();
            let value = py.eval(&code, Some(&globals), None)?;
            Ok(vec![convert::prepare(&value, runtime, true)?])
        })
    }
}

unsafe extern "C-unwind" fn python_import(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by Lua as `python.import`.
    unsafe {
        callback(state, |py, runtime, args| {
            let name = source_arg(&args, "import")?;
            let module = py.import(name.as_str())?;
            Ok(vec![convert::prepare(module.as_any(), runtime, true)?])
        })
    }
}

unsafe extern "C-unwind" fn python_builtins(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by Lua as `python.builtins`.
    unsafe {
        callback(state, |py, runtime, _args| {
            let builtins = py.import("builtins")?;
            Ok(vec![convert::prepare(builtins.as_any(), runtime, true)?])
        })
    }
}

unsafe extern "C-unwind" fn python_globals(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by Lua as `python.globals`.
    unsafe {
        callback(state, |py, runtime, _args| {
            let globals = py.import("__main__")?.dict();
            Ok(vec![convert::prepare(globals.as_any(), runtime, true)?])
        })
    }
}
