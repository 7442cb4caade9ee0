use std::{ffi::c_int, sync::Arc};

use mlua_sys as ffi;
use pyo3::{prelude::*, types::PyTuple};

use crate::{
    convert::{prepare, push_all, to_host},
    error::BridgeError,
    state::RuntimeState,
    trampoline::GuestError,
};

/// Calls the value on top of the stack with `args`.
///
/// Every argument is converted before anything is pushed; `None` is
/// rejected. Lua's results come back as `None` (no results), the value
/// itself (one result) or a tuple (several). The callee and everything above
/// it are left for the caller's stack guard to clear.
///
/// # Safety
/// `state` must be `runtime`'s live interpreter, inside a stack guard, with
/// the callee on top.
pub(crate) unsafe fn call_pushed(
    py: Python<'_>,
    runtime: &Arc<RuntimeState>,
    state: *mut ffi::lua_State,
    args: &[Bound<'_, PyAny>],
) -> Result<Py<PyAny>, BridgeError> {
    // SAFETY: the callee is on top.
    let base = unsafe { ffi::lua_gettop(state) } - 1;

    let mut values = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let value = prepare(arg, runtime, false).map_err(|err| match err {
            BridgeError::Conversion(_) => argument_error(i),
            other => other,
        })?;
        values.push(value);
    }
    // SAFETY: the values were prepared for this runtime.
    unsafe { push_all(state, &mut values) }.map_err(|err| {
        runtime.observe(err.error);
        argument_error(err.index)
    })?;
    drop(values);

    let nargs = c_int::try_from(args.len()).map_err(|_| argument_error(args.len()))?;
    runtime.tracer().on_call(args.len());
    // SAFETY: callee and arguments are in place.
    let status = unsafe { ffi::lua_pcall(state, nargs, ffi::LUA_MULTRET, 0) };
    if status != ffi::LUA_OK {
        // SAFETY: a failed call leaves the error value on top.
        let err = runtime.observe(unsafe { GuestError::pop(state, status) });
        return Err(err.into());
    }

    // SAFETY: the results occupy base+1..=top.
    let top = unsafe { ffi::lua_gettop(state) };
    let nresults = usize::try_from(top - base).unwrap_or_default();
    runtime.tracer().on_return(nresults);
    match nresults {
        0 => Ok(py.None()),
        // SAFETY: exactly one result on top.
        1 => unsafe { to_host(py, runtime, state, top) },
        _ => {
            let mut results = Vec::with_capacity(nresults);
            for idx in base + 1..=top {
                // SAFETY: `idx` addresses one of the results.
                results.push(unsafe { to_host(py, runtime, state, idx) }?);
            }
            Ok(PyTuple::new(py, results)?.into_any().unbind())
        }
    }
}

fn argument_error(index: usize) -> BridgeError {
    BridgeError::Conversion(format!("failed to convert argument #{}", index + 1))
}
