use std::ffi::c_int;

use mlua_sys as ffi;

use crate::{error::BridgeError, state::RuntimeState, trampoline::GuestError};

/// Brackets one bridge operation on the Lua stack.
///
/// Records the stack depth on creation and restores it on drop, so every exit
/// path (success, guest error, conversion failure, Rust `?`) leaves the stack
/// exactly where the operation found it: depth 0 for a top-level call, the
/// callback's own frame for a nested one.
///
/// While a guard is alive the runtime counts as running and refuses `close()`.
pub(crate) struct StackGuard<'a> {
    runtime: &'a RuntimeState,
    state: *mut ffi::lua_State,
    top: c_int,
}

impl<'a> StackGuard<'a> {
    pub(crate) fn new(runtime: &'a RuntimeState) -> Result<Self, BridgeError> {
        let state = runtime.raw()?;
        // SAFETY: `raw` only returns live interpreters.
        let top = unsafe { ffi::lua_gettop(state) };
        runtime.enter();
        Ok(Self { runtime, state, top })
    }

    pub(crate) fn state(&self) -> *mut ffi::lua_State {
        self.state
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the runtime cannot close while a guard is alive.
        let observed = unsafe { ffi::lua_gettop(self.state) };
        // SAFETY: `top` was a valid depth when the guard was created.
        unsafe { ffi::lua_settop(self.state, self.top) };
        self.runtime.leave();
        self.runtime
            .tracer()
            .on_stack_restore(depth(observed), depth(self.top));
    }
}

fn depth(top: c_int) -> usize {
    usize::try_from(top).unwrap_or_default()
}

/// Makes room for `extra` more values outside any protected call.
///
/// `lua_checkstack` reports failure instead of raising, so this is safe to
/// call anywhere.
///
/// # Safety
/// `state` must be a live interpreter.
pub(crate) unsafe fn reserve(state: *mut ffi::lua_State, extra: c_int) -> Result<(), GuestError> {
    // SAFETY: forwarded from the caller.
    if unsafe { ffi::lua_checkstack(state, extra) } == 0 {
        Err(GuestError::new(ffi::LUA_ERRMEM, "stack overflow"))
    } else {
        Ok(())
    }
}
