//! Registry anchors: how a Python-side handle keeps a Lua value alive.
//!
//! Lua values have no address a foreign runtime may hold on to. The bridge
//! stores each value reachable from Python in the Lua registry under an
//! integer key obtained from `luaL_ref`; the [`Anchor`] owning that key is the
//! only way back to the value. Keys are released exactly once, when the
//! anchor drops.

use std::{ffi::c_int, fmt, sync::Arc};

use mlua_sys as ffi;

use crate::{
    error::BridgeError,
    stack::reserve,
    state::RuntimeState,
    trampoline::protect,
};

/// An owned registry key in one runtime.
pub struct Anchor {
    runtime: Arc<RuntimeState>,
    key: c_int,
}

impl Anchor {
    /// Anchors the value at `idx` and returns the owning handle.
    ///
    /// The stack is left unchanged.
    ///
    /// # Safety
    /// `state` must be `runtime`'s live interpreter and `idx` a valid,
    /// non-nil stack index.
    pub(crate) unsafe fn acquire(
        runtime: &Arc<RuntimeState>,
        state: *mut ffi::lua_State,
        idx: c_int,
    ) -> Result<Self, BridgeError> {
        // SAFETY: forwarded from the caller.
        unsafe {
            reserve(state, 2)?;
            ffi::lua_pushvalue(state, idx);
            protect(state, take_ref, 1, 1).map_err(|err| runtime.observe(err))?;
        }
        // SAFETY: `take_ref` leaves the key on top.
        let key = unsafe { ffi::lua_tointegerx(state, -1, std::ptr::null_mut()) };
        // SAFETY: pops the key pushed above.
        unsafe { ffi::lua_pop(state, 1) };
        let key = c_int::try_from(key).map_err(|_| BridgeError::Runtime("registry key out of range".to_owned()))?;
        runtime.tracer().on_anchor(key);
        Ok(Self {
            runtime: Arc::clone(runtime),
            key,
        })
    }

    /// The runtime this anchor belongs to.
    #[must_use]
    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.runtime
    }

    /// The registry key.
    #[must_use]
    pub fn key(&self) -> c_int {
        self.key
    }

    /// Pushes the anchored value.
    ///
    /// Fails with "lost reference" when the registry slot is empty.
    ///
    /// # Safety
    /// `state` must be this anchor's runtime's live interpreter.
    pub(crate) unsafe fn push(&self, state: *mut ffi::lua_State) -> Result<(), BridgeError> {
        // SAFETY: forwarded from the caller; `lua_rawgeti` never raises.
        unsafe {
            reserve(state, 1)?;
            if ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::lua_Integer::from(self.key)) == ffi::LUA_TNIL {
                ffi::lua_pop(state, 1);
                return Err(BridgeError::lost_reference());
            }
        }
        Ok(())
    }

    /// Points this anchor at the value at `idx`, reusing the registry slot.
    ///
    /// # Safety
    /// `state` must be this anchor's runtime's live interpreter and `idx` a
    /// valid, non-nil stack index.
    pub(crate) unsafe fn rebind(&self, state: *mut ffi::lua_State, idx: c_int) -> Result<(), BridgeError> {
        // SAFETY: forwarded from the caller.
        unsafe {
            reserve(state, 3)?;
            ffi::lua_pushvalue(state, idx);
            ffi::lua_pushinteger(state, ffi::lua_Integer::from(self.key));
            protect(state, store_ref, 2, 0).map_err(|err| self.runtime.observe(err))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anchor").field("key", &self.key).finish_non_exhaustive()
    }
}

impl Drop for Anchor {
    fn drop(&mut self) {
        // a closed runtime took every key with it
        let Ok(state) = self.runtime.raw() else {
            return;
        };
        // SAFETY: the runtime is live; `luaL_unref` only writes existing
        // integer slots of the registry and cannot raise. If no stack slot is
        // available the key leaks, which is harmless.
        unsafe {
            if reserve(state, 2).is_err() {
                return;
            }
            ffi::luaL_unref(state, ffi::LUA_REGISTRYINDEX, self.key);
        }
        self.runtime.tracer().on_release(self.key);
    }
}

/// `(value) -> key`: anchors its argument in the registry.
unsafe extern "C-unwind" fn take_ref(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by `protect` with exactly one argument.
    unsafe {
        let key = ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX);
        ffi::lua_pushinteger(state, ffi::lua_Integer::from(key));
    }
    1
}

/// `(value, key)`: overwrites an existing registry slot.
unsafe extern "C-unwind" fn store_ref(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by `protect` with a value and an integer key.
    unsafe {
        let key = ffi::lua_tointegerx(state, 2, std::ptr::null_mut());
        ffi::lua_settop(state, 1);
        ffi::lua_rawseti(state, ffi::LUA_REGISTRYINDEX, key);
    }
    0
}
