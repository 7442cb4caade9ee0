//! Error trampoline between Lua's non-local error exits and Rust results.
//!
//! Lua reports errors by unwinding (longjmp) to the innermost protected call.
//! An error raised with no protected call active goes to the panic handler and
//! then aborts the process. The bridge therefore never calls a raising Lua API
//! directly: it wraps the operation in a tiny C function and runs it through
//! [`protect`], which returns the outcome as a `Result`. Nesting is ordinary
//! call nesting, each `lua_pcall` catches exactly its own errors.
//!
//! The opposite direction (Lua calling into Rust) is handled by
//! [`raise_message`]: callbacks finish all Rust work, drop everything they own,
//! and only then hand an error message to `lua_error`.

use std::{
    ffi::{CStr, c_int},
    fmt, slice,
};

use mlua_sys as ffi;

/// An error captured from a protected Lua call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestError {
    status: c_int,
    message: String,
}

impl GuestError {
    /// Builds an error that did not come from Lua's own error value.
    pub(crate) fn new(status: c_int, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Pops the error value on top of the stack and turns it into text.
    ///
    /// # Safety
    /// `state` must be a live interpreter with the error value on top.
    pub(crate) unsafe fn pop(state: *mut ffi::lua_State, status: c_int) -> Self {
        // SAFETY: forwarded from the caller.
        let message = unsafe { describe(state, -1) };
        // SAFETY: the error value is on top.
        unsafe { ffi::lua_pop(state, 1) };
        Self { status, message }
    }

    /// Whether the failure was an allocation failure.
    #[must_use]
    pub fn is_memory_error(&self) -> bool {
        self.status == ffi::LUA_ERRMEM
    }

    /// The error text.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Consumes the error, returning its text.
    #[must_use]
    pub fn into_message(self) -> String {
        self.message
    }
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for GuestError {}

/// Runs `func` as a protected call.
///
/// The `nargs` values on top of the stack become its arguments; on success
/// `nresults` values replace them. On failure the arguments are gone and the
/// error value has been popped, so the stack is `nargs` shorter than on entry.
///
/// # Safety
/// `state` must be a live interpreter with at least `nargs` values on the
/// stack. `func` may raise Lua errors but must not unwind a Rust panic.
pub(crate) unsafe fn protect(
    state: *mut ffi::lua_State,
    func: ffi::lua_CFunction,
    nargs: c_int,
    nresults: c_int,
) -> Result<(), GuestError> {
    // room for the function itself and for the results it leaves behind
    // SAFETY: `state` is live per the contract.
    if unsafe { ffi::lua_checkstack(state, nresults.max(0) + 1) } == 0 {
        // SAFETY: drop the arguments so the documented stack effect holds.
        unsafe { ffi::lua_pop(state, nargs) };
        return Err(GuestError::new(ffi::LUA_ERRMEM, "stack overflow"));
    }
    // SAFETY: a free slot was just ensured; the function goes under the args.
    unsafe {
        ffi::lua_pushcfunction(state, func);
        ffi::lua_insert(state, -(nargs + 1));
    }
    // SAFETY: function and arguments are in place.
    let status = unsafe { ffi::lua_pcall(state, nargs, nresults, 0) };
    if status == ffi::LUA_OK {
        Ok(())
    } else {
        // SAFETY: a failed pcall leaves exactly the error value.
        Err(unsafe { GuestError::pop(state, status) })
    }
}

/// Renders the value at `idx` as error text without calling into Lua.
///
/// Strings are taken verbatim, numbers are formatted in Rust (so no string
/// conversion allocates inside the interpreter), and anything else is
/// described by type, like the standalone `lua` interpreter does.
///
/// # Safety
/// `state` must be a live interpreter and `idx` a valid index.
pub(crate) unsafe fn describe(state: *mut ffi::lua_State, idx: c_int) -> String {
    // SAFETY: `idx` is valid per the contract.
    match unsafe { ffi::lua_type(state, idx) } {
        // SAFETY: the value is a string, `lua_tolstring` does not convert it.
        ffi::LUA_TSTRING => String::from_utf8_lossy(unsafe { string_bytes(state, idx) }).into_owned(),
        ffi::LUA_TNUMBER => {
            // SAFETY: the value is a number.
            if unsafe { ffi::lua_isinteger(state, idx) } != 0 {
                // SAFETY: as above.
                unsafe { ffi::lua_tointegerx(state, idx, std::ptr::null_mut()) }.to_string()
            } else {
                // SAFETY: as above.
                unsafe { ffi::lua_tonumberx(state, idx, std::ptr::null_mut()) }.to_string()
            }
        }
        // SAFETY: any type tag is valid for `lua_typename`.
        tag => format!("(error object is a {} value)", unsafe { type_name(state, tag) }),
    }
}

/// Borrows the bytes of the string at `idx`.
///
/// # Safety
/// The value at `idx` must be a string (not a number, which `lua_tolstring`
/// would convert in place). The slice is valid while the value stays on the stack.
pub(crate) unsafe fn string_bytes<'a>(state: *mut ffi::lua_State, idx: c_int) -> &'a [u8] {
    let mut len = 0usize;
    // SAFETY: the value is a string per the contract.
    let data = unsafe { ffi::lua_tolstring(state, idx, &raw mut len) };
    if data.is_null() {
        return &[];
    }
    // SAFETY: Lua guarantees `len` readable bytes at `data`.
    unsafe { slice::from_raw_parts(data.cast::<u8>(), len) }
}

/// The Lua name of a type tag.
///
/// # Safety
/// `state` must be a live interpreter.
pub(crate) unsafe fn type_name(state: *mut ffi::lua_State, tag: c_int) -> String {
    // SAFETY: `lua_typename` returns a static C string for every tag.
    unsafe { CStr::from_ptr(ffi::lua_typename(state, tag)) }
        .to_string_lossy()
        .into_owned()
}

/// Raises `message` as a Lua error from inside a C function.
///
/// The message is copied into the interpreter and dropped before `lua_error`
/// unwinds, so no Rust value is skipped by the longjmp. Copying runs in its
/// own protected call; if the interpreter has no room for the text, the
/// allocation error is raised instead.
///
/// # Safety
/// Must only be called from a C function invoked by Lua, as its last action.
pub(crate) unsafe fn raise_message(state: *mut ffi::lua_State, message: String) -> c_int {
    let mut text: &[u8] = message.as_bytes();
    // SAFETY: C functions always have LUA_MINSTACK free slots; `text`
    // outlives the protected call that reads it.
    unsafe {
        ffi::lua_pushcfunction(state, push_text);
        ffi::lua_pushlightuserdata(state, (&raw mut text).cast());
        // leaves either the copied message or the allocation error on top
        ffi::lua_pcall(state, 1, 1, 0);
    }
    drop(message);
    // SAFETY: we are inside a C function called by Lua; nothing below owns resources.
    unsafe { ffi::lua_error(state) }
}

/// `(text) -> string`: copies the byte slice behind a light userdata.
unsafe extern "C-unwind" fn push_text(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: `raise_message` passes a pointer to a live `&[u8]`.
    unsafe {
        let text = &*ffi::lua_touserdata(state, 1).cast::<&[u8]>();
        ffi::lua_pushlstring(state, text.as_ptr().cast(), text.len());
    }
    1
}

/// Last-resort handler for errors raised outside any protected call.
///
/// The bridge never makes such calls; if one happens anyway Lua aborts the
/// process after this handler returns, so all it can do is report.
pub(crate) unsafe extern "C-unwind" fn on_unprotected_error(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: Lua calls the panic handler with the error value on top.
    let message = unsafe { describe(state, -1) };
    eprintln!("pylua: unprotected error in Lua runtime: {message}");
    eprintln!("pylua: aborting");
    0
}
