//! Lua allocator backed by Python's memory manager.
//!
//! Every allocation the interpreter makes goes through `PyMem_Realloc` /
//! `PyMem_Free`, so Lua and Python share one heap. A [`MemoryBudget`] passed as
//! the allocator's user data tracks usage and can cap it.
//!
//! `PyMem_*` must only be called while attached to the Python interpreter.
//! Lua only allocates while one of our entry points runs (all of which hold a
//! `Python<'_>` token) or while the interpreter is closed, which the runtime
//! does inside `Python::attach`.

use std::{
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use pyo3::ffi as pyffi;

/// Byte accounting for one interpreter.
#[derive(Debug, Default)]
pub struct MemoryBudget {
    used: AtomicUsize,
    limit: Option<usize>,
}

impl MemoryBudget {
    /// Creates a budget with the given cap in bytes.
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
        }
    }

    /// Bytes currently allocated by the interpreter.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// The configured cap, if any.
    #[must_use]
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Checks whether a block of `old` bytes may become `new` bytes.
    ///
    /// Shrinking is always allowed: Lua assumes it never fails.
    fn admits(&self, old: usize, new: usize) -> bool {
        match self.limit {
            Some(limit) if new > old => self.used().saturating_sub(old).saturating_add(new) <= limit,
            _ => true,
        }
    }

    fn resize(&self, old: usize, new: usize) {
        if new >= old {
            self.used.fetch_add(new - old, Ordering::Relaxed);
        } else {
            self.used.fetch_sub(old - new, Ordering::Relaxed);
        }
    }
}

/// The `lua_Alloc` function handed to `lua_newstate`.
///
/// `ud` must point to the runtime's boxed [`MemoryBudget`], which outlives the
/// interpreter.
pub(crate) unsafe extern "C-unwind" fn host_alloc(
    ud: *mut c_void,
    block: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    // SAFETY: the runtime passes a pointer to its boxed budget, which is only
    // dropped after `lua_close` returned.
    let budget = unsafe { &*ud.cast::<MemoryBudget>() };
    // when `block` is null, `osize` encodes the kind of object being created
    let old = if block.is_null() { 0 } else { osize };

    if nsize == 0 {
        if !block.is_null() {
            // SAFETY: `block` was returned by `PyMem_Realloc` below.
            unsafe { pyffi::PyMem_Free(block) };
            budget.resize(old, 0);
        }
        return ptr::null_mut();
    }

    if !budget.admits(old, nsize) {
        return ptr::null_mut();
    }
    // SAFETY: `block` is null or was returned by a previous call; the caller
    // is attached to the interpreter (see module docs).
    let grown = unsafe { pyffi::PyMem_Realloc(block, nsize) };
    if !grown.is_null() {
        budget.resize(old, nsize);
    }
    grown
}
