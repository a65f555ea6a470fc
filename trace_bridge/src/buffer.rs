//! Text buffers handed across the C boundary.

use std::{
    ffi::{c_char, CStr, CString},
    mem::ManuallyDrop,
    ptr::NonNull,
};

use tracing::error;

/// A NUL-terminated text buffer allocated by this library.
///
/// The buffer is owned by Rust code until [`ForeignBuffer::into_raw`] hands
/// it to a foreign caller. From then on nothing reclaims it automatically:
/// the caller must give the pointer back exactly once, which ends up in
/// [`ForeignBuffer::from_raw`] and frees the memory on drop.
///
/// Memory comes from the Rust global allocator, so it must never be released
/// with the C library's `free`.
#[derive(Debug)]
pub struct ForeignBuffer(NonNull<c_char>);

// The buffer is uniquely owned and never mutated after allocation.
unsafe impl Send for ForeignBuffer {}

impl ForeignBuffer {
    /// Copies `content` plus a terminating NUL into a fresh allocation.
    ///
    /// Interior NUL bytes would cut the text short for a C reader, so each
    /// one is replaced with U+FFFD.
    pub fn allocate(content: impl Into<Vec<u8>>) -> Self {
        let c_string = nul_free(content.into());
        let raw = c_string.into_raw();
        registry::track(raw);
        // SAFETY: `CString::into_raw` never returns null.
        Self(unsafe { NonNull::new_unchecked(raw) })
    }

    /// Takes back ownership of a pointer returned by
    /// [`ForeignBuffer::into_raw`]. Returns `None` for null.
    ///
    /// # Safety
    ///
    /// `raw` must be null or come from [`ForeignBuffer::into_raw`], and must
    /// not have been passed to this function before. Anything else is
    /// undefined behaviour. Debug builds detect a repeated release of a
    /// pointer that has not been handed out again in the meantime and log it
    /// instead of freeing twice.
    pub unsafe fn from_raw(raw: *mut c_char) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    /// Hands the buffer to a foreign caller.
    pub fn into_raw(self) -> *mut c_char {
        ManuallyDrop::new(self).0.as_ptr()
    }

    pub fn as_c_str(&self) -> &CStr {
        // SAFETY: the pointer came from `CString::into_raw` and stays valid
        // until `self` is dropped.
        unsafe { CStr::from_ptr(self.0.as_ptr()) }
    }
}

impl Drop for ForeignBuffer {
    fn drop(&mut self) {
        let raw = self.0.as_ptr();
        if !registry::untrack(raw) {
            error!(ptr = ?raw, "refusing to release a buffer that is not outstanding");
            return;
        }
        // SAFETY: `raw` came from `CString::into_raw` and ownership is unique.
        drop(unsafe { CString::from_raw(raw) });
    }
}

/// Allocates a buffer for `content` and hands it to the caller.
pub fn allocate(content: impl Into<Vec<u8>>) -> *mut c_char {
    ForeignBuffer::allocate(content).into_raw()
}

/// Frees a buffer returned by [`allocate`]. Null is ignored.
///
/// # Safety
///
/// See [`ForeignBuffer::from_raw`]: every buffer may be released exactly
/// once, and only buffers produced by this library may be released.
pub unsafe fn release(raw: *mut c_char) {
    drop(ForeignBuffer::from_raw(raw));
}

fn nul_free(mut bytes: Vec<u8>) -> CString {
    if bytes.contains(&0) {
        bytes = bytes
            .split(|b| *b == 0)
            .collect::<Vec<_>>()
            .join(char::REPLACEMENT_CHARACTER.to_string().as_bytes());
    }
    // SAFETY: every NUL byte was replaced above.
    unsafe { CString::from_vec_unchecked(bytes) }
}

/// Whether `raw` is a buffer handed out and not yet released.
#[cfg(debug_assertions)]
pub fn is_outstanding(raw: *const c_char) -> bool {
    registry::OUTSTANDING.lock().contains(&(raw as usize))
}

#[cfg(debug_assertions)]
mod registry {
    use std::{collections::HashSet, ffi::c_char};

    use once_cell::sync::Lazy;
    use parking_lot::Mutex;

    pub(super) static OUTSTANDING: Lazy<Mutex<HashSet<usize>>> = Lazy::new(Default::default);

    pub(super) fn track(raw: *mut c_char) {
        OUTSTANDING.lock().insert(raw as usize);
    }

    pub(super) fn untrack(raw: *mut c_char) -> bool {
        OUTSTANDING.lock().remove(&(raw as usize))
    }
}

#[cfg(not(debug_assertions))]
mod registry {
    use std::ffi::c_char;

    pub(super) fn track(_: *mut c_char) {}

    pub(super) fn untrack(_: *mut c_char) -> bool {
        true
    }
}
