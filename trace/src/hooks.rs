//! Replacement `malloc` / `free` / `realloc` entry points.
//!
//! Built only with the `hooks` feature and intended for the cdylib build,
//! loaded ahead of libc via `LD_PRELOAD`. The underlying implementations are
//! resolved through the dynamic linker at [`initialize`]; until that has
//! happened the bodies escape to the `__libc_*` entry points, so allocations
//! made during resolution itself cannot recurse.

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_char, size_t, RTLD_NEXT};
use memtrace_types::AllocationKind;

use crate::error::HookError;
use crate::tracer::Tracer;

type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);

extern "C" {
    fn __libc_malloc(size: size_t) -> *mut c_void;
    fn __libc_free(ptr: *mut c_void);
    fn __libc_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void;
}

fn resolve(symbol: &'static [u8]) -> usize {
    debug_assert!(symbol.ends_with(b"\0"));
    unsafe { libc::dlsym(RTLD_NEXT, symbol.as_ptr() as *const c_char) as usize }
}

/// Resolve the next underlying implementations of the three primitives.
/// On failure the hooks stay in pass-through mode.
pub fn initialize() -> Result<(), HookError> {
    let malloc_ptr = resolve(b"malloc\0");
    if malloc_ptr == 0 {
        return Err(HookError::SymbolResolution { symbol: "malloc" });
    }
    let free_ptr = resolve(b"free\0");
    if free_ptr == 0 {
        return Err(HookError::SymbolResolution { symbol: "free" });
    }
    let realloc_ptr = resolve(b"realloc\0");
    if realloc_ptr == 0 {
        return Err(HookError::SymbolResolution { symbol: "realloc" });
    }
    REAL_MALLOC.store(malloc_ptr, Ordering::SeqCst);
    REAL_FREE.store(free_ptr, Ordering::SeqCst);
    REAL_REALLOC.store(realloc_ptr, Ordering::SeqCst);
    Ok(())
}

fn real_malloc() -> Option<MallocFn> {
    let ptr = REAL_MALLOC.load(Ordering::Relaxed);
    (ptr != 0).then(|| unsafe { std::mem::transmute::<usize, MallocFn>(ptr) })
}

fn real_free() -> Option<FreeFn> {
    let ptr = REAL_FREE.load(Ordering::Relaxed);
    (ptr != 0).then(|| unsafe { std::mem::transmute::<usize, FreeFn>(ptr) })
}

fn real_realloc() -> Option<ReallocFn> {
    let ptr = REAL_REALLOC.load(Ordering::Relaxed);
    (ptr != 0).then(|| unsafe { std::mem::transmute::<usize, ReallocFn>(ptr) })
}

/// # Safety
///
/// Same contract as libc `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let Some(real) = real_malloc() else {
        return __libc_malloc(size);
    };
    let ptr = real(size);
    if !ptr.is_null() {
        if let Some(tracer) = Tracer::global() {
            tracer.record_allocation_from(
                ptr as u64,
                size as u64,
                AllocationKind::Allocate,
                "allocate",
                malloc as usize as *mut c_void,
            );
        }
    }
    ptr
}

/// # Safety
///
/// Same contract as libc `free`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let Some(real) = real_free() else {
        __libc_free(ptr);
        return;
    };
    // The release is recorded before the underlying free so a racing
    // allocation cannot observe the address as still live.
    if !ptr.is_null() {
        if let Some(tracer) = Tracer::global() {
            tracer.record_deallocation(ptr as u64);
        }
    }
    real(ptr)
}

/// # Safety
///
/// Same contract as libc `realloc`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let Some(real) = real_realloc() else {
        return __libc_realloc(ptr, size);
    };
    let new_ptr = real(ptr, size);
    if let Some(tracer) = Tracer::global() {
        if !ptr.is_null() {
            tracer.record_deallocation(ptr as u64);
        }
        if !new_ptr.is_null() {
            tracer.record_allocation_from(
                new_ptr as u64,
                size as u64,
                AllocationKind::Reallocate,
                "reallocate",
                realloc as usize as *mut c_void,
            );
        }
    }
    new_ptr
}
