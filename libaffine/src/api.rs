/// C ABI interposition
///
/// Replaces the six standard allocation entry points. Every request is
/// classified by the group oracle: routed sizes go to the group heap, the
/// rest forward to the real libc implementations resolved lazily via the
/// dynamic linker's next-symbol lookup. The real function pointers cannot be
/// resolved in a constructor — this library's constructor may run before the
/// target malloc library's — so each is fetched on first use.

use core::cell::UnsafeCell;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering::Relaxed};

use libc::{c_int, c_void};

use crate::boot::BootstrapAllocator;
use crate::heap::GroupHeap;
use crate::oracle::get_group_id;

struct HeapCell(UnsafeCell<GroupHeap>);

// Supported targets are single-threaded; nothing synchronizes heap access.
unsafe impl Sync for HeapCell {}

static HEAP: HeapCell = HeapCell(UnsafeCell::new(GroupHeap::new()));
static BOOTSTRAP: BootstrapAllocator = BootstrapAllocator::new();

#[allow(clippy::mut_from_ref)]
unsafe fn heap() -> &'static mut GroupHeap {
    &mut *HEAP.0.get()
}

// ------------------------------------------------------------------
// Lazily resolved libc implementations
// ------------------------------------------------------------------

mod real {
    use super::*;

    pub unsafe fn next_sym(name: &'static core::ffi::CStr) -> *mut c_void {
        libc::dlsym(libc::RTLD_NEXT, name.as_ptr())
    }

    pub unsafe fn malloc(size: usize) -> *mut c_void {
        static NEXT: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
        let mut f = NEXT.load(Relaxed);
        if f.is_null() {
            f = next_sym(c"malloc");
            NEXT.store(f, Relaxed);
        }
        let f: unsafe extern "C" fn(usize) -> *mut c_void = mem::transmute(f);
        f(size)
    }

    pub unsafe fn free(ptr: *mut c_void) {
        static NEXT: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
        let mut f = NEXT.load(Relaxed);
        if f.is_null() {
            f = next_sym(c"free");
            NEXT.store(f, Relaxed);
        }
        let f: unsafe extern "C" fn(*mut c_void) = mem::transmute(f);
        f(ptr)
    }

    pub unsafe fn posix_memalign(out: *mut *mut c_void, alignment: usize, size: usize) -> c_int {
        static NEXT: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
        let mut f = NEXT.load(Relaxed);
        if f.is_null() {
            f = next_sym(c"posix_memalign");
            NEXT.store(f, Relaxed);
        }
        let f: unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int = mem::transmute(f);
        f(out, alignment, size)
    }

    pub unsafe fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
        static NEXT: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
        let mut f = NEXT.load(Relaxed);
        if f.is_null() {
            f = next_sym(c"aligned_alloc");
            NEXT.store(f, Relaxed);
        }
        let f: unsafe extern "C" fn(usize, usize) -> *mut c_void = mem::transmute(f);
        f(alignment, size)
    }

    pub unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        static NEXT: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
        let mut f = NEXT.load(Relaxed);
        if f.is_null() {
            f = next_sym(c"realloc");
            NEXT.store(f, Relaxed);
        }
        let f: unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void = mem::transmute(f);
        f(ptr, size)
    }
}

// ------------------------------------------------------------------
// Interposed entry points
// ------------------------------------------------------------------

/// # Safety
/// C ABI allocation contract; single-threaded callers only.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let group = get_group_id(size);
    if group > -1 {
        heap().malloc(group as usize, size) as *mut c_void
    } else {
        real::malloc(size)
    }
}

/// # Safety
/// C ABI allocation contract; single-threaded callers only.
#[no_mangle]
pub unsafe extern "C" fn calloc(number: usize, size: usize) -> *mut c_void {
    static RESOLVING: AtomicBool = AtomicBool::new(false);
    static REAL_CALLOC: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

    // dlsym itself callocs on first use; feed those requests from the
    // scratch buffer instead of re-entering the resolver.
    if RESOLVING.load(Relaxed) {
        return BOOTSTRAP.alloc(number, size) as *mut c_void;
    }
    let mut f = REAL_CALLOC.load(Relaxed);
    if f.is_null() {
        RESOLVING.store(true, Relaxed);
        f = real::next_sym(c"calloc");
        RESOLVING.store(false, Relaxed);
        REAL_CALLOC.store(f, Relaxed);
    }

    let group = get_group_id(number.wrapping_mul(size));
    if group > -1 {
        heap().calloc(group as usize, number, size) as *mut c_void
    } else {
        let f: unsafe extern "C" fn(usize, usize) -> *mut c_void = mem::transmute(f);
        f(number, size)
    }
}

/// # Safety
/// C ABI allocation contract; single-threaded callers only.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    out: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    let group = get_group_id(size);
    if group > -1 {
        heap().posix_memalign(group as usize, out as *mut *mut u8, alignment, size)
    } else {
        real::posix_memalign(out, alignment, size)
    }
}

/// # Safety
/// C ABI allocation contract; single-threaded callers only.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    let group = get_group_id(size);
    if group > -1 {
        heap().aligned_alloc(group as usize, alignment, size) as *mut c_void
    } else {
        real::aligned_alloc(alignment, size)
    }
}

/// # Safety
/// C ABI allocation contract; single-threaded callers only.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if heap().contains(ptr as *const u8) {
        let object = malloc(size);
        if object.is_null() {
            return object;
        }
        // Copying trailing garbage is harmless as long as the copy never
        // leaves the slab, which stays mapped for the process lifetime.
        let to_end = heap().slab_end() - ptr as usize;
        let num = size.min(to_end);
        ptr::copy_nonoverlapping(ptr as *const u8, object as *mut u8, num);
        heap().free(ptr as *mut u8);
        return object;
    }
    real::realloc(ptr, size)
}

/// # Safety
/// C ABI allocation contract; single-threaded callers only.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    if heap().contains(ptr as *const u8) {
        heap().free(ptr as *mut u8);
    } else {
        real::free(ptr);
    }
}
