/// Bootstrap allocation
///
/// The dynamic linker's symbol-resolution path callocs before the real
/// calloc has been resolved. Those first few requests are satisfied from a
/// fixed scratch region with a tiny bump cursor. Nothing allocated here is
/// ever freed; the buffer is zeroed by virtue of being a zeroed static.

use core::cell::{Cell, UnsafeCell};
use core::ptr;

use crate::align::offset_to_next;

pub const BOOTSTRAP_ALIGNMENT: usize = 16;
const SCRATCH_SIZE: usize = 128;

#[repr(align(16))]
struct Scratch([u8; SCRATCH_SIZE]);

pub struct BootstrapAllocator {
    scratch: UnsafeCell<Scratch>,
    used: Cell<usize>,
}

// Resolver re-entry happens on a single thread during process startup.
unsafe impl Sync for BootstrapAllocator {}

impl BootstrapAllocator {
    pub const fn new() -> Self {
        BootstrapAllocator {
            scratch: UnsafeCell::new(Scratch([0; SCRATCH_SIZE])),
            used: Cell::new(0),
        }
    }

    /// Carve `number * req_size` bytes out of the scratch region, or return
    /// null once it is exhausted.
    pub fn alloc(&self, number: usize, req_size: usize) -> *mut u8 {
        let base = self.scratch.get() as usize + self.used.get();
        let offset = offset_to_next(base, BOOTSTRAP_ALIGNMENT);
        let total = offset + number * req_size;
        if self.used.get() + total > SCRATCH_SIZE {
            return ptr::null_mut();
        }
        self.used.set(self.used.get() + total);
        (base + offset) as *mut u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::is_aligned;

    #[test]
    fn test_bootstrap_alignment_and_zeroing() {
        let boot = BootstrapAllocator::new();
        let a = boot.alloc(1, 24);
        assert!(!a.is_null());
        assert!(is_aligned(a as usize, BOOTSTRAP_ALIGNMENT));
        let bytes = unsafe { std::slice::from_raw_parts(a, 24) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bootstrap_allocations_do_not_overlap() {
        let boot = BootstrapAllocator::new();
        let a = boot.alloc(2, 8);
        let b = boot.alloc(1, 16);
        assert!(!a.is_null() && !b.is_null());
        assert!(b as usize >= a as usize + 16);
    }

    #[test]
    fn test_bootstrap_exhaustion_returns_null() {
        let boot = BootstrapAllocator::new();
        assert!(!boot.alloc(1, 64).is_null());
        assert!(!boot.alloc(1, 48).is_null());
        assert!(boot.alloc(1, 64).is_null());
    }
}
