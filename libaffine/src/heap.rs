/// Group heap
///
/// Each group bump-allocates out of one chunk at a time. Allocation advances
/// the group cursor; freeing decrements the owning chunk's live count and, on
/// the last free, either resets the cursor for in-place reuse (if the chunk
/// is still the group's current one) or retires the chunk to the slab layer.

use core::ptr;

use crate::align::{is_aligned, offset_to_next, prev_aligned};
use crate::slab::{ChunkHeader, SlabState, CHUNK_HEADER_SIZE};
use crate::{CHUNK_SIZE, DEFAULT_ALIGNMENT, MAX_SIZE, NUM_GROUPS};

#[cfg(feature = "stats")]
use crate::align::next_aligned;
#[cfg(feature = "stats")]
use crate::slab::Retired;
#[cfg(feature = "stats")]
use crate::PAGE_SIZE;

#[derive(Clone, Copy)]
struct Group {
    /// Bump cursor into the group's current chunk; 0 before the first chunk.
    curr: usize,
}

pub struct GroupHeap {
    groups: [Group; NUM_GROUPS],
    slab: SlabState,
    #[cfg(feature = "stats")]
    group_resident: [u64; NUM_GROUPS],
}

impl GroupHeap {
    pub const fn new() -> Self {
        GroupHeap {
            groups: [Group { curr: 0 }; NUM_GROUPS],
            slab: SlabState::new(),
            #[cfg(feature = "stats")]
            group_resident: [0; NUM_GROUPS],
        }
    }

    /// True iff `ptr` was handed out by a group, i.e. it lies in the slab.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.slab.contains(ptr as usize)
    }

    pub fn slab_end(&self) -> usize {
        self.slab.slab_end()
    }

    pub fn spare_chunks(&self) -> usize {
        self.slab.num_spare_chunks()
    }

    // ------------------------------------------------------------------
    // Allocation entry points
    // ------------------------------------------------------------------

    /// Bump-allocate `req_size` bytes in `group` at `alignment`. Requests of
    /// size zero still produce a distinct usable address.
    ///
    /// # Safety
    /// Single-threaded use only; `group` must be a valid group index.
    pub unsafe fn aligned_alloc(
        &mut self,
        group: usize,
        alignment: usize,
        req_size: usize,
    ) -> *mut u8 {
        let req_size = req_size.max(1);
        let mut curr = self.groups[group].curr;
        let mut offset = offset_to_next(curr, alignment);
        let mut size = offset + req_size;
        assert!(req_size <= MAX_SIZE && size < CHUNK_SIZE);

        // No chunk yet, or the bump would cross the chunk boundary.
        if curr == 0 || prev_aligned(curr + size, CHUNK_SIZE) > curr {
            curr = self.fresh_chunk(group);
            offset = offset_to_next(curr, alignment);
            size = offset + req_size;
        }
        let address = curr + offset;

        let chunk = prev_aligned(curr, CHUNK_SIZE);
        let hdr = chunk as *mut ChunkHeader;
        (*hdr).live_objects += 1;
        self.groups[group].curr = curr + size;

        #[cfg(feature = "stats")]
        self.note_resident(group, chunk);

        debug_assert!(is_aligned(address, alignment));
        debug_log!(
            "[affine] group {} allocated {} bytes: {:#x}",
            group,
            req_size,
            address
        );
        address as *mut u8
    }

    /// # Safety
    /// See [`GroupHeap::aligned_alloc`].
    pub unsafe fn malloc(&mut self, group: usize, req_size: usize) -> *mut u8 {
        self.aligned_alloc(group, DEFAULT_ALIGNMENT, req_size)
    }

    /// # Safety
    /// See [`GroupHeap::aligned_alloc`].
    pub unsafe fn calloc(&mut self, group: usize, number: usize, req_size: usize) -> *mut u8 {
        let size = number * req_size;
        let address = self.aligned_alloc(group, DEFAULT_ALIGNMENT, size);
        ptr::write_bytes(address, 0, size);
        address
    }

    /// # Safety
    /// See [`GroupHeap::aligned_alloc`]; `out` must be valid for writes.
    pub unsafe fn posix_memalign(
        &mut self,
        group: usize,
        out: *mut *mut u8,
        alignment: usize,
        req_size: usize,
    ) -> i32 {
        *out = self.aligned_alloc(group, alignment, req_size);
        0
    }

    /// # Safety
    /// `ptr` must be a live pointer previously returned by this heap.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let chunk = prev_aligned(ptr as usize, CHUNK_SIZE);
        let hdr = chunk as *mut ChunkHeader;

        debug_log!("[affine] freeing {:#x}", ptr as usize);
        (*hdr).live_objects -= 1;
        if (*hdr).live_objects != 0 {
            return;
        }

        // Last object gone. A chunk still being bumped into is reset in
        // place; anything else goes back to the slab layer.
        let group = (*hdr).group_id as usize;
        assert!(group < NUM_GROUPS);
        let curr_chunk = prev_aligned(self.groups[group].curr, CHUNK_SIZE);
        if chunk == curr_chunk {
            debug_log!("[affine] resetting chunk {:#x} for immediate reuse", chunk);
            self.groups[group].curr = chunk + CHUNK_HEADER_SIZE;
            return;
        }

        #[cfg(feature = "stats")]
        let chunk_resident = (*hdr).resident;

        let retired = self.slab.retire_chunk(hdr);

        #[cfg(feature = "stats")]
        if retired == Retired::Released {
            self.group_resident[group] -= chunk_resident;
        }
        #[cfg(not(feature = "stats"))]
        let _ = retired;
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Put a new chunk under `group` and point its cursor just past the
    /// header.
    unsafe fn fresh_chunk(&mut self, group: usize) -> usize {
        let chunk = self.slab.allocate_chunk();
        let hdr = chunk as *mut ChunkHeader;
        (*hdr).group_id = group as u64;
        self.groups[group].curr = chunk + CHUNK_HEADER_SIZE;
        self.groups[group].curr
    }

    /// Track the page-granular high-water mark of the chunk being bumped.
    #[cfg(feature = "stats")]
    unsafe fn note_resident(&mut self, group: usize, chunk: usize) {
        let hdr = chunk as *mut ChunkHeader;
        let consumed = next_aligned(self.groups[group].curr - chunk, PAGE_SIZE) as u64;

        self.slab.stats.resident -= (*hdr).resident;
        self.group_resident[group] -= (*hdr).resident;
        (*hdr).resident = (*hdr).resident.max(consumed);
        self.slab.stats.resident += (*hdr).resident;
        self.group_resident[group] += (*hdr).resident;

        if self.slab.stats.resident > self.slab.stats.peak_resident {
            self.slab.stats.peak_resident = self.slab.stats.resident;
        }
    }

    /// Dump the resident footprint counters to stderr.
    #[cfg(feature = "stats")]
    pub fn print_stats(&self) {
        for (group, resident) in self.group_resident.iter().enumerate() {
            eprintln!("[affine-stats] group {} resident: {}", group, resident);
        }
        eprintln!("[affine-stats] final live_chunks: {}", self.slab.stats.live_chunks);
        eprintln!("[affine-stats] final resident: {}", self.slab.stats.resident);
        eprintln!("[affine-stats] peak resident: {}", self.slab.stats.peak_resident);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SLAB_SIZE;

    unsafe fn live_objects(ptr: *const u8) -> u64 {
        let hdr = prev_aligned(ptr as usize, CHUNK_SIZE) as *const ChunkHeader;
        (*hdr).live_objects
    }

    #[test]
    fn test_in_group_contiguity() {
        let mut heap = GroupHeap::new();
        let foo = b"Hello, world!\0";
        let bar = b"Goodbye, cruel world.\0";

        for group in 0..NUM_GROUPS {
            unsafe {
                let str_foo = heap.calloc(group, foo.len(), 1);
                // An unrelated allocation outside the groups must not
                // disturb in-group placement.
                let unrelated = vec![0u8; 64];
                let str_bar = heap.calloc(group, bar.len(), 1);
                drop(unrelated);

                ptr::copy_nonoverlapping(foo.as_ptr(), str_foo, foo.len());
                ptr::copy_nonoverlapping(bar.as_ptr(), str_bar, bar.len());
                assert_eq!(str_bar as usize, str_foo as usize + foo.len());
                assert_eq!(std::slice::from_raw_parts(str_foo, foo.len()), foo);
                assert_eq!(std::slice::from_raw_parts(str_bar, bar.len()), bar);

                heap.free(str_foo);
                heap.free(str_bar);
            }
        }
    }

    #[test]
    fn test_successive_small_objects_are_adjacent() {
        let mut heap = GroupHeap::new();
        unsafe {
            let mut numbers = [ptr::null_mut::<u8>(); 10];
            for i in 0..numbers.len() {
                numbers[i] = heap.malloc(0, 4);
                (numbers[i] as *mut u32).write_unaligned(i as u32 + 1);
                if i > 0 {
                    assert_eq!(numbers[i] as usize, numbers[i - 1] as usize + 4);
                }
            }
            for (i, &p) in numbers.iter().enumerate() {
                assert_eq!((p as *const u32).read_unaligned(), i as u32 + 1);
                heap.free(p);
            }
        }
    }

    #[test]
    fn test_calloc_zero_initialises_recycled_memory() {
        let mut heap = GroupHeap::new();
        unsafe {
            // Dirty a region, free it so the chunk resets, then calloc the
            // same bytes back.
            let dirty = heap.malloc(1, 512);
            ptr::write_bytes(dirty, 0xa5, 512);
            heap.free(dirty);

            let zeroes = heap.calloc(1, 128, 4);
            assert_eq!(zeroes, dirty);
            assert!(std::slice::from_raw_parts(zeroes, 512).iter().all(|&b| b == 0));
            heap.free(zeroes);
        }
    }

    #[test]
    fn test_zero_size_request_is_usable() {
        let mut heap = GroupHeap::new();
        unsafe {
            let a = heap.malloc(0, 0);
            let b = heap.malloc(0, 0);
            assert!(!a.is_null());
            // Zero-size requests occupy one byte each.
            assert_eq!(b as usize, a as usize + 1);
            heap.free(a);
            heap.free(b);
        }
    }

    #[test]
    fn test_live_object_counting() {
        let mut heap = GroupHeap::new();
        unsafe {
            let a = heap.malloc(2, 16);
            let b = heap.malloc(2, 16);
            let c = heap.malloc(2, 16);
            assert_eq!(live_objects(a), 3);
            heap.free(b);
            assert_eq!(live_objects(a), 2);
            heap.free(a);
            heap.free(c);
        }
    }

    #[test]
    fn test_bump_reset_reclaims_current_chunk() {
        let mut heap = GroupHeap::new();
        unsafe {
            let a = heap.malloc(0, 512);
            let b = heap.malloc(0, 64);
            heap.free(a);
            heap.free(b);
            // Chunk emptied while current: the cursor rewinds, so the next
            // allocation reuses the same address.
            let c = heap.malloc(0, 512);
            assert_eq!(c, a);
            heap.free(c);
        }
    }

    #[test]
    fn test_emptied_chunk_joins_spare_list_and_is_reused() {
        let mut heap = GroupHeap::new();
        unsafe {
            // Two maximum-size objects cannot share one chunk, forcing the
            // second onto a fresh chunk.
            let a = heap.malloc(0, MAX_SIZE);
            let b = heap.malloc(0, MAX_SIZE);
            assert_ne!(
                prev_aligned(a as usize, CHUNK_SIZE),
                prev_aligned(b as usize, CHUNK_SIZE)
            );

            heap.free(a);
            assert_eq!(heap.spare_chunks(), 1);

            // The next chunk request pops the spare instead of carving a new
            // one, bringing the old address back.
            let c = heap.malloc(0, MAX_SIZE);
            assert_eq!(c, a);
            assert_eq!(heap.spare_chunks(), 0);

            heap.free(b);
            heap.free(c);
        }
    }

    #[test]
    fn test_posix_memalign_alignment() {
        let mut heap = GroupHeap::new();
        unsafe {
            // Skew the cursor first so the alignment work is real.
            let skew = heap.malloc(0, 3);

            let mut aligned: *mut u8 = ptr::null_mut();
            let ret = heap.posix_memalign(0, &mut aligned, 64, 1);
            assert_eq!(ret, 0);
            assert!(!aligned.is_null());
            assert!(is_aligned(aligned as usize, 64));

            heap.free(skew);
            heap.free(aligned);
        }
    }

    #[test]
    fn test_realloc_style_copy_preserves_prefix() {
        let mut heap = GroupHeap::new();
        unsafe {
            let old = heap.calloc(1, 128, 4);
            for i in 0..512u32 {
                *old.add(i as usize) = i as u8;
            }

            // The interposition layer shrinks by allocating fresh, copying
            // min(new size, distance to slab end), and freeing the original.
            let new = heap.malloc(1, 64);
            let num = 64usize.min(heap.slab_end() - old as usize);
            ptr::copy_nonoverlapping(old as *const u8, new, num);
            heap.free(old);

            for i in 0..64usize {
                assert_eq!(*new.add(i), i as u8);
            }
            heap.free(new);
        }
    }

    #[test]
    fn test_slab_membership() {
        let mut heap = GroupHeap::new();
        let on_stack = 0u8;
        assert!(!heap.contains(&on_stack));
        unsafe {
            let p = heap.malloc(0, 8);
            assert!(heap.contains(p));
            assert!(heap.contains(p.add(7)));
            assert!(!heap.contains((heap.slab_end() + 1) as *const u8));
            heap.free(p);
        }
    }

    #[test]
    fn test_every_group_draws_from_one_slab() {
        let mut heap = GroupHeap::new();
        unsafe {
            let mut ptrs = Vec::new();
            for group in 0..NUM_GROUPS {
                ptrs.push(heap.malloc(group, 32));
            }
            let slab_base = heap.slab_end() - SLAB_SIZE;
            for &p in &ptrs {
                assert!((p as usize) >= slab_base && (p as usize) < heap.slab_end());
            }
            for p in ptrs {
                heap.free(p);
            }
        }
    }
}
