//! Fixed-capacity, first-fit heap with splitting and coalescing (spec §4.2).
//!
//! Grounded directly in the original C heap manager
//! (`examples/original_source/src/Kernel/heap.c`): `malloc`'s first-fit walk
//! of an address-ordered free list with a minimum-splittable-size
//! threshold, and `heap_insert_free_block`'s merge-with-both-neighbours
//! insertion. The C sentinel end-block trick (a fake, oversized block that
//! stops the search without an explicit end-of-list check) is replaced here
//! with a plain `Option<NonNull<_>>`-terminated list, the idiom this
//! crate's other intrusive lists (`list::List`) already use.
//!
//! Thread safety is the critical-section gate rather than a dedicated
//! mutex (spec §4.2 "either... or"): a heap is typically initialized
//! before tasks exist and is reachable from ISR-safe allocation paths, so
//! tying it to `Mutex` would impose a scheduler dependency the allocator
//! itself doesn't need.

use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::mem::{size_of, MaybeUninit};
use core::ptr::NonNull;

use crate::error::HeapError;
use crate::klock::{with_cs, CpuLockCell};

/// Every block (free or in use) is aligned to this boundary, which must be
/// at least `align_of::<BlockHeader>()`. Individual allocations may not
/// request a stricter alignment (spec has no notion of over-alignment).
pub const HEAP_ALIGN: usize = 8;

#[repr(C)]
struct BlockHeader {
    /// Total size of this block, header included.
    size: usize,
    next: Option<NonNull<BlockHeader>>,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// A surplus smaller than this is kept with the allocation rather than
/// split off, to avoid free blocks too small to ever satisfy a request
/// (spec §4.2 "four headers").
const MIN_SPLIT_SURPLUS: usize = 4 * HEADER_SIZE;

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// A heap backed by `N` bytes of `'static` storage, usually a single
/// crate-wide `static HEAP: Heap<SIZE> = Heap::new();`.
pub struct Heap<const N: usize> {
    mem: UnsafeCell<MaybeUninit<[u8; N]>>,
    free_head: CpuLockCell<Option<NonNull<BlockHeader>>>,
    bytes_used: CpuLockCell<usize>,
}

// Safety: every access to `mem` happens either during `init` (before the
// heap is shared) or while `free_head`/`bytes_used`'s critical section is
// held, which serializes all mutators.
unsafe impl<const N: usize> Sync for Heap<N> {}

impl<const N: usize> Heap<N> {
    pub const fn new() -> Self {
        assert!(N > HEADER_SIZE, "heap must be larger than one block header");
        Heap {
            mem: UnsafeCell::new(MaybeUninit::uninit()),
            free_head: CpuLockCell::new(None),
            bytes_used: CpuLockCell::new(0),
        }
    }

    /// Make the whole backing region available as one free block. Must be
    /// called exactly once, before the first `alloc`/`free`.
    pub fn init(&'static self) {
        let base = self.mem.get().cast::<u8>();
        // Safety: `self` is `'static` and this is the one-time setup call;
        // no other access to `mem` can be concurrent with it.
        let header = unsafe {
            let p = base.cast::<BlockHeader>();
            p.write(BlockHeader { size: N, next: None });
            NonNull::new_unchecked(p)
        };
        with_cs(|mut cs| self.free_head.replace(&mut cs, Some(header)));
    }

    /// Spec §4.2 `alloc`. First-fit; splits the chosen block if the
    /// leftover exceeds [`MIN_SPLIT_SURPLUS`].
    pub fn alloc(&'static self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        if layout.size() == 0 {
            return Err(HeapError::BadParam);
        }
        debug_assert!(layout.align() <= HEAP_ALIGN, "over-aligned request");

        let need = align_up(layout.size() + HEADER_SIZE, HEAP_ALIGN);
        if need > N {
            return Err(HeapError::OutOfMemory);
        }

        with_cs(|mut cs| {
            let mut prev: Option<NonNull<BlockHeader>> = None;
            let mut cursor = *self.free_head.read(&cs);

            while let Some(mut block) = cursor {
                // Safety: every pointer reachable from `free_head` refers
                // to a live, exclusively-owned-by-the-free-list header.
                let hdr = unsafe { block.as_mut() };
                if hdr.size < need {
                    prev = Some(block);
                    cursor = hdr.next;
                    continue;
                }

                let next = hdr.next;
                match prev {
                    // Safety: `p` is still linked into the free list.
                    Some(mut p) => unsafe { p.as_mut().next = next },
                    None => self.free_head.replace(&mut cs, next),
                }

                if hdr.size - need > MIN_SPLIT_SURPLUS {
                    let leftover = hdr.size - need;
                    hdr.size = need;
                    // Safety: `need` bytes starting at `block` are about to
                    // be handed to the caller; the bytes right after them,
                    // for `leftover` bytes, are still free and large enough
                    // to host a header.
                    let sub = unsafe {
                        let p = (block.as_ptr() as *mut u8).add(need).cast::<BlockHeader>();
                        p.write(BlockHeader { size: leftover, next: None });
                        NonNull::new_unchecked(p)
                    };
                    self.insert_free_sorted(&mut cs, sub);
                }

                let used = *self.bytes_used.read(&cs);
                self.bytes_used.replace(&mut cs, used + hdr.size);
                self.debug_check_invariants(&cs);

                // Safety: `block` points at a header of at least
                // `HEADER_SIZE` bytes followed by its payload.
                let payload = unsafe { (block.as_ptr() as *mut u8).add(HEADER_SIZE) };
                return Ok(unsafe { NonNull::new_unchecked(payload) });
            }

            Err(HeapError::OutOfMemory)
        })
    }

    /// Spec §4.2 `free`. No-op on a null pointer.
    ///
    /// # Safety
    /// `ptr`, if non-null, must be a value previously returned by
    /// [`Heap::alloc`] on this same heap, not yet freed.
    pub unsafe fn free(&'static self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else { return };
        // Safety: by this function's contract, `ptr - HEADER_SIZE` is the
        // header `alloc` wrote for this allocation.
        let header = unsafe {
            NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>())
        };

        with_cs(|mut cs| {
            let size = unsafe { header.as_ref().size };
            let used = *self.bytes_used.read(&cs);
            self.bytes_used.replace(&mut cs, used - size);
            self.insert_free_sorted(&mut cs, header);
            self.debug_check_invariants(&cs);
        });
    }

    /// Insert `block` into the free list in address order, merging with
    /// whichever of its immediate predecessor/successor are contiguous
    /// with it (spec §4.2 `heap_insert_free_block`).
    fn insert_free_sorted(
        &self,
        cs: &mut crate::klock::CsTokenRefMut<'_>,
        mut block: NonNull<BlockHeader>,
    ) {
        let addr = |p: NonNull<BlockHeader>| p.as_ptr() as usize;

        let mut prev: Option<NonNull<BlockHeader>> = None;
        let mut next = *self.free_head.read(cs);
        while let Some(c) = next {
            if addr(c) > addr(block) {
                break;
            }
            prev = Some(c);
            // Safety: `c` is linked into the free list, hence live.
            next = unsafe { c.as_ref().next };
        }

        // Safety: `block` was just carved out by the caller and every
        // other header touched below is still linked into the free list.
        unsafe {
            // Merge with the successor first, absorbing it into `block`.
            if let Some(succ) = next {
                if addr(block) + block.as_ref().size == addr(succ) {
                    let succ_next = succ.as_ref().next;
                    block.as_mut().size += succ.as_ref().size;
                    next = succ_next;
                }
            }
            block.as_mut().next = next;

            // Merge with the predecessor, absorbing `block` into it.
            if let Some(mut p) = prev {
                if addr(p) + p.as_ref().size == addr(block) {
                    p.as_mut().size += block.as_ref().size;
                    p.as_mut().next = block.as_ref().next;
                    return;
                }
                p.as_mut().next = Some(block);
                return;
            }
        }

        self.free_head.replace(cs, Some(block));
    }

    #[cfg(debug_assertions)]
    fn debug_check_invariants(&self, cs: &crate::klock::CsTokenRefMut<'_>) {
        let mut free_total = 0usize;
        let mut cursor = *self.free_head.read(cs);
        let mut prev_end: Option<usize> = None;
        while let Some(c) = cursor {
            // Safety: every node reachable from `free_head` is live.
            let hdr = unsafe { c.as_ref() };
            free_total += hdr.size;
            let start = c.as_ptr() as usize;
            if let Some(end) = prev_end {
                debug_assert!(start > end, "adjacent free blocks were not coalesced");
            }
            prev_end = Some(start + hdr.size);
            cursor = hdr.next;
        }
        debug_assert_eq!(free_total + *self.bytes_used.read(cs), N);
    }

    #[cfg(not(debug_assertions))]
    fn debug_check_invariants(&self, _cs: &crate::klock::CsTokenRefMut<'_>) {}

    /// Bytes currently handed out to callers, header overhead included.
    pub fn bytes_used(&self) -> usize {
        with_cs(|cs| *self.bytes_used.read(&cs))
    }
}

impl<const N: usize> Default for Heap<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased handle a [`Task`](crate::task::Task) uses to free its own
/// dynamic allocation (spec.md §4.6 `task_delete`: "free if dynamic")
/// without `Task` itself being generic over a heap's `HEAP_SIZE`.
pub(crate) trait DynFree: Sync {
    /// # Safety
    /// `ptr` must be a still-live value previously returned by [`Heap::alloc`]
    /// on this same heap.
    unsafe fn free_raw(&'static self, ptr: *mut u8);
}

impl<const N: usize> DynFree for Heap<N> {
    unsafe fn free_raw(&'static self, ptr: *mut u8) {
        // Safety: forwarded from this function's own contract.
        unsafe { self.free(ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spec §8 Scenario E: allocate 100/200/100 out of a 1000-byte heap,
    /// free the middle block, allocate 150 (which must reuse and split the
    /// freed 200-byte block), then free everything - the free list must
    /// collapse back to a single block covering the whole heap.
    #[test]
    fn split_then_coalesce_reclaims_the_whole_heap() {
        static HEAP: Heap<1000> = Heap::new();
        HEAP.init();

        let layout = |n| Layout::from_size_align(n, HEAP_ALIGN).unwrap();
        let a = HEAP.alloc(layout(100)).unwrap();
        let b = HEAP.alloc(layout(200)).unwrap();
        let c = HEAP.alloc(layout(100)).unwrap();

        // Safety: `b` was just allocated from `HEAP` and not yet freed.
        unsafe { HEAP.free(b.as_ptr()) };

        let d = HEAP.alloc(layout(150)).unwrap();
        assert!(HEAP.bytes_used() > 0);

        // Safety: each pointer was allocated from `HEAP` and not yet freed.
        unsafe {
            HEAP.free(a.as_ptr());
            HEAP.free(c.as_ptr());
            HEAP.free(d.as_ptr());
        }

        assert_eq!(HEAP.bytes_used(), 0);
        crate::klock::with_cs(|cs| {
            let only = (*HEAP.free_head.read(&cs)).expect("heap should have coalesced back to one block");
            // Safety: `only` came straight out of the free list, so it is live.
            assert_eq!(unsafe { only.as_ref().size }, 1000);
        });
    }

    #[test]
    fn alloc_of_zero_bytes_is_rejected() {
        static HEAP: Heap<64> = Heap::new();
        HEAP.init();
        assert!(matches!(
            HEAP.alloc(Layout::from_size_align(0, HEAP_ALIGN).unwrap()),
            Err(HeapError::BadParam)
        ));
    }

    #[test]
    fn alloc_larger_than_the_heap_is_out_of_memory() {
        static HEAP: Heap<64> = Heap::new();
        HEAP.init();
        assert!(matches!(
            HEAP.alloc(Layout::from_size_align(1000, HEAP_ALIGN).unwrap()),
            Err(HeapError::OutOfMemory)
        ));
    }
}
