use std::ptr::{self, NonNull};

use super::avl::PtrAvlTree;
use super::chunk::{
    Chunk, Segment, ALIGN_MASK, CHUNK_OVERHEAD, FIRST_CHUNK_OFFSET, MIN_CHUNK_SIZE,
    SEGMENT_OVERHEAD,
};
use super::log::{ErrorKind, EventSink, NoopSink};
use super::ring::ChunkRing;
use super::source::SegmentSource;

const NSMALLBINS: usize = 32;
const NTREEBINS: usize = 32;
const SMALLBIN_SHIFT: usize = 3;
const TREEBIN_SHIFT: usize = 8;

/// Smallest chunk size that is tree-binned instead of list-binned.
const MIN_LARGE_SIZE: usize = 1 << TREEBIN_SHIFT;
/// Smallest request that can only be satisfied by a tree-binned chunk.
const MIN_LARGE_REQUEST: usize = MIN_LARGE_SIZE - CHUNK_OVERHEAD - ALIGN_MASK;
/// Largest request that fits the smallest chunk.
const MIN_REQUEST: usize = MIN_CHUNK_SIZE - CHUNK_OVERHEAD;
/// Requests are bounded well below the address-space size so that adding
/// the chunk and segment overheads can never wrap.
const MAX_REQUEST: usize = usize::MAX >> 2;
/// Canary bytes verified on free in padding mode.
const MAX_PADDING_CHECK: usize = 8;

const DEFAULT_PADDING_BYTE: u8 = 0xCD;

#[inline]
fn chunk_size_for(request: usize) -> usize {
    (request + CHUNK_OVERHEAD + ALIGN_MASK) & !ALIGN_MASK
}

#[inline]
fn is_small(chunk_size: usize) -> bool {
    (chunk_size >> SMALLBIN_SHIFT) < NSMALLBINS
}

#[inline]
fn small_bin_index(chunk_size: usize) -> usize {
    chunk_size >> SMALLBIN_SHIFT
}

#[inline]
fn small_bin_size(bin: usize) -> usize {
    bin << SMALLBIN_SHIFT
}

/// Large bin for a chunk size: two bins per power of two, split on the bit
/// below the leading one. Sizes above the top class all land in the last
/// bin.
#[inline]
fn large_bin_index(chunk_size: usize) -> usize {
    let x = chunk_size >> TREEBIN_SHIFT;
    if x == 0 {
        0
    } else if x > 0xFFFF {
        NTREEBINS - 1
    } else {
        let k = (usize::BITS - 1 - x.leading_zeros()) as usize;
        (k << 1) + ((chunk_size >> (k + TREEBIN_SHIFT - 1)) & 1)
    }
}

/// Segregated-fit memory pool.
///
/// Free chunks below 256 bytes sit in exact-size circular lists, larger
/// ones in per-bin AVL trees keyed by size; two 32-bit maps mirror which
/// bins are non-empty. Memory comes from a [`SegmentSource`] in segments
/// that are only returned on [`release_all`](Pool::release_all) or drop.
/// Every pool is single-owner; there is no internal locking.
///
/// Soft failures (capacity, footprint limit, source exhaustion) return
/// `None`. Corruption (double free, canary damage) is reported to the
/// [`EventSink`] and then raised as a panic; a pool that panicked must not
/// be used again.
pub struct Pool<S: SegmentSource, L: EventSink = NoopSink> {
    source: S,
    sink: L,
    footprint_limit: usize,
    seg_list: Option<Segment>,
    small_map: u32,
    tree_map: u32,
    small_bins: [ChunkRing; NSMALLBINS],
    large_bins: [PtrAvlTree; NTREEBINS],
    footprint: usize,
    max_footprint: usize,
    storing_exact_size: bool,
    padding: bool,
    padding_byte: u8,
}

// Safety: the pool exclusively owns every segment it links; the raw
// pointers never alias another owner.
unsafe impl<S: SegmentSource + Send, L: EventSink + Send> Send for Pool<S, L> {}

impl<S: SegmentSource> Pool<S> {
    /// Pool with the default (no-op) event sink.
    pub fn new(source: S) -> Self {
        Pool::with_sink(source, NoopSink, false)
    }

    /// Pool that stamps trailing canary bytes into every allocation and
    /// verifies them on free. Implies exact-size recording.
    pub fn with_padding(source: S) -> Self {
        Pool::with_sink(source, NoopSink, true)
    }
}

impl<S: SegmentSource, L: EventSink> Pool<S, L> {
    pub fn with_sink(source: S, sink: L, padding: bool) -> Self {
        Pool {
            source,
            sink,
            footprint_limit: 0,
            seg_list: None,
            small_map: 0,
            tree_map: 0,
            small_bins: std::array::from_fn(|_| ChunkRing::new()),
            large_bins: std::array::from_fn(|_| PtrAvlTree::new()),
            footprint: 0,
            max_footprint: 0,
            storing_exact_size: padding,
            padding,
            padding_byte: DEFAULT_PADDING_BYTE,
        }
    }

    /// Allocate at least `user_size` bytes, 16-byte aligned. Returns
    /// `None` when the request is oversized, the footprint limit would be
    /// exceeded, or the source is exhausted.
    pub fn allocate(&mut self, user_size: usize) -> Option<NonNull<u8>> {
        let alloc_size = self.min_alloc_size(user_size);

        let chunk_size;
        if alloc_size < MIN_LARGE_REQUEST {
            chunk_size = if alloc_size < MIN_REQUEST {
                MIN_CHUNK_SIZE
            } else {
                chunk_size_for(alloc_size)
            };
            let bin = small_bin_index(chunk_size);
            let small_bits = self.small_map >> bin;

            if small_bits & 0x3 != 0 {
                // The exact class, or the one above it, has a chunk. Both
                // are too tight to be worth splitting.
                let bin = bin + (!small_bits & 1) as usize;
                // Safety: the bitmap says the ring is non-empty.
                unsafe {
                    let chunk = self.pop_small(bin);
                    debug_assert_eq!(chunk.chunk_size(), small_bin_size(bin));
                    return Some(self.finish_alloc(chunk, user_size));
                }
            }
            if small_bits != 0 {
                // Take the next non-empty class and split off the excess.
                let bin = bin + small_bits.trailing_zeros() as usize;
                // Safety: the bitmap says the ring is non-empty.
                unsafe {
                    let chunk = self.pop_small(bin);
                    debug_assert_eq!(chunk.chunk_size(), small_bin_size(bin));
                    let chunk = self.split(chunk, chunk_size);
                    return Some(self.finish_alloc(chunk, user_size));
                }
            }
        } else if alloc_size >= MAX_REQUEST {
            self.sink.on_alloc(ptr::null_mut(), user_size);
            return None;
        } else {
            chunk_size = chunk_size_for(alloc_size);
        }

        // Safety: bin structures and segment list are consistent.
        let chunk = unsafe {
            let mut chunk = if self.tree_map != 0 {
                self.tree_alloc(chunk_size)
            } else {
                None
            };
            if chunk.is_none() {
                chunk = self.segment_alloc(chunk_size);
            }
            chunk
        };

        match chunk {
            // Safety: the chunk was just carved and is exclusively ours.
            Some(chunk) => unsafe { Some(self.finish_alloc(chunk, user_size)) },
            None => {
                self.sink.on_alloc(ptr::null_mut(), user_size);
                None
            }
        }
    }

    /// Resize an allocation. With a null `ptr` this is `allocate`. A
    /// shrinking request is satisfied in place (the pointer is returned
    /// unchanged); a growing one moves the data to a fresh chunk. On
    /// failure `None` is returned and the old pointer stays valid.
    ///
    /// # Safety
    /// `ptr` must be null or a live pointer obtained from this pool.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, new_user_size: usize) -> Option<NonNull<u8>> {
        let Some(user) = NonNull::new(ptr) else {
            return self.allocate(new_user_size);
        };
        let chunk = Chunk::from_user(user);
        let old_user_size = match chunk.user_size() {
            Some(size) => size,
            None => self.fatal(ptr, ErrorKind::Padding),
        };
        let old_chunk_size = chunk.chunk_size();

        let new_alloc_size = self.min_alloc_size(new_user_size);
        if new_alloc_size >= MAX_REQUEST {
            return None;
        }
        let new_chunk_size = if new_alloc_size < MIN_REQUEST {
            MIN_CHUNK_SIZE
        } else {
            chunk_size_for(new_alloc_size)
        };

        if new_chunk_size <= old_chunk_size {
            self.sink.on_shrink(ptr, old_user_size, new_user_size);
            // Clear the old flags and delta byte before re-stamping.
            chunk.set_free_size(old_chunk_size);
            self.split(chunk, new_chunk_size);
            self.stamp_used(chunk, new_user_size);
            return Some(user);
        }

        let new_ptr = self.allocate(new_user_size)?;
        ptr::copy_nonoverlapping(
            user.as_ptr(),
            new_ptr.as_ptr(),
            old_user_size.min(new_user_size),
        );
        self.deallocate(ptr);
        Some(new_ptr)
    }

    /// Allocate a zeroed region of `count * size` bytes. Multiplication
    /// wraparound is a soft failure.
    pub fn callocate(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let ptr = self.allocate(total)?;
        // Safety: the returned region covers at least `total` bytes.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Some(ptr)
    }

    /// Return an allocation to its bin. Freeing null logs a zero-size
    /// deallocation and returns. Freeing a chunk that is not in use, or
    /// one whose padding canaries were damaged, reports the corruption to
    /// the sink and panics.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer obtained from this pool.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        let Some(user) = NonNull::new(ptr) else {
            self.sink.on_dealloc(ptr::null_mut(), 0);
            return;
        };
        let chunk = Chunk::from_user(user);
        if !chunk.is_used() {
            self.fatal(ptr, ErrorKind::DoubleFree);
        }
        let chunk_size = chunk.chunk_size();
        let user_size = match chunk.user_size() {
            Some(size) => size,
            None => self.fatal(ptr, ErrorKind::Padding),
        };
        if self.padding {
            let used = user_size + CHUNK_OVERHEAD;
            debug_assert!(used < chunk_size, "padded chunk with no trailing slack");
            let canaries = (chunk_size - used - 1).min(MAX_PADDING_CHECK);
            let pad = chunk.base().add(used);
            for i in 0..canaries {
                if *pad.add(i) != self.padding_byte {
                    self.fatal(ptr, ErrorKind::Padding);
                }
            }
        }
        self.sink.on_dealloc(ptr, user_size);
        chunk.set_free_size(chunk_size);
        self.push_free(chunk);
    }

    /// Whether `ptr` falls inside a segment owned by this pool. With
    /// `check_used`, additionally require that it points at a live
    /// allocation.
    pub fn contains(&self, ptr: *const u8, check_used: bool) -> bool {
        let addr = ptr as usize;
        let mut seg = self.seg_list;
        while let Some(current) = seg {
            // Safety: segment headers stay valid while the pool owns them.
            unsafe {
                if current.spans(addr) {
                    if check_used {
                        let first_user =
                            current.base().as_ptr() as usize + FIRST_CHUNK_OFFSET + CHUNK_OVERHEAD;
                        // Only aligned addresses past the first payload can
                        // be user pointers with a header behind them.
                        if addr < first_user || addr & ALIGN_MASK != 0 {
                            return false;
                        }
                        let chunk = Chunk::from_user(NonNull::new_unchecked(ptr.cast_mut()));
                        return chunk.is_used();
                    }
                    return true;
                }
                seg = current.next();
            }
        }
        false
    }

    /// Allocated size behind `ptr`: the exact request when it was recorded,
    /// the chunk capacity otherwise. Zero for null or freed pointers.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer obtained from this pool.
    pub unsafe fn user_size(&mut self, ptr: *const u8) -> usize {
        let Some(user) = NonNull::new(ptr.cast_mut()) else {
            return 0;
        };
        let chunk = Chunk::from_user(user);
        if !chunk.is_used() {
            return 0;
        }
        match chunk.user_size() {
            Some(size) => size,
            None => self.fatal(ptr.cast_mut(), ErrorKind::Padding),
        }
    }

    /// Return every segment to the source and reset the free structures.
    /// All outstanding pointers become invalid. The high-water footprint
    /// is preserved.
    pub fn release_all(&mut self) {
        let mut seg = self.seg_list.take();
        while let Some(current) = seg {
            // Safety: each segment came from the source; nothing references
            // it once the pool forgets it.
            unsafe {
                let size = current.size();
                seg = current.next();
                self.sink.on_free_segment(current.base().as_ptr(), size);
                let _ = self.source.free_segment(current.base(), size);
            }
        }
        self.small_map = 0;
        self.tree_map = 0;
        self.footprint = 0;
        for ring in &mut self.small_bins {
            *ring = ChunkRing::new();
        }
        for tree in &mut self.large_bins {
            tree.clear();
        }
    }

    pub fn footprint(&self) -> usize {
        self.footprint
    }

    pub fn max_footprint(&self) -> usize {
        self.max_footprint
    }

    pub fn footprint_limit(&self) -> usize {
        self.footprint_limit
    }

    /// Cap the total segment bytes this pool may hold. Zero means
    /// unlimited. Requests that would push the footprint past the limit
    /// fail softly without touching the source.
    pub fn set_footprint_limit(&mut self, limit: usize) {
        self.footprint_limit = limit;
    }

    pub fn is_storing_exact_size(&self) -> bool {
        self.storing_exact_size
    }

    /// Toggle exact-size recording for future allocations. Ignored in
    /// padding mode, which depends on the recorded size.
    pub fn set_storing_exact_size(&mut self, value: bool) {
        if !self.padding {
            self.storing_exact_size = value;
        }
    }

    pub fn is_padding(&self) -> bool {
        self.padding
    }

    pub fn padding_byte(&self) -> u8 {
        self.padding_byte
    }

    pub fn set_padding_byte(&mut self, byte: u8) {
        self.padding_byte = byte;
    }

    #[inline]
    fn min_alloc_size(&self, user_size: usize) -> usize {
        // Padding mode reserves at least one canary byte.
        if self.padding {
            user_size.saturating_add(1)
        } else {
            user_size
        }
    }

    /// Pop the head chunk of a small bin, keeping the bitmap in sync.
    ///
    /// # Safety
    /// The bin's bit must be set in `small_map`.
    unsafe fn pop_small(&mut self, bin: usize) -> Chunk {
        let chunk = self.small_bins[bin]
            .pop()
            .unwrap_or_else(|| panic!("assertion failure: small bin {bin} empty but mapped"));
        if self.small_bins[bin].is_empty() {
            self.small_map &= !(1u32 << bin);
        }
        chunk
    }

    /// File a free chunk under its size class.
    ///
    /// # Safety
    /// `chunk` must be a free chunk owned by this pool, in no bin.
    unsafe fn push_free(&mut self, chunk: Chunk) {
        let size = chunk.chunk_size();
        if is_small(size) {
            let bin = small_bin_index(size);
            self.small_bins[bin].push(chunk);
            self.small_map |= 1u32 << bin;
        } else {
            let bin = large_bin_index(size);
            self.large_bins[bin].add(NonNull::new_unchecked(chunk.base()), size);
            self.tree_map |= 1u32 << bin;
        }
    }

    /// Walk the non-empty large bins at or above the target class and take
    /// the first best-fit hit.
    ///
    /// # Safety
    /// Tree nodes must all be valid free chunks.
    unsafe fn tree_alloc(&mut self, chunk_size: usize) -> Option<Chunk> {
        let mut bin = large_bin_index(chunk_size);
        let mut bits = self.tree_map >> bin;
        while bits != 0 {
            let skip = bits.trailing_zeros() as usize;
            bin += skip;
            if let Some((ptr, _)) = self.large_bins[bin].remove_best_fit(chunk_size) {
                if self.large_bins[bin].is_empty() {
                    self.tree_map &= !(1u32 << bin);
                }
                return Some(self.split(Chunk::from_base(ptr), chunk_size));
            }
            bits >>= skip;
            bits >>= 1;
            bin += 1;
        }
        None
    }

    /// Keep the leading `size` bytes of a free chunk for the caller and
    /// file the trailing excess as its own free chunk, unless the excess
    /// is below the minimum chunk size.
    ///
    /// # Safety
    /// `chunk` must be owned by the caller (in no bin) and at least `size`
    /// bytes.
    unsafe fn split(&mut self, chunk: Chunk, size: usize) -> Chunk {
        let remainder = chunk.chunk_size() - size;
        if remainder >= MIN_CHUNK_SIZE {
            chunk.set_free_size(size);
            let rest = chunk.offset(size);
            rest.set_free_size(remainder);
            self.push_free(rest);
        }
        chunk
    }

    /// Grow the pool by one segment sized for `chunk_size` and carve the
    /// requested chunk out of it.
    ///
    /// # Safety
    /// Internal structures must be consistent.
    unsafe fn segment_alloc(&mut self, chunk_size: usize) -> Option<Chunk> {
        let est_size = chunk_size.checked_add(SEGMENT_OVERHEAD)?;

        if self.footprint_limit != 0 {
            let projected = self.footprint.checked_add(est_size)?;
            if projected > self.footprint_limit {
                return None;
            }
        }

        let Some((base, seg_size)) = self.source.get_segment(est_size) else {
            self.sink.on_get_segment(ptr::null_mut(), est_size);
            return None;
        };
        debug_assert!(seg_size >= est_size, "source shrank the segment request");
        debug_assert!(
            base.as_ptr() as usize & ALIGN_MASK == 0 && seg_size & ALIGN_MASK == 0,
            "source returned an unaligned segment"
        );
        self.sink.on_get_segment(base.as_ptr(), seg_size);

        self.footprint += seg_size;
        if self.footprint > self.max_footprint {
            self.max_footprint = self.footprint;
        }

        let (seg, chunk) = Segment::init(base, seg_size);
        seg.set_next(self.seg_list);
        self.seg_list = Some(seg);

        Some(self.split(chunk, chunk_size))
    }

    /// Stamp a carved chunk used and lay down the padding canaries.
    ///
    /// # Safety
    /// `chunk` must be owned by the caller and large enough for
    /// `user_size`.
    unsafe fn stamp_used(&mut self, chunk: Chunk, user_size: usize) {
        chunk.mark_used(self.storing_exact_size, user_size);
        if self.padding {
            let chunk_size = chunk.chunk_size();
            let canaries = (chunk_size - CHUNK_OVERHEAD - user_size - 1).min(MAX_PADDING_CHECK);
            let pad = chunk.base().add(CHUNK_OVERHEAD + user_size);
            for i in 0..canaries {
                *pad.add(i) = self.padding_byte;
            }
        }
    }

    /// # Safety
    /// Same contract as [`Pool::stamp_used`].
    unsafe fn finish_alloc(&mut self, chunk: Chunk, user_size: usize) -> NonNull<u8> {
        self.stamp_used(chunk, user_size);
        let user = chunk.user_ptr();
        self.sink.on_alloc(user.as_ptr(), user_size);
        user
    }

    /// Report corruption through the sink, then unwind. The pool must not
    /// be used after this.
    #[cold]
    fn fatal(&mut self, ptr: *mut u8, kind: ErrorKind) -> ! {
        self.sink.on_error(ptr, kind);
        panic!("memory corruption detected: {kind}");
    }
}

impl<S: SegmentSource, L: EventSink> Drop for Pool<S, L> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::source::{FixedSource, HeapSource};

    fn heap_pool() -> Pool<HeapSource> {
        Pool::new(HeapSource::new(4096))
    }

    /// Sink that tallies every hook invocation.
    #[derive(Default)]
    struct CountingSink {
        allocs: usize,
        failed_allocs: usize,
        deallocs: usize,
        shrinks: usize,
        segments_in: usize,
        segments_out: usize,
        errors: Vec<ErrorKind>,
    }

    impl EventSink for CountingSink {
        fn on_get_segment(&mut self, segment: *mut u8, _size: usize) {
            if !segment.is_null() {
                self.segments_in += 1;
            }
        }

        fn on_free_segment(&mut self, _segment: *mut u8, _size: usize) {
            self.segments_out += 1;
        }

        fn on_alloc(&mut self, ptr: *mut u8, _user_size: usize) {
            if ptr.is_null() {
                self.failed_allocs += 1;
            } else {
                self.allocs += 1;
            }
        }

        fn on_shrink(&mut self, _ptr: *mut u8, _old: usize, _new: usize) {
            self.shrinks += 1;
        }

        fn on_dealloc(&mut self, _ptr: *mut u8, _user_size: usize) {
            self.deallocs += 1;
        }

        fn on_error(&mut self, _ptr: *mut u8, kind: ErrorKind) {
            self.errors.push(kind);
        }
    }

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let mut pool = heap_pool();
        let sizes = [1usize, 10, 16, 100, 255, 256, 1000, 5000, 40000];
        let mut live: Vec<(usize, usize)> = Vec::new();
        for &size in &sizes {
            let ptr = pool.allocate(size).unwrap();
            assert_eq!(ptr.as_ptr() as usize % 16, 0);
            assert!(pool.contains(ptr.as_ptr(), true));
            // Safety: region is writable for `size` bytes.
            unsafe { ptr::write_bytes(ptr.as_ptr(), 0xEE, size) };
            live.push((ptr.as_ptr() as usize, size));
        }
        for (i, &(a, alen)) in live.iter().enumerate() {
            for &(b, blen) in &live[i + 1..] {
                assert!(a + alen <= b || b + blen <= a, "allocations overlap");
            }
        }
    }

    #[test]
    fn test_allocate_zero_is_valid() {
        let mut pool = heap_pool();
        let ptr = pool.allocate(0).unwrap();
        // Safety: ptr came from this pool.
        unsafe {
            assert_eq!(pool.user_size(ptr.as_ptr()), MIN_REQUEST);
            pool.deallocate(ptr.as_ptr());
        }
    }

    #[test]
    fn test_oversized_request_fails_soft() {
        let mut pool = heap_pool();
        assert!(pool.allocate(usize::MAX).is_none());
        assert!(pool.allocate(MAX_REQUEST).is_none());
        assert_eq!(pool.footprint(), 0);
    }

    #[test]
    fn test_small_bin_exact_reuse() {
        let mut pool = heap_pool();
        let first = pool.allocate(24).unwrap();
        // Safety: pointers come from this pool.
        unsafe {
            pool.deallocate(first.as_ptr());
            let second = pool.allocate(24).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_small_bin_tight_fit_taken_whole() {
        let mut pool = heap_pool();
        let parked = pool.allocate(48).unwrap(); // 64-byte chunk, bin 8
        // Safety: pointers come from this pool.
        unsafe {
            pool.deallocate(parked.as_ptr());
            // A 48-byte chunk request scans up to bin 8; the 16-byte excess
            // is below the minimum chunk size, so the chunk stays whole.
            let ptr = pool.allocate(32).unwrap();
            assert_eq!(ptr, parked);
            assert_eq!(pool.user_size(ptr.as_ptr()), 64 - CHUNK_OVERHEAD);
        }
    }

    #[test]
    fn test_small_bin_distant_class_splits() {
        let mut pool = heap_pool();
        let parked = pool.allocate(80).unwrap(); // 96-byte chunk, bin 12
        // Safety: pointers come from this pool.
        unsafe {
            pool.deallocate(parked.as_ptr());
            // A 32-byte chunk request scans up to bin 12 and splits it.
            let ptr = pool.allocate(16).unwrap();
            assert_eq!(ptr, parked);
            assert_eq!(pool.user_size(ptr.as_ptr()), MIN_REQUEST);
            // The 64-byte remainder sits right behind and is reused next.
            let rest = pool.allocate(48).unwrap();
            assert_eq!(rest.as_ptr() as usize, ptr.as_ptr() as usize + MIN_CHUNK_SIZE);
        }
    }

    #[test]
    fn test_large_chunk_reuse_through_tree() {
        let mut pool = heap_pool();
        let first = pool.allocate(1000).unwrap();
        // Safety: pointers come from this pool.
        unsafe {
            pool.deallocate(first.as_ptr());
            let second = pool.allocate(500).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_user_size_modes() {
        let mut pool = heap_pool();
        assert!(!pool.is_storing_exact_size());
        let p1 = pool.allocate(10).unwrap();
        // Safety: pointers come from this pool.
        unsafe {
            assert_eq!(pool.user_size(p1.as_ptr()), 16);

            pool.set_storing_exact_size(true);
            let p2 = pool.allocate(10).unwrap();
            assert_eq!(pool.user_size(p2.as_ptr()), 10);
            // Chunks stamped before the switch keep reporting capacity.
            assert_eq!(pool.user_size(p1.as_ptr()), 16);

            assert!(pool.contains(p1.as_ptr(), true));
            pool.deallocate(p1.as_ptr());
            assert!(!pool.contains(p1.as_ptr(), true));
            assert!(pool.contains(p1.as_ptr(), false));
            assert_eq!(pool.user_size(p1.as_ptr()), 0);
        }
        // Safety: null is always accepted.
        unsafe {
            assert_eq!(pool.user_size(ptr::null()), 0);
        }
    }

    #[test]
    fn test_contains_rejects_foreign_pointers() {
        let mut pool = heap_pool();
        let ptr = pool.allocate(100).unwrap();
        assert!(pool.contains(ptr.as_ptr(), false));
        let stack_local = 0u8;
        assert!(!pool.contains(&stack_local, false));
        // Safety: ptr came from this pool.
        unsafe { pool.deallocate(ptr.as_ptr()) };
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut pool = heap_pool();
        let ptr = pool.allocate(1000).unwrap();
        // Safety: first free is legitimate; the second is the point.
        unsafe {
            pool.deallocate(ptr.as_ptr());
            pool.deallocate(ptr.as_ptr());
        }
    }

    #[test]
    fn test_padding_clean_roundtrip() {
        let mut pool = Pool::with_padding(HeapSource::new(4096));
        assert!(pool.is_padding());
        assert!(pool.is_storing_exact_size());
        for size in [1usize, 7, 10, 15, 16, 100, 300] {
            let ptr = pool.allocate(size).unwrap();
            // Safety: writing exactly the requested bytes.
            unsafe {
                ptr::write_bytes(ptr.as_ptr(), 0xFF, size);
                assert_eq!(pool.user_size(ptr.as_ptr()), size);
                pool.deallocate(ptr.as_ptr());
            }
        }
    }

    #[test]
    #[should_panic(expected = "padding bytes overwritten")]
    fn test_padding_detects_overrun() {
        let mut pool = Pool::with_padding(HeapSource::new(4096));
        let ptr = pool.allocate(10).unwrap();
        // Safety: the overrun stays inside the chunk's canary region.
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0xFF, 11);
            pool.deallocate(ptr.as_ptr());
        }
    }

    #[test]
    fn test_padding_pins_exact_size_mode() {
        let mut pool = Pool::with_padding(HeapSource::new(4096));
        pool.set_storing_exact_size(false);
        assert!(pool.is_storing_exact_size());
    }

    #[test]
    fn test_padding_byte_is_configurable() {
        let mut pool = Pool::with_padding(HeapSource::new(4096));
        assert_eq!(pool.padding_byte(), DEFAULT_PADDING_BYTE);
        pool.set_padding_byte(0x7E);
        let ptr = pool.allocate(10).unwrap();
        // Safety: reading the stamped canary just past the request.
        unsafe {
            assert_eq!(*ptr.as_ptr().add(10), 0x7E);
            pool.deallocate(ptr.as_ptr());
        }
    }

    #[test]
    fn test_callocate_zeroes() {
        let mut pool = heap_pool();
        let ptr = pool.callocate(16, 25).unwrap();
        // Safety: region is 400 writable bytes.
        unsafe {
            for i in 0..400 {
                assert_eq!(*ptr.as_ptr().add(i), 0);
            }
            pool.deallocate(ptr.as_ptr());
        }
    }

    #[test]
    fn test_callocate_overflow_fails_soft() {
        let mut pool = heap_pool();
        assert!(pool.callocate(usize::MAX, 2).is_none());
        assert_eq!(pool.footprint(), 0);
    }

    #[test]
    fn test_reallocate_null_allocates() {
        let mut pool = heap_pool();
        // Safety: null is explicitly allowed.
        let ptr = unsafe { pool.reallocate(ptr::null_mut(), 100) }.unwrap();
        assert!(pool.contains(ptr.as_ptr(), true));
    }

    #[test]
    fn test_reallocate_shrinks_in_place() {
        let mut pool = heap_pool();
        let ptr = pool.allocate(1000).unwrap();
        // Safety: pointers come from this pool.
        unsafe {
            for i in 0..100u8 {
                *ptr.as_ptr().add(i as usize) = i;
            }
            let shrunk = pool.reallocate(ptr.as_ptr(), 100).unwrap();
            assert_eq!(shrunk, ptr);
            for i in 0..100u8 {
                assert_eq!(*shrunk.as_ptr().add(i as usize), i);
            }
            // The split-off tail is immediately reusable.
            let tail = pool.allocate(500).unwrap();
            assert!(pool.contains(tail.as_ptr(), true));
        }
    }

    #[test]
    fn test_reallocate_grow_copies_data() {
        let mut pool = heap_pool();
        let ptr = pool.allocate(64).unwrap();
        // Safety: pointers come from this pool.
        unsafe {
            for i in 0..64u8 {
                *ptr.as_ptr().add(i as usize) = i;
            }
            let grown = pool.reallocate(ptr.as_ptr(), 4096).unwrap();
            for i in 0..64u8 {
                assert_eq!(*grown.as_ptr().add(i as usize), i);
            }
            // The old chunk went back to a bin.
            assert!(!pool.contains(ptr.as_ptr(), true));
            pool.deallocate(grown.as_ptr());
        }
    }

    #[test]
    fn test_reallocate_failure_keeps_old_pointer() {
        let mut buffer = vec![0u8; 2048];
        // Safety: buffer outlives the pool.
        let source =
            unsafe { FixedSource::new(NonNull::new(buffer.as_mut_ptr()).unwrap(), buffer.len()) };
        let mut pool = Pool::new(source);
        let ptr = pool.allocate(500).unwrap();
        // Safety: pointers come from this pool.
        unsafe {
            *ptr.as_ptr() = 42;
            assert!(pool.reallocate(ptr.as_ptr(), 100_000).is_none());
            assert!(pool.contains(ptr.as_ptr(), true));
            assert_eq!(*ptr.as_ptr(), 42);
        }
        drop(pool);
    }

    #[test]
    fn test_reallocate_shrink_updates_exact_size() {
        let mut pool = heap_pool();
        pool.set_storing_exact_size(true);
        let ptr = pool.allocate(10).unwrap();
        // Safety: pointers come from this pool.
        unsafe {
            assert_eq!(pool.user_size(ptr.as_ptr()), 10);
            // Same chunk, smaller request: stays in place, new size reported.
            let shrunk = pool.reallocate(ptr.as_ptr(), 4).unwrap();
            assert_eq!(shrunk, ptr);
            assert_eq!(pool.user_size(ptr.as_ptr()), 4);
        }
    }

    #[test]
    fn test_footprint_limit_blocks_growth() {
        let mut pool = Pool::new(HeapSource::new(4096));
        pool.set_footprint_limit(1_000_000);
        assert_eq!(pool.footprint_limit(), 1_000_000);
        let first = pool.allocate(800_000).unwrap();
        assert!(pool.footprint() >= 800_000);
        assert!(pool.allocate(800_000).is_none());
        // The failed attempt must not have grown the pool.
        assert!(pool.footprint() <= 1_000_000);
        // Safety: ptr came from this pool.
        unsafe { pool.deallocate(first.as_ptr()) };
    }

    #[test]
    fn test_footprint_tracks_segments() {
        let mut pool = heap_pool();
        assert_eq!(pool.footprint(), 0);
        let a = pool.allocate(100).unwrap();
        let after_one = pool.footprint();
        assert!(after_one >= 4096);
        let _b = pool.allocate(100_000).unwrap();
        let after_two = pool.footprint();
        assert!(after_two > after_one);
        assert_eq!(pool.max_footprint(), after_two);
        // Safety: ptr came from this pool.
        unsafe { pool.deallocate(a.as_ptr()) };
        // Deallocation never shrinks the footprint.
        assert_eq!(pool.footprint(), after_two);
    }

    #[test]
    fn test_odd_source_minimum_still_serves_aligned_chunks() {
        // A source configured with a minimum that is not a multiple of 16
        // must not leak unaligned segments into the pool.
        let mut pool = Pool::new(HeapSource::new(65_537));
        let ptr = pool.allocate(10).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        assert_eq!(pool.footprint() % 16, 0);
        // Safety: ptr came from this pool.
        unsafe {
            assert_eq!(pool.user_size(ptr.as_ptr()), 16);
            pool.deallocate(ptr.as_ptr());
        }
    }

    #[test]
    fn test_release_all_resets_but_keeps_high_water() {
        let mut pool = heap_pool();
        let ptr = pool.allocate(10_000).unwrap();
        let peak = pool.footprint();
        pool.release_all();
        assert_eq!(pool.footprint(), 0);
        assert_eq!(pool.max_footprint(), peak);
        assert!(!pool.contains(ptr.as_ptr(), false));
        // The pool is immediately usable again.
        let again = pool.allocate(10_000).unwrap();
        assert!(pool.contains(again.as_ptr(), true));
    }

    #[test]
    fn test_sink_sees_lifecycle_events() {
        let mut pool: Pool<HeapSource, CountingSink> =
            Pool::with_sink(HeapSource::new(4096), CountingSink::default(), false);
        let a = pool.allocate(100).unwrap();
        let b = pool.allocate(200).unwrap();
        // Safety: pointers come from this pool.
        unsafe {
            let _ = pool.reallocate(b.as_ptr(), 50).unwrap();
            pool.deallocate(a.as_ptr());
            pool.deallocate(ptr::null_mut());
        }
        assert!(pool.allocate(usize::MAX).is_none());
        pool.release_all();

        let sink = &pool.sink;
        assert_eq!(sink.allocs, 2);
        assert_eq!(sink.failed_allocs, 1);
        assert_eq!(sink.shrinks, 1);
        assert_eq!(sink.deallocs, 2); // one real, one null
        assert_eq!(sink.segments_in, 1);
        assert_eq!(sink.segments_out, 1);
        assert!(sink.errors.is_empty());
    }

    #[test]
    fn test_churn_reuses_memory() {
        let mut pool = heap_pool();
        let mut ptrs = Vec::new();
        let mut size = 8;
        for _ in 0..2000 {
            size = if size > 4000 { 8 } else { size + 8 };
            ptrs.push(pool.allocate(size).unwrap());
        }
        // Safety: all pointers come from this pool.
        unsafe {
            for &ptr in &ptrs {
                pool.deallocate(ptr.as_ptr());
            }
        }
        ptrs.clear();
        let mut size = 8;
        for _ in 0..2000 {
            size = if size > 4000 { 8 } else { size + 8 };
            let ptr = pool.allocate(size).unwrap();
            assert!(pool.contains(ptr.as_ptr(), true));
            ptrs.push(ptr);
        }
        // Safety: all pointers come from this pool.
        unsafe {
            for &ptr in &ptrs {
                pool.deallocate(ptr.as_ptr());
            }
        }
    }

    #[test]
    fn test_bin_index_classification() {
        assert!(is_small(MIN_CHUNK_SIZE));
        assert!(is_small(MIN_LARGE_SIZE - 8));
        assert!(!is_small(MIN_LARGE_SIZE));
        assert_eq!(small_bin_index(32), 4);
        assert_eq!(small_bin_index(248), 31);
        // Two large bins per power of two.
        assert_eq!(large_bin_index(256), 0);
        assert_eq!(large_bin_index(384), 1);
        assert_eq!(large_bin_index(512), 2);
        assert_eq!(large_bin_index(768), 3);
        assert_eq!(large_bin_index(1024), 4);
        // Everything past the top class shares the overflow bin.
        assert_eq!(large_bin_index(usize::MAX >> 8), NTREEBINS - 1);
    }

    #[test]
    fn test_chunk_size_for_requests() {
        assert_eq!(chunk_size_for(1), 32);
        assert_eq!(chunk_size_for(16), 32);
        assert_eq!(chunk_size_for(17), 48);
        assert_eq!(chunk_size_for(30), 48);
        assert_eq!(chunk_size_for(1000), 1024);
    }
}
