use std::mem::{offset_of, size_of};
use std::ptr::NonNull;

/// All chunk sizes and user pointers are 16-byte aligned, which leaves the
/// low 4 bits of every size word free for flags.
pub(crate) const ALIGNMENT: usize = 2 * size_of::<usize>();
pub(crate) const ALIGN_MASK: usize = ALIGNMENT - 1;

/// Bytes consumed by the in-band chunk header (two machine words).
pub(crate) const CHUNK_OVERHEAD: usize = size_of::<ChunkHeader>();

/// Smallest chunk the pool ever carves: header plus the two link words a
/// free small chunk threads through its payload, rounded up to alignment.
pub(crate) const MIN_CHUNK_SIZE: usize =
    (CHUNK_OVERHEAD + 2 * size_of::<usize>() + ALIGN_MASK) & !ALIGN_MASK;

pub(crate) const BIT_USED: usize = 1;
pub(crate) const BIT_NOT_EXACT: usize = 2;
const SIZE_MASK: usize = !ALIGN_MASK;

/// In-band header preceding every chunk.
///
/// ```text
///   [word 0] prev_foot — size/flags of the physically preceding chunk,
///            written by that chunk (boundary tag)
///   [word 1] head      — this chunk's size, OR'd with BIT_USED and
///            BIT_NOT_EXACT in the low bits
/// ```
///
/// For a used chunk in exact-size mode whose request did not exactly fill
/// the chunk, BIT_NOT_EXACT is set and the last byte of the chunk holds the
/// (positive) difference between the chunk capacity and the user size.
#[repr(C)]
pub(crate) struct ChunkHeader {
    prev_foot: usize,
    head: usize,
}

/// A raw handle to an in-band chunk header. Copyable; equality is pointer
/// identity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Chunk(NonNull<ChunkHeader>);

impl Chunk {
    #[inline]
    pub(crate) fn from_base(base: NonNull<u8>) -> Self {
        Chunk(base.cast())
    }

    /// Recover the chunk handle from a user pointer.
    ///
    /// # Safety
    /// `user` must point `CHUNK_OVERHEAD` bytes past a live chunk header
    /// owned by the pool.
    #[inline]
    pub(crate) unsafe fn from_user(user: NonNull<u8>) -> Self {
        Chunk(NonNull::new_unchecked(
            user.as_ptr().sub(CHUNK_OVERHEAD).cast(),
        ))
    }

    #[inline]
    pub(crate) fn base(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    /// Start of the user payload.
    ///
    /// # Safety
    /// The chunk must be in-bounds of its owning segment.
    #[inline]
    pub(crate) unsafe fn user_ptr(self) -> NonNull<u8> {
        NonNull::new_unchecked(self.base().add(CHUNK_OVERHEAD))
    }

    /// The chunk at `bytes` past this one.
    ///
    /// # Safety
    /// The target address must lie within the same segment.
    #[inline]
    pub(crate) unsafe fn offset(self, bytes: usize) -> Chunk {
        Chunk(NonNull::new_unchecked(self.base().add(bytes).cast()))
    }

    /// # Safety
    /// The header must be readable.
    #[inline]
    pub(crate) unsafe fn chunk_size(self) -> usize {
        (*self.0.as_ptr()).head & SIZE_MASK
    }

    /// # Safety
    /// The header must be readable.
    #[inline]
    pub(crate) unsafe fn is_used(self) -> bool {
        (*self.0.as_ptr()).head & BIT_USED != 0
    }

    /// # Safety
    /// The header must be readable.
    #[inline]
    #[allow(dead_code)]
    pub(crate) unsafe fn prev_foot(self) -> usize {
        (*self.0.as_ptr()).prev_foot
    }

    /// Stamp this chunk free with the given size and mirror the size into
    /// the boundary tag of the physical successor.
    ///
    /// # Safety
    /// `size` bytes starting at the header, plus the successor's first word,
    /// must lie within the owning segment.
    pub(crate) unsafe fn set_free_size(self, size: usize) {
        debug_assert!(size & ALIGN_MASK == 0, "unaligned chunk size {size}");
        (*self.0.as_ptr()).head = size;
        (*self.base().add(size).cast::<ChunkHeader>()).prev_foot = size;
    }

    /// Mark the chunk used. In exact-size mode a non-exact fit also records
    /// the user size by storing a delta byte in the last byte of the chunk.
    ///
    /// # Safety
    /// Same bounds requirement as [`Chunk::set_free_size`]; the chunk size
    /// must already be stamped.
    pub(crate) unsafe fn mark_used(self, storing_exact_size: bool, user_size: usize) {
        let chunk_size = self.chunk_size();
        let header = self.0.as_ptr();
        (*header).head |= BIT_USED;
        if storing_exact_size {
            let used = user_size + CHUNK_OVERHEAD;
            if used != chunk_size {
                (*header).head |= BIT_NOT_EXACT;
                *self.base().add(chunk_size - 1) = (chunk_size - used) as u8;
            }
        }
        (*self.base().add(chunk_size).cast::<ChunkHeader>()).prev_foot = chunk_size | BIT_USED;
    }

    /// Recorded user size: the exact request when the delta byte is present,
    /// the aligned capacity otherwise. `None` means the delta byte has been
    /// corrupted (non-positive).
    ///
    /// # Safety
    /// The header (and the last byte of the chunk, when BIT_NOT_EXACT is
    /// set) must be readable.
    pub(crate) unsafe fn user_size(self) -> Option<usize> {
        let chunk_size = self.chunk_size();
        if (*self.0.as_ptr()).head & BIT_NOT_EXACT != 0 {
            let delta = *self.base().add(chunk_size - 1) as i8;
            if delta <= 0 || delta as usize + CHUNK_OVERHEAD > chunk_size {
                return None;
            }
            Some(chunk_size - CHUNK_OVERHEAD - delta as usize)
        } else {
            Some(chunk_size - CHUNK_OVERHEAD)
        }
    }

    #[inline]
    unsafe fn link_slot(self, index: usize) -> *mut *mut ChunkHeader {
        self.base()
            .add(CHUNK_OVERHEAD)
            .cast::<*mut ChunkHeader>()
            .add(index)
    }

    /// # Safety
    /// Only valid on a free small chunk whose links have been set.
    #[inline]
    pub(crate) unsafe fn next_free(self) -> Chunk {
        Chunk(NonNull::new_unchecked(*self.link_slot(0)))
    }

    /// # Safety
    /// Only valid on a free small chunk whose links have been set.
    #[inline]
    pub(crate) unsafe fn prev_free(self) -> Chunk {
        Chunk(NonNull::new_unchecked(*self.link_slot(1)))
    }

    /// # Safety
    /// The chunk payload must be at least two words.
    #[inline]
    pub(crate) unsafe fn set_next_free(self, next: Chunk) {
        *self.link_slot(0) = next.0.as_ptr();
    }

    /// # Safety
    /// The chunk payload must be at least two words.
    #[inline]
    pub(crate) unsafe fn set_prev_free(self, prev: Chunk) {
        *self.link_slot(1) = prev.0.as_ptr();
    }
}

/// Header at the start of every segment obtained from a source.
///
/// The sentinel doubles as the first chunk's `prev_foot`: it reads as a
/// used chunk of size zero, so nothing ever walks past the segment start.
#[repr(C)]
struct SegmentHeader {
    size: usize,
    next: *mut SegmentHeader,
    sentinel: usize,
}

/// Offset of the first chunk inside a segment (the chunk header overlays
/// the sentinel word).
pub(crate) const FIRST_CHUNK_OFFSET: usize = offset_of!(SegmentHeader, sentinel);

/// Bytes of a segment that never become chunk payload: the header words up
/// to the sentinel plus the trailing word reserved for the last chunk's
/// boundary tag.
pub(crate) const SEGMENT_OVERHEAD: usize = FIRST_CHUNK_OFFSET + size_of::<usize>();

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Segment(NonNull<SegmentHeader>);

impl Segment {
    /// Write the segment header into a fresh region and carve the initial
    /// free chunk covering everything but the overhead. The carve rounds
    /// down to alignment; a 16-aligned segment loses 8 slack bytes because
    /// the overhead is not itself a multiple of 16.
    ///
    /// # Safety
    /// `base` must point to `size` writable bytes, 16-byte aligned, with
    /// `size` a multiple of 16 and at least `SEGMENT_OVERHEAD +
    /// MIN_CHUNK_SIZE` rounded up to alignment.
    pub(crate) unsafe fn init(base: NonNull<u8>, size: usize) -> (Segment, Chunk) {
        let header = base.cast::<SegmentHeader>().as_ptr();
        (*header).size = size;
        (*header).sentinel = BIT_USED;
        // next is assigned by the pool when it links the segment in.

        let first = Chunk::from_base(NonNull::new_unchecked(
            base.as_ptr().add(FIRST_CHUNK_OFFSET),
        ));
        first.set_free_size((size - SEGMENT_OVERHEAD) & !ALIGN_MASK);
        (Segment(base.cast()), first)
    }

    #[inline]
    pub(crate) fn base(self) -> NonNull<u8> {
        self.0.cast()
    }

    /// # Safety
    /// The header must be readable.
    #[inline]
    pub(crate) unsafe fn size(self) -> usize {
        (*self.0.as_ptr()).size
    }

    /// # Safety
    /// The header must be readable.
    #[inline]
    pub(crate) unsafe fn next(self) -> Option<Segment> {
        NonNull::new((*self.0.as_ptr()).next).map(Segment)
    }

    /// # Safety
    /// The header must be writable.
    #[inline]
    pub(crate) unsafe fn set_next(self, next: Option<Segment>) {
        (*self.0.as_ptr()).next = match next {
            Some(seg) => seg.0.as_ptr(),
            None => std::ptr::null_mut(),
        };
    }

    /// Whether `addr` falls within this segment's address range.
    ///
    /// # Safety
    /// The header must be readable.
    #[inline]
    pub(crate) unsafe fn spans(self, addr: usize) -> bool {
        let base = self.base().as_ptr() as usize;
        addr >= base && addr <= base + self.size()
    }
}
