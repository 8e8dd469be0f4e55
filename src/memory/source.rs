use std::alloc::Layout;
use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use super::avl::{PtrAvlTree, MIN_NODE_BYTES};
use super::chunk::{ALIGNMENT, ALIGN_MASK};

/// Sources round small requests up to this segment size unless configured
/// otherwise.
pub const DEFAULT_MIN_SEGMENT_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub enum SourceError {
    /// The pointer/size pair does not match a segment handed out by this
    /// source.
    ForeignSegment,
    /// The operating system refused to release the segment.
    ReleaseFailed(std::io::Error),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::ForeignSegment => {
                write!(f, "segment was not obtained from this source")
            }
            SourceError::ReleaseFailed(e) => write!(f, "segment release failed: {e}"),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SourceError::ForeignSegment => None,
            SourceError::ReleaseFailed(e) => Some(e),
        }
    }
}

/// Supplier of the contiguous regions a pool carves its chunks from.
pub trait SegmentSource {
    /// Obtain a writable, 16-byte aligned region of at least `min_size`
    /// bytes. Returns the region and its actual size, which must itself be
    /// a multiple of 16; the source may enlarge the request. `None` when
    /// the request cannot be satisfied.
    fn get_segment(&mut self, min_size: usize) -> Option<(NonNull<u8>, usize)>;

    /// Give back a segment.
    ///
    /// # Safety
    /// `(ptr, size)` must be exactly as returned by a prior
    /// [`get_segment`](SegmentSource::get_segment) on this source, with no
    /// live references into the region.
    unsafe fn free_segment(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), SourceError>;
}

impl<S: SegmentSource + ?Sized> SegmentSource for &mut S {
    fn get_segment(&mut self, min_size: usize) -> Option<(NonNull<u8>, usize)> {
        (**self).get_segment(min_size)
    }

    unsafe fn free_segment(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), SourceError> {
        (**self).free_segment(ptr, size)
    }
}

/// Shared handle for sources used by more than one pool (e.g. a parent and
/// a short-lived child sharing one cache). Single-threaded by construction.
impl<S: SegmentSource> SegmentSource for Rc<RefCell<S>> {
    fn get_segment(&mut self, min_size: usize) -> Option<(NonNull<u8>, usize)> {
        self.borrow_mut().get_segment(min_size)
    }

    unsafe fn free_segment(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), SourceError> {
        self.borrow_mut().free_segment(ptr, size)
    }
}

/// Single-shot source over a caller-provided buffer. The whole buffer is
/// handed out on the first request and can be handed out again once freed.
pub struct FixedSource {
    base: NonNull<u8>,
    size: usize,
    lent: bool,
}

impl FixedSource {
    /// Wrap a raw buffer. The usable region is trimmed to 16-byte
    /// alignment on both ends.
    ///
    /// # Safety
    /// `ptr` must address `len` writable bytes that outlive this source
    /// and are not touched by anyone else while it exists.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        let addr = ptr.as_ptr() as usize;
        let misalignment = addr & ALIGN_MASK;
        let (addr, len) = if misalignment != 0 {
            let skip = ALIGNMENT - misalignment;
            (addr + skip, len.saturating_sub(skip))
        } else {
            (addr, len)
        };
        FixedSource {
            base: NonNull::new_unchecked(addr as *mut u8),
            size: len & !ALIGN_MASK,
            lent: false,
        }
    }
}

impl SegmentSource for FixedSource {
    fn get_segment(&mut self, min_size: usize) -> Option<(NonNull<u8>, usize)> {
        if self.lent || min_size > self.size {
            return None;
        }
        self.lent = true;
        Some((self.base, self.size))
    }

    unsafe fn free_segment(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), SourceError> {
        if !self.lent || ptr != self.base || size != self.size {
            return Err(SourceError::ForeignSegment);
        }
        self.lent = false;
        Ok(())
    }
}

/// Process-heap source built on `std::alloc`. Portable fallback and the
/// default choice for tests.
pub struct HeapSource {
    min_size: usize,
}

impl HeapSource {
    #[must_use]
    pub fn new(min_size: usize) -> Self {
        HeapSource {
            min_size: (min_size.max(ALIGNMENT) + ALIGN_MASK) & !ALIGN_MASK,
        }
    }
}

impl Default for HeapSource {
    fn default() -> Self {
        HeapSource::new(DEFAULT_MIN_SEGMENT_SIZE)
    }
}

impl SegmentSource for HeapSource {
    fn get_segment(&mut self, min_size: usize) -> Option<(NonNull<u8>, usize)> {
        let size = (min_size.max(self.min_size).checked_add(ALIGN_MASK)?) & !ALIGN_MASK;
        let layout = Layout::from_size_align(size, ALIGNMENT).ok()?;
        // Safety: the layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).map(|p| (p, size))
    }

    unsafe fn free_segment(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), SourceError> {
        let layout =
            Layout::from_size_align(size, ALIGNMENT).map_err(|_| SourceError::ForeignSegment)?;
        // Safety: per the trait contract, (ptr, size) came from get_segment,
        // which used this same layout.
        std::alloc::dealloc(ptr.as_ptr(), layout);
        Ok(())
    }
}

/// Anonymous-page source backed by `mmap`.
#[cfg(unix)]
pub struct MmapSource {
    min_size: usize,
}

#[cfg(unix)]
impl MmapSource {
    #[must_use]
    pub fn new(min_size: usize) -> Self {
        MmapSource {
            min_size: (min_size.max(ALIGNMENT) + ALIGN_MASK) & !ALIGN_MASK,
        }
    }
}

#[cfg(unix)]
impl Default for MmapSource {
    fn default() -> Self {
        MmapSource::new(DEFAULT_MIN_SEGMENT_SIZE)
    }
}

#[cfg(unix)]
impl SegmentSource for MmapSource {
    fn get_segment(&mut self, min_size: usize) -> Option<(NonNull<u8>, usize)> {
        let size = (min_size.max(self.min_size).checked_add(ALIGN_MASK)?) & !ALIGN_MASK;
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr.cast::<u8>()).map(|p| (p, size))
    }

    unsafe fn free_segment(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), SourceError> {
        // Safety: FFI call to munmap.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
            return Err(SourceError::ReleaseFailed(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Interposes a size-indexed cache of freed segments in front of another
/// source. Freed segments are never returned to the inner source until the
/// wrapper is dropped, so a later request of similar size skips the inner
/// source entirely. The index nodes live inside the cached segments
/// themselves.
pub struct CachedSource<S: SegmentSource> {
    inner: S,
    cache: PtrAvlTree,
}

impl<S: SegmentSource> CachedSource<S> {
    pub fn new(inner: S) -> Self {
        CachedSource {
            inner,
            cache: PtrAvlTree::new(),
        }
    }

    #[must_use]
    pub fn is_cache_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl<S: SegmentSource> SegmentSource for CachedSource<S> {
    fn get_segment(&mut self, min_size: usize) -> Option<(NonNull<u8>, usize)> {
        // Safety: cached segments stay untouched until handed out again.
        if let Some(found) = unsafe { self.cache.remove_best_fit(min_size) } {
            return Some(found);
        }
        self.inner.get_segment(min_size)
    }

    unsafe fn free_segment(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), SourceError> {
        debug_assert!(size >= MIN_NODE_BYTES, "segment too small to index");
        self.cache.add(ptr, size);
        Ok(())
    }
}

impl<S: SegmentSource> Drop for CachedSource<S> {
    fn drop(&mut self) {
        // Drain the cache through the inner source; nothing else will.
        // Safety: every cached entry was a segment of the inner source.
        unsafe {
            while let Some((ptr, size)) = self.cache.remove_best_fit(0) {
                let _ = self.inner.free_segment(ptr, size);
            }
        }
    }
}
