//! Segregated-fit memory pool with pluggable segment sources.
//!
//! A [`Pool`] carves user allocations out of large segments obtained from a
//! [`SegmentSource`]. Small free chunks are kept in exact-size lists, large
//! ones in size-keyed trees whose nodes live inside the free memory itself,
//! so the allocator needs no heap of its own. Sources are composable: a
//! fixed buffer, the process heap, anonymous pages, or a
//! [`CachedSource`] that recycles whole segments between pools.
//!
//! ```
//! use segpool::{HeapSource, Pool};
//!
//! let mut pool = Pool::new(HeapSource::default());
//! let ptr = pool.allocate(100).expect("out of memory");
//! // Safety: ptr was just returned by this pool.
//! unsafe {
//!     ptr.as_ptr().write_bytes(0, 100);
//!     pool.deallocate(ptr.as_ptr());
//! }
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("segpool supports only 64-bit targets.");

// public module: implementation details stay pub(crate)
pub mod memory;

// allocator core
pub use memory::pool::Pool;

// segment sources
#[cfg(unix)]
pub use memory::source::MmapSource;
pub use memory::source::{
    CachedSource, FixedSource, HeapSource, SegmentSource, SourceError, DEFAULT_MIN_SEGMENT_SIZE,
};

// event hooks
pub use memory::log::{ErrorKind, EventSink, NoopSink, TraceSink};
