use std::fmt;

/// Corruption classes surfaced through [`EventSink::on_error`] right before
/// the pool raises the corresponding panic.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    /// `deallocate` was handed a chunk that is not marked in use.
    DoubleFree,
    /// A padding canary byte (or the stored size delta) was overwritten.
    Padding,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::DoubleFree => write!(f, "double free"),
            ErrorKind::Padding => write!(f, "padding bytes overwritten"),
        }
    }
}

/// Observer for pool activity. Every hook is synchronous and called from
/// within the pool entry points; none of them may allocate from the pool
/// they observe.
///
/// `on_error` fires before the pool panics, giving the embedding program a
/// chance to record context. Returning normally from it does not suppress
/// the panic.
pub trait EventSink {
    fn on_get_segment(&mut self, segment: *mut u8, size: usize) {
        let _ = (segment, size);
    }

    fn on_free_segment(&mut self, segment: *mut u8, size: usize) {
        let _ = (segment, size);
    }

    fn on_alloc(&mut self, ptr: *mut u8, user_size: usize) {
        let _ = (ptr, user_size);
    }

    /// Only called for in-place shrinking reallocations.
    fn on_shrink(&mut self, ptr: *mut u8, old_user_size: usize, new_user_size: usize) {
        let _ = (ptr, old_user_size, new_user_size);
    }

    fn on_dealloc(&mut self, ptr: *mut u8, user_size: usize) {
        let _ = (ptr, user_size);
    }

    fn on_error(&mut self, ptr: *mut u8, kind: ErrorKind) {
        let _ = (ptr, kind);
    }
}

/// The default sink: ignores everything.
#[derive(Default)]
pub struct NoopSink;

impl EventSink for NoopSink {}

/// Forwards pool activity to the `log` facade; allocation traffic at
/// `trace!`, corruption at `error!`.
#[derive(Default)]
pub struct TraceSink;

impl EventSink for TraceSink {
    fn on_get_segment(&mut self, segment: *mut u8, size: usize) {
        log::trace!("segment acquired: {segment:p} ({size} bytes)");
    }

    fn on_free_segment(&mut self, segment: *mut u8, size: usize) {
        log::trace!("segment released: {segment:p} ({size} bytes)");
    }

    fn on_alloc(&mut self, ptr: *mut u8, user_size: usize) {
        log::trace!("alloc {user_size} -> {ptr:p}");
    }

    fn on_shrink(&mut self, ptr: *mut u8, old_user_size: usize, new_user_size: usize) {
        log::trace!("shrink {ptr:p}: {old_user_size} -> {new_user_size}");
    }

    fn on_dealloc(&mut self, ptr: *mut u8, user_size: usize) {
        log::trace!("dealloc {ptr:p} ({user_size} bytes)");
    }

    fn on_error(&mut self, ptr: *mut u8, kind: ErrorKind) {
        log::error!("memory corruption at {ptr:p}: {kind}");
    }
}
