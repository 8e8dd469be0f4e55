use super::chunk::Chunk;

/// Circular doubly-linked list of same-sized free chunks. The links live
/// inside the free chunks' payloads; the ring itself stores only the head.
///
/// Invariant for every member: `c.next_free().prev_free() == c` and
/// `c.prev_free().next_free() == c`.
pub(crate) struct ChunkRing {
    head: Option<Chunk>,
}

impl ChunkRing {
    pub(crate) const fn new() -> Self {
        ChunkRing { head: None }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Link a free chunk into the ring, just after the head.
    ///
    /// # Safety
    /// `chunk` must be a free chunk with at least two payload words, not
    /// already a member of any ring.
    pub(crate) unsafe fn push(&mut self, chunk: Chunk) {
        match self.head {
            Some(head) => {
                let next = head.next_free();
                head.set_next_free(chunk);
                next.set_prev_free(chunk);
                chunk.set_next_free(next);
                chunk.set_prev_free(head);
            }
            None => {
                chunk.set_next_free(chunk);
                chunk.set_prev_free(chunk);
                self.head = Some(chunk);
            }
        }
    }

    /// Unlink and return the head chunk.
    ///
    /// # Safety
    /// Every member's links must be intact.
    pub(crate) unsafe fn pop(&mut self) -> Option<Chunk> {
        let head = self.head?;
        let prev = head.prev_free();
        let next = head.next_free();
        if head == prev {
            debug_assert!(head == next, "singleton ring with mismatched links");
            self.head = None;
        } else {
            prev.set_next_free(next);
            next.set_prev_free(prev);
            self.head = Some(next);
        }
        Some(head)
    }

    /// Unlink a specific member. Returns true when the ring is now empty.
    ///
    /// # Safety
    /// `chunk` must currently be a member of this ring.
    #[allow(dead_code)]
    pub(crate) unsafe fn unlink(&mut self, chunk: Chunk) -> bool {
        let prev = chunk.prev_free();
        let next = chunk.next_free();
        if prev == chunk {
            debug_assert!(
                self.head == Some(chunk) && next == chunk,
                "singleton ring with mismatched links"
            );
            self.head = None;
            true
        } else {
            if self.head == Some(chunk) {
                self.head = Some(next);
            }
            prev.set_next_free(next);
            next.set_prev_free(prev);
            false
        }
    }
}
