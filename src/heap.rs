use std::ptr::{self, NonNull};

use crate::{
    align::align,
    consts::{BIN_COUNT, MAX_REQUEST_SIZE},
    freelist::{Bins, FreeListNode, MIN_BLOCK_SIZE},
    header::{BlockHeader, HEADER_SIZE},
    provider::PageProvider,
    size_class::bin_of,
    AllocError, AllocResult, Pointer,
};

/// Materializes a payload pointer from a raw region address.
#[inline]
fn payload_at(address: usize) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(address as *mut u8) }
}

/// The allocator core: allocate, release and resize over one contiguous
/// region, with freed blocks recycled through segregated free lists.
///
/// The region is a gapless chain of blocks from the first header written at
/// initialization up to a zero-sized sentinel header occupying the last
/// bytes. Between operations, every block is either live (held by a caller)
/// or filed in exactly one bin, and no two physically adjacent blocks are
/// both free. [`Heap::check`] certifies these invariants on demand.
///
/// # Examples
///
/// ```
/// use segalloc::{FixedRegion, Heap};
///
/// let mut heap = Heap::init(FixedRegion::new(4096)).unwrap();
///
/// let ptr = heap.allocate(128).unwrap();
/// assert_eq!(ptr.as_ptr() as usize % 8, 0);
///
/// unsafe { heap.release(ptr) };
/// ```
pub struct Heap<P: PageProvider> {
    pub(crate) provider: P,
    pub(crate) bins: Bins,
    /// Address of the first block header, fixed at initialization.
    pub(crate) base: usize,
}

impl<P: PageProvider> Heap<P> {
    /// Takes ownership of the provider's region: aligns its high bound
    /// upward, writes the terminating sentinel header and starts with empty
    /// bins. Construction is the `init` operation, so no allocation can ever
    /// observe an uninitialized heap, and dropping the heap and initializing
    /// a new one is the only way to reset it.
    pub fn init(mut provider: P) -> Result<Self, AllocError> {
        let top = provider.high_bound() + 1;
        let pad = align(top) - top;

        if pad > 0 {
            provider.grow(pad).ok_or(AllocError)?;
        }

        let sentinel = provider.grow(HEADER_SIZE).ok_or(AllocError)?;
        unsafe { BlockHeader::install_sentinel(sentinel) };

        Ok(Self {
            provider,
            bins: Bins::new(),
            base: sentinel.as_ptr() as usize,
        })
    }

    /// Allocates a block with at least `size` writable payload bytes
    /// (possibly more), aligned to the allocator alignment. Fails only when
    /// the page provider refuses to extend the region or the request
    /// overflows the 32-bit size field.
    pub fn allocate(&mut self, size: usize) -> AllocResult {
        if size > MAX_REQUEST_SIZE {
            return Err(AllocError);
        }

        let mut size = align(size);
        let mut total = size + HEADER_SIZE;

        if total < MIN_BLOCK_SIZE {
            size = MIN_BLOCK_SIZE - HEADER_SIZE;
            total = MIN_BLOCK_SIZE;
        }

        unsafe {
            if let Some(payload) = self.take_from_bins(size, total) {
                return Ok(payload);
            }

            // Top-of-heap fast path: if the physically last block is free it
            // was too small for the request (the bin search would have found
            // it otherwise), so grow by the shortfall only and extend it in
            // place.
            let top = payload_at(self.top());
            if BlockHeader::is_prev_free(top) {
                let last_size = BlockHeader::prev_size_of(top);
                let payload = payload_at(self.top() - HEADER_SIZE - last_size);

                self.provider.grow(size - last_size).ok_or(AllocError)?;
                self.bins.remove(
                    FreeListNode::from_payload_address(payload),
                    bin_of(last_size + HEADER_SIZE),
                );
                self.seal_top(payload, size);

                return Ok(payload);
            }

            // Nothing reusable anywhere: push a fresh block at the top. The
            // old sentinel becomes its header.
            let payload = self.provider.grow(total).ok_or(AllocError)?;
            self.seal_top(payload, size);

            Ok(payload)
        }
    }

    /// Releases a block: merges it with free neighbors and files the result
    /// under its size class.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Heap::allocate`] or
    /// [`Heap::resize`] on this heap and not released since.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let payload = self.coalesce(ptr);
        let total = BlockHeader::size_of(payload) + HEADER_SIZE;

        self.bins
            .insert(FreeListNode::from_payload_address(payload), bin_of(total));
    }

    /// Resizes a block, preserving its contents up to the smaller of the old
    /// and new sizes.
    ///
    /// - `resize(None, n)` behaves as `allocate(n)`.
    /// - `resize(Some(p), 0)` releases the block and returns `Ok(None)`.
    /// - Otherwise the block is shrunk or grown in place when possible and
    ///   moved as a last resort. `Err` means the provider refused to grow;
    ///   the original block is untouched in that case.
    ///
    /// # Safety
    ///
    /// `ptr`, when `Some`, must have been returned by [`Heap::allocate`] or
    /// [`Heap::resize`] on this heap and not released since.
    pub unsafe fn resize(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(payload) = ptr else {
            if new_size == 0 {
                return Ok(None);
            }
            return self.allocate(new_size).map(Some);
        };

        if new_size == 0 {
            self.release(payload);
            return Ok(None);
        }

        if new_size > MAX_REQUEST_SIZE {
            return Err(AllocError);
        }

        let mut size = align(new_size);
        let mut total = size + HEADER_SIZE;

        if total < MIN_BLOCK_SIZE {
            size = MIN_BLOCK_SIZE - HEADER_SIZE;
            total = MIN_BLOCK_SIZE;
        }

        let current = BlockHeader::size_of(payload);
        let current_total = current + HEADER_SIZE;

        // Shrink in place. The shed tail is filed as it is, not merged with
        // a free right neighbor (policy).
        if current >= size {
            if current - size >= MIN_BLOCK_SIZE {
                self.split(payload, total, current_total);
                BlockHeader::mark_live(payload, size);
            }
            return Ok(Some(payload));
        }

        // Grow in place into a free successor when the combined span fits.
        if self.has_successor(payload, current) {
            let next = payload_at(payload.as_ptr() as usize + current_total);

            if BlockHeader::is_free(next) {
                let next_total = BlockHeader::size_of(next) + HEADER_SIZE;

                if current + next_total >= size {
                    self.bins.remove(
                        FreeListNode::from_payload_address(next),
                        bin_of(next_total),
                    );

                    let kept = if current + next_total - size >= MIN_BLOCK_SIZE {
                        self.split(payload, total, current_total + next_total);
                        size
                    } else {
                        current + next_total
                    };

                    BlockHeader::set_size(payload, kept);
                    BlockHeader::mark_live(payload, kept);

                    return Ok(Some(payload));
                }
            }
        }

        // The block sits at the top of the region: grow by the shortfall
        // only and extend in place.
        if payload.as_ptr() as usize + current_total == self.top() {
            self.provider.grow(size - current).ok_or(AllocError)?;
            self.seal_top(payload, size);

            return Ok(Some(payload));
        }

        // Last resort: move. The copy uses the old payload size; the caller
        // never handed us more than that.
        let new_payload = self.allocate(new_size)?;
        ptr::copy_nonoverlapping(payload.as_ptr(), new_payload.as_ptr(), current);
        self.release(payload);

        Ok(Some(new_payload))
    }

    /// One past the last byte of the region. The sentinel header occupies
    /// the bytes right below.
    #[inline]
    pub(crate) fn top(&self) -> usize {
        self.provider.high_bound() + 1
    }

    /// Whether a real block (not the sentinel) starts right after the block
    /// at `payload` of the given payload size.
    #[inline]
    pub(crate) fn has_successor(&self, payload: NonNull<u8>, size: usize) -> bool {
        payload.as_ptr() as usize + size + HEADER_SIZE < self.top()
    }

    /// Whether a block precedes the block at `payload`.
    #[inline]
    pub(crate) fn has_predecessor(&self, payload: NonNull<u8>) -> bool {
        payload.as_ptr() as usize - HEADER_SIZE > self.base
    }

    /// Searches the bins for a free block of at least `total` bytes: first
    /// fit within the request's own class, and across classes the head of
    /// the first non-empty bin, which is always large enough (see
    /// [`bin_of`]). The returned payload is stamped live.
    ///
    /// First fit within the class is intentional: the lists are unordered,
    /// so this is effectively a random pick, and the factor-of-two class
    /// granularity bounds the internal fragmentation it can cause.
    unsafe fn take_from_bins(&mut self, size: usize, total: usize) -> Pointer<u8> {
        let index = bin_of(total);

        let mut current = self.bins.head(index);
        while let Some(node) = current {
            let payload = FreeListNode::payload_address_of(node);
            let found = BlockHeader::size_of(payload) + HEADER_SIZE;

            if found >= total {
                self.bins.remove(node, index);
                return Some(self.place(payload, size, total, found));
            }

            current = (*node.as_ptr()).next;
        }

        for i in index + 1..BIN_COUNT {
            if let Some(node) = self.bins.head(i) {
                let payload = FreeListNode::payload_address_of(node);
                let found = BlockHeader::size_of(payload) + HEADER_SIZE;

                self.bins.remove(node, i);
                return Some(self.place(payload, size, total, found));
            }
        }

        None
    }

    /// Stamps a block just pulled from a bin as live, splitting off the tail
    /// when the excess can stand as a block of its own. Otherwise the caller
    /// keeps the whole block, excess included.
    unsafe fn place(
        &mut self,
        payload: NonNull<u8>,
        size: usize,
        total: usize,
        found_total: usize,
    ) -> NonNull<u8> {
        let kept = if found_total - total >= MIN_BLOCK_SIZE {
            self.split(payload, total, found_total);
            size
        } else {
            found_total - HEADER_SIZE
        };

        BlockHeader::set_size(payload, kept);
        BlockHeader::mark_live(payload, kept);

        payload
    }

    /// Splits the block at `payload` of total size `original_total` in two:
    /// the retained head keeps `total` bytes, and the remainder is filed
    /// into its bin.
    ///
    /// **Before**:
    ///
    /// ```text
    ///         +-->  +-----------+
    ///         |     |  Header   |
    /// Block   |     +-----------+
    ///         |     |  Payload  | <- original_total - 8 bytes.
    ///         +-->  +-----------+
    /// ```
    ///
    /// **After**:
    ///
    /// ```text
    ///           +-->  +-----------+
    ///           |     |  Header   |
    /// Retained  |     +-----------+
    ///           |     |  Payload  | <- total - 8 bytes.
    ///           +-->  +-----------+
    ///           |     |  Header   |
    /// Remainder |     +-----------+
    ///           |     |  Payload  | <- original_total - total - 8 bytes.
    ///           +-->  +-----------+
    /// ```
    ///
    /// Both halves come out free-marked; callers keeping the retained half
    /// live stamp it afterwards. The block must not be filed in any bin and
    /// `original_total - total` must be at least [`MIN_BLOCK_SIZE`].
    unsafe fn split(&mut self, payload: NonNull<u8>, total: usize, original_total: usize) {
        let remainder_total = original_total - total;
        debug_assert!(remainder_total >= MIN_BLOCK_SIZE);

        let remainder = payload_at(payload.as_ptr() as usize + total);
        let remainder_size = remainder_total - HEADER_SIZE;
        BlockHeader::set_size(remainder, remainder_size);
        BlockHeader::mark_free(remainder, remainder_size);

        let size = total - HEADER_SIZE;
        BlockHeader::set_size(payload, size);
        BlockHeader::mark_free(payload, size);

        self.bins.insert(
            FreeListNode::from_payload_address(remainder),
            bin_of(remainder_total),
        );
    }

    /// Merges the block at `payload` with its free physical neighbors and
    /// stamps the result free. The result is **not** filed into any bin, and
    /// the input must not be in one either.
    ///
    /// **Before**:
    ///
    /// ```text
    /// +----------+----------------+----------+
    /// |  A, free |  B, coalescing |  C, free |
    /// +----------+----------------+----------+
    /// ```
    ///
    /// **After**:
    ///
    /// ```text
    /// +--------------------------------------+
    /// |          one free block at A         |
    /// +--------------------------------------+
    /// ```
    ///
    /// Forward first, then backward: the backward step rebases the block, so
    /// the boundary read for the forward neighbor has to happen before it.
    unsafe fn coalesce(&mut self, payload: NonNull<u8>) -> NonNull<u8> {
        let mut payload = payload;
        let mut size = BlockHeader::size_of(payload);

        if self.has_successor(payload, size) {
            let next = payload_at(payload.as_ptr() as usize + size + HEADER_SIZE);

            if BlockHeader::is_free(next) {
                let next_size = BlockHeader::size_of(next);

                self.bins.remove(
                    FreeListNode::from_payload_address(next),
                    bin_of(next_size + HEADER_SIZE),
                );

                size += HEADER_SIZE + next_size;
                BlockHeader::set_size(payload, size);
            }
        }

        if self.has_predecessor(payload) && BlockHeader::is_prev_free(payload) {
            let prev_total = BlockHeader::prev_size_of(payload) + HEADER_SIZE;
            payload = payload_at(payload.as_ptr() as usize - prev_total);

            self.bins.remove(
                FreeListNode::from_payload_address(payload),
                bin_of(prev_total),
            );

            size += prev_total;
            BlockHeader::set_size(payload, size);
        }

        BlockHeader::mark_free(payload, size);

        payload
    }

    /// Stamps `payload` as the live last block and re-seats the sentinel at
    /// the new top of the region. Callers grow the provider first; this
    /// formats what they obtained.
    unsafe fn seal_top(&mut self, payload: NonNull<u8>, size: usize) {
        debug_assert!(payload.as_ptr() as usize + size + HEADER_SIZE == self.top());

        let sentinel = payload_at(payload.as_ptr() as usize + size);
        BlockHeader::install_sentinel(sentinel);
        BlockHeader::set_size(payload, size);
        BlockHeader::mark_live(payload, size);
    }
}

#[cfg(test)]
impl<P: PageProvider> Heap<P> {
    /// Number of blocks currently filed across all bins.
    pub(crate) fn free_block_count(&self) -> usize {
        (0..BIN_COUNT)
            .map(|i| unsafe { self.bins.iter(i).count() })
            .sum()
    }

    /// Total sizes of the blocks filed in bin `index`, head first.
    pub(crate) fn bin_totals(&self, index: usize) -> Vec<usize> {
        unsafe {
            self.bins
                .iter(index)
                .map(|node| {
                    BlockHeader::size_of(FreeListNode::payload_address_of(node)) + HEADER_SIZE
                })
                .collect()
        }
    }

    /// Files a block into its bin without coalescing. Breaks the
    /// no-adjacent-free invariant on purpose so validator tests can observe
    /// the rejection.
    pub(crate) unsafe fn release_without_coalesce(&mut self, payload: NonNull<u8>) {
        let size = BlockHeader::size_of(payload);

        BlockHeader::mark_free(payload, size);
        self.bins.insert(
            FreeListNode::from_payload_address(payload),
            bin_of(size + HEADER_SIZE),
        );
    }
}
