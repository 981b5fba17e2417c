use std::{iter, mem, ptr::NonNull};

use crate::{consts::BIN_COUNT, header::HEADER_SIZE, Pointer};

/// See [`crate::header::BlockHeader`] first. When a block is free we use the content of the
/// block to store a free list node, that is, the links of a doubly linked
/// list of free blocks of the same size class. This is how a free block
/// looks like in memory:
///
/// ```text
/// +----------------------------+
/// |        BlockHeader         |
/// +----------------------------+
/// | pointer to prev free block | <--+
/// +----------------------------+    | FreeListNode struct.
/// | pointer to next free block | <--+
/// +----------------------------+
/// |    Rest of the payload     | <--+
/// |            ...             |    | Could be 0 bytes.
/// +----------------------------+ <--+
/// ```
///
/// The node lives in the first bytes of the payload, so a node address and
/// the payload address of its free block are the same thing. Pointing into
/// block content is fine here: the block was released, so the caller dropped
/// its pointers to these bytes (if it didn't, that's use after free and it
/// better not).
///
/// Blocks within one list are not ordered by size, address or age, and lists
/// may link blocks from anywhere in the region.
#[repr(C)]
pub(crate) struct FreeListNode {
    pub prev: Pointer<FreeListNode>,
    pub next: Pointer<FreeListNode>,
}

/// Smallest total block size (header plus payload) the allocator will carve.
/// The payload of a free block has to be able to hold a [`FreeListNode`],
/// which is where this value comes from. Every allocation request is
/// silently raised to it.
pub(crate) const MIN_BLOCK_SIZE: usize = HEADER_SIZE + mem::size_of::<FreeListNode>();

impl FreeListNode {
    /// The node of a free block occupies the first payload bytes, so this is
    /// just a cast.
    #[inline]
    pub unsafe fn from_payload_address(payload: NonNull<u8>) -> NonNull<Self> {
        payload.cast()
    }

    /// Inverse of [`Self::from_payload_address`].
    #[inline]
    pub unsafe fn payload_address_of(node: NonNull<Self>) -> NonNull<u8> {
        node.cast()
    }
}

/// The segregated free lists: one unordered doubly linked list head per size
/// class. Since the nodes live inside freed payloads, no memory is ever
/// allocated for the lists themselves (we are the allocator).
pub(crate) struct Bins {
    heads: [Pointer<FreeListNode>; BIN_COUNT],
}

impl Bins {
    /// Creates all-empty bins.
    pub const fn new() -> Self {
        Self {
            heads: [None; BIN_COUNT],
        }
    }

    /// First node of bin `index`, if any.
    #[inline]
    pub fn head(&self, index: usize) -> Pointer<FreeListNode> {
        self.heads[index]
    }

    /// Head-inserts `node` into bin `index`. O(1).
    ///
    /// # Safety
    ///
    /// `node` must point to the writable payload of a free block that is not
    /// currently filed in any bin.
    pub unsafe fn insert(&mut self, node: NonNull<FreeListNode>, index: usize) {
        let head = self.heads[index];

        node.as_ptr().write(FreeListNode {
            prev: None,
            next: head,
        });

        if let Some(head) = head {
            (*head.as_ptr()).prev = Some(node);
        }

        self.heads[index] = Some(node);
    }

    /// Unlinks `node`, rewiring its neighbors around it. O(1): the caller
    /// supplies the bin index, recomputed from the block's size.
    ///
    /// # Safety
    ///
    /// `node` must currently be filed in bin `index`.
    pub unsafe fn remove(&mut self, node: NonNull<FreeListNode>, index: usize) {
        let FreeListNode { prev, next } = node.as_ptr().read();

        if let Some(next) = next {
            (*next.as_ptr()).prev = prev;
        }

        match prev {
            Some(prev) => (*prev.as_ptr()).next = next,
            None => self.heads[index] = next,
        }
    }

    /// Iterates the nodes filed in bin `index`, head first.
    ///
    /// # Safety
    ///
    /// The bin must not be mutated while the iterator is alive.
    pub unsafe fn iter(&self, index: usize) -> impl Iterator<Item = NonNull<FreeListNode>> + '_ {
        let mut current = self.heads[index];

        iter::from_fn(move || {
            let node = current?;
            current = unsafe { (*node.as_ptr()).next };
            Some(node)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes<const N: usize>() -> Box<[FreeListNode; N]> {
        let mut storage = Vec::with_capacity(N);
        storage.resize_with(N, || FreeListNode {
            prev: None,
            next: None,
        });

        storage.into_boxed_slice().try_into().ok().unwrap()
    }

    unsafe fn collect(bins: &Bins, index: usize) -> Vec<NonNull<FreeListNode>> {
        bins.iter(index).collect()
    }

    #[test]
    fn insert_is_head_first() {
        let mut storage = nodes::<3>();

        unsafe {
            let a = NonNull::from(&mut storage[0]);
            let b = NonNull::from(&mut storage[1]);
            let c = NonNull::from(&mut storage[2]);

            let mut bins = Bins::new();
            bins.insert(a, 0);
            bins.insert(b, 0);
            bins.insert(c, 0);

            assert_eq!(collect(&bins, 0), vec![c, b, a]);
            assert_eq!((*b.as_ptr()).prev, Some(c));
            assert_eq!((*b.as_ptr()).next, Some(a));

            // Other bins are untouched.
            assert_eq!(bins.head(1), None);
        }
    }

    #[test]
    fn remove_rewires_neighbors() {
        let mut storage = nodes::<3>();

        unsafe {
            let a = NonNull::from(&mut storage[0]);
            let b = NonNull::from(&mut storage[1]);
            let c = NonNull::from(&mut storage[2]);

            let mut bins = Bins::new();
            bins.insert(a, 4);
            bins.insert(b, 4);
            bins.insert(c, 4);

            // Middle node.
            bins.remove(b, 4);
            assert_eq!(collect(&bins, 4), vec![c, a]);
            assert_eq!((*a.as_ptr()).prev, Some(c));

            // Head node.
            bins.remove(c, 4);
            assert_eq!(collect(&bins, 4), vec![a]);
            assert_eq!((*a.as_ptr()).prev, None);

            // Last node.
            bins.remove(a, 4);
            assert_eq!(bins.head(4), None);
        }
    }
}
