use std::{fmt, ptr::NonNull};

use crate::{
    consts::{ALIGNMENT, BIN_COUNT},
    freelist::FreeListNode,
    header::{BlockHeader, HEADER_SIZE},
    heap::Heap,
    provider::PageProvider,
    size_class::bin_of,
};

/// Structural corruption found by [`Heap::check`]. Addresses identify the
/// offending block by its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckError {
    /// The physical header walk did not land exactly on the sentinel at the
    /// top of the region.
    BrokenChain {
        /// Where the sentinel header lives.
        sentinel: usize,
        /// Where the walk ended up instead.
        reached: usize,
    },
    /// A block filed in a bin is not marked free in its successor's header.
    NotMarkedFree { payload: usize },
    /// Two physically adjacent blocks are both free.
    Uncoalesced { payload: usize },
    /// A free block is filed under the wrong size class.
    WrongBin {
        payload: usize,
        filed: usize,
        expected: usize,
    },
    /// A block size or payload address is not a multiple of the alignment.
    Misaligned { payload: usize },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::BrokenChain { sentinel, reached } => write!(
                f,
                "header walk ended at {reached:#x} instead of the sentinel at {sentinel:#x}"
            ),
            CheckError::NotMarkedFree { payload } => {
                write!(f, "block {payload:#x} is filed in a bin but not marked free")
            }
            CheckError::Uncoalesced { payload } => {
                write!(f, "block {payload:#x} has a free physical neighbor")
            }
            CheckError::WrongBin {
                payload,
                filed,
                expected,
            } => write!(
                f,
                "block {payload:#x} is filed in bin {filed} but belongs in bin {expected}"
            ),
            CheckError::Misaligned { payload } => {
                write!(f, "block {payload:#x} has a misaligned address or size")
            }
        }
    }
}

impl std::error::Error for CheckError {}

impl<P: PageProvider> Heap<P> {
    /// Walks the whole region and every bin, certifying the structural
    /// invariants:
    ///
    /// 1. The headers chain gaplessly from the first block to the sentinel.
    /// 2. Every block filed in a bin is marked free by its successor.
    /// 3. Every filed block sits in the bin of its size class.
    /// 4. No filed block has a free physical neighbor on either side.
    /// 5. Sizes and payload addresses are aligned.
    ///
    /// Normal operation never runs this; it exists for tests and debugging.
    pub fn check(&self) -> Result<(), CheckError> {
        unsafe {
            self.check_chain()?;
            self.check_bins()
        }
    }

    /// Linear physical walk from the first header, summing block totals. It
    /// has to land exactly on the sentinel.
    unsafe fn check_chain(&self) -> Result<(), CheckError> {
        let top = self.top();
        let mut header = self.base;

        while header + HEADER_SIZE < top {
            let payload = NonNull::new_unchecked((header + HEADER_SIZE) as *mut u8);
            header += BlockHeader::size_of(payload) + HEADER_SIZE;
        }

        if header + HEADER_SIZE != top {
            return Err(CheckError::BrokenChain {
                sentinel: top - HEADER_SIZE,
                reached: header,
            });
        }

        Ok(())
    }

    /// Per-bin scan: marked free, right class, aligned, and no free neighbor
    /// in either direction (which together witness coalescing completeness).
    unsafe fn check_bins(&self) -> Result<(), CheckError> {
        for index in 0..BIN_COUNT {
            for node in self.bins.iter(index) {
                let payload = FreeListNode::payload_address_of(node);
                let address = payload.as_ptr() as usize;
                let size = BlockHeader::size_of(payload);

                if address % ALIGNMENT != 0 || size % ALIGNMENT != 0 {
                    return Err(CheckError::Misaligned { payload: address });
                }

                if !BlockHeader::is_free(payload) {
                    return Err(CheckError::NotMarkedFree { payload: address });
                }

                let expected = bin_of(size + HEADER_SIZE);
                if expected != index {
                    return Err(CheckError::WrongBin {
                        payload: address,
                        filed: index,
                        expected,
                    });
                }

                if self.has_successor(payload, size) {
                    let next = NonNull::new_unchecked((address + size + HEADER_SIZE) as *mut u8);
                    if BlockHeader::is_free(next) {
                        return Err(CheckError::Uncoalesced { payload: address });
                    }
                }

                if self.has_predecessor(payload) && BlockHeader::is_prev_free(payload) {
                    return Err(CheckError::Uncoalesced { payload: address });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FixedRegion;

    fn heap() -> Heap<FixedRegion> {
        Heap::init(FixedRegion::new(4096)).unwrap()
    }

    #[test]
    fn empty_heap_passes() {
        heap().check().unwrap();
    }

    #[test]
    fn live_and_free_mix_passes() {
        let mut heap = heap();

        unsafe {
            let _a = heap.allocate(24).unwrap();
            let b = heap.allocate(100).unwrap();
            let _c = heap.allocate(300).unwrap();
            heap.release(b);
        }

        heap.check().unwrap();
    }

    #[test]
    fn rejects_adjacent_free_blocks() {
        let mut heap = heap();

        unsafe {
            let _a = heap.allocate(64).unwrap();
            let b = heap.allocate(64).unwrap();
            let c = heap.allocate(64).unwrap();

            // Bypassing the coalescer leaves b and c both free and adjacent.
            heap.release_without_coalesce(b);
            heap.check().unwrap();

            heap.release_without_coalesce(c);
            assert!(matches!(
                heap.check(),
                Err(CheckError::Uncoalesced { .. })
            ));
        }
    }

    #[test]
    fn rejects_filed_block_not_marked_free() {
        let mut heap = heap();

        unsafe {
            let a = heap.allocate(64).unwrap();
            let _guard = heap.allocate(64).unwrap();
            heap.release(a);

            // Flip the free bit behind the bins' back.
            BlockHeader::mark_live(a, BlockHeader::size_of(a));

            assert_eq!(
                heap.check(),
                Err(CheckError::NotMarkedFree {
                    payload: a.as_ptr() as usize
                })
            );
        }
    }

    #[test]
    fn rejects_block_filed_in_wrong_bin() {
        let mut heap = heap();

        unsafe {
            let a = heap.allocate(64).unwrap();
            let size = BlockHeader::size_of(a);

            BlockHeader::mark_free(a, size);
            heap.bins.insert(FreeListNode::from_payload_address(a), 9);

            assert_eq!(
                heap.check(),
                Err(CheckError::WrongBin {
                    payload: a.as_ptr() as usize,
                    filed: 9,
                    expected: bin_of(size + HEADER_SIZE),
                })
            );
        }
    }

    #[test]
    fn rejects_corrupted_size_field() {
        let mut heap = heap();

        unsafe {
            let a = heap.allocate(64).unwrap();
            let _guard = heap.allocate(64).unwrap();

            // The walk now jumps past the end of the region.
            BlockHeader::set_size(a, 200);

            assert!(matches!(heap.check(), Err(CheckError::BrokenChain { .. })));
        }
    }
}
