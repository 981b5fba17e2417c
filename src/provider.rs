//! Lower-level sources of heap memory. The allocator only needs one
//! contiguous region that grows on demand and never shrinks or moves; it
//! doesn't care which platform facility backs it. Each platform gets its own
//! implementation of [`PageProvider`], plus an owned arena for tests.

use std::ptr::NonNull;

/// A single contiguous, monotonically growing memory region.
///
/// The region spans `low_bound()..=high_bound()` and only ever extends
/// upward: [`PageProvider::grow`] appends bytes at the top and returns the
/// address where they begin, which is always the old `high_bound() + 1`.
/// Nothing is ever returned to the source; there is no paired release.
pub trait PageProvider {
    /// Inclusive address of the first byte of the region.
    fn low_bound(&self) -> usize;

    /// Inclusive address of the last byte of the region. Changes after
    /// [`PageProvider::grow`].
    fn high_bound(&self) -> usize;

    /// Extends the region by exactly `amount` bytes and returns the address
    /// of the first new byte, or `None` if the source refuses. On `None` the
    /// region is unchanged.
    fn grow(&mut self, amount: usize) -> Option<NonNull<u8>>;
}

/// Program-break region on unix: `grow` bumps the break with `sbrk`.
///
/// Contiguity is only guaranteed while nothing else moves the break. In
/// particular, a libc malloc backed by `brk` running in the same process
/// would interleave its own increments with ours, so a program using [`Brk`]
/// must not allocate through malloc between grows.
#[cfg(unix)]
pub struct Brk {
    low: usize,
    /// One past the last byte we obtained.
    end: usize,
}

#[cfg(unix)]
impl Brk {
    /// Takes over the region starting at the current program break.
    pub fn new() -> Self {
        let current = unsafe { libc::sbrk(0) } as usize;

        Self {
            low: current,
            end: current,
        }
    }
}

#[cfg(unix)]
impl Default for Brk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl PageProvider for Brk {
    fn low_bound(&self) -> usize {
        self.low
    }

    fn high_bound(&self) -> usize {
        self.end - 1
    }

    fn grow(&mut self, amount: usize) -> Option<NonNull<u8>> {
        let address = unsafe { libc::sbrk(amount as libc::intptr_t) };

        if address == usize::MAX as *mut libc::c_void {
            return None;
        }

        self.end += amount;

        Some(unsafe { NonNull::new_unchecked(address.cast()) })
    }
}

/// Fixed-capacity arena with grow-only semantics, backed by the global
/// allocator. Growing past the capacity fails deterministically, which is
/// exactly what the out-of-memory tests need, and there's no FFI involved so
/// it also works under Miri.
pub struct FixedRegion {
    base: NonNull<u8>,
    capacity: usize,
    len: usize,
}

impl FixedRegion {
    /// Reserves `capacity` bytes up front. The region starts empty and grows
    /// into the reservation.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);

        let layout = Self::layout(capacity);
        let Some(base) = NonNull::new(unsafe { std::alloc::alloc(layout) }) else {
            std::alloc::handle_alloc_error(layout);
        };

        Self {
            base,
            capacity,
            len: 0,
        }
    }

    fn layout(capacity: usize) -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(capacity, crate::consts::ALIGNMENT).unwrap()
    }
}

impl Drop for FixedRegion {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base.as_ptr(), Self::layout(self.capacity)) };
    }
}

impl PageProvider for FixedRegion {
    fn low_bound(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn high_bound(&self) -> usize {
        self.base.as_ptr() as usize + self.len - 1
    }

    fn grow(&mut self, amount: usize) -> Option<NonNull<u8>> {
        if self.capacity - self.len < amount {
            return None;
        }

        let address = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.len)) };
        self.len += amount;

        Some(address)
    }
}

/// Contiguous grow-only region on Windows. `VirtualAlloc` cannot promise
/// that successive calls hand out adjacent pages, so the whole address range
/// is reserved up front and committed page by page as the region grows.
#[cfg(windows)]
pub struct VirtualRegion {
    base: NonNull<u8>,
    reserved: usize,
    committed: usize,
}

#[cfg(windows)]
mod virtual_region {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{PageProvider, VirtualRegion};

    impl VirtualRegion {
        /// Reserves `reserve` bytes of address space, or `None` if the
        /// reservation fails. No memory is committed yet.
        ///
        /// For the reservation size parameters, see
        /// https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
        pub fn new(reserve: usize) -> Option<Self> {
            let base = unsafe {
                Memory::VirtualAlloc(None, reserve, Memory::MEM_RESERVE, Memory::PAGE_READWRITE)
            };

            NonNull::new(base.cast()).map(|base| Self {
                base,
                reserved: reserve,
                committed: 0,
            })
        }
    }

    impl Drop for VirtualRegion {
        fn drop(&mut self) {
            // Releasing with length 0 skips decommitting. See the docs:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            unsafe {
                if !Memory::VirtualFree(self.base.as_ptr().cast(), 0, Memory::MEM_RELEASE).as_bool()
                {
                    // Release failed; the reservation leaks but the region
                    // contents were never touched, so nothing is corrupted.
                }
            }
        }
    }

    impl PageProvider for VirtualRegion {
        fn low_bound(&self) -> usize {
            self.base.as_ptr() as usize
        }

        fn high_bound(&self) -> usize {
            self.base.as_ptr() as usize + self.committed - 1
        }

        fn grow(&mut self, amount: usize) -> Option<NonNull<u8>> {
            if self.reserved - self.committed < amount {
                return None;
            }

            let address = unsafe { self.base.as_ptr().add(self.committed) };

            // Committing a page twice is fine, so no need to round to page
            // boundaries here.
            let committed = unsafe {
                Memory::VirtualAlloc(
                    Some(address.cast()),
                    amount,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                )
            };

            if committed.is_null() {
                return None;
            }

            self.committed += amount;

            NonNull::new(address)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_region_grows_contiguously() {
        let mut region = FixedRegion::new(256);
        let low = region.low_bound();

        let first = region.grow(64).unwrap();
        assert_eq!(first.as_ptr() as usize, low);
        assert_eq!(region.high_bound(), low + 63);

        let second = region.grow(64).unwrap();
        assert_eq!(second.as_ptr() as usize, low + 64);
        assert_eq!(region.high_bound(), low + 127);

        assert_eq!(region.low_bound(), low);
    }

    #[test]
    fn fixed_region_refuses_past_capacity() {
        let mut region = FixedRegion::new(128);

        assert!(region.grow(200).is_none());
        // A refused grow leaves the region unchanged.
        assert!(region.grow(128).is_some());
        assert!(region.grow(1).is_none());
    }
}
