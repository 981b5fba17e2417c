use crate::consts::{BIN_COUNT, MIN_SIZE};

/// Maps a total block size (header plus payload) to the index of the bin
/// that collects its size class. Bin `i` holds blocks whose total size falls
/// in `[2^(i + MIN_SIZE), 2^(i + MIN_SIZE + 1))`: the index of the most
/// significant set bit minus `MIN_SIZE`, clamped at both ends. Constant
/// time.
///
/// The clamp gives the search a useful property: a block filed in bin `i`
/// has total size of at least `2^(i + MIN_SIZE)`, so when a request's own
/// bin is exhausted, the head of any higher bin is large enough without a
/// size recheck.
#[inline]
pub(crate) fn bin_of(total_size: usize) -> usize {
    debug_assert!(total_size > 0 && total_size <= u32::MAX as usize);

    let msb = u32::BITS - 1 - (total_size as u32).leading_zeros();
    msb.saturating_sub(MIN_SIZE).min(BIN_COUNT as u32 - 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::SIZE_LIMIT;

    #[test]
    fn class_boundaries() {
        // Minimum-sized blocks fall below the first class and clamp into it.
        assert_eq!(bin_of(24), 0);

        assert_eq!(bin_of(32), 0);
        assert_eq!(bin_of(63), 0);
        assert_eq!(bin_of(64), 1);
        assert_eq!(bin_of(127), 1);
        assert_eq!(bin_of(128), 2);
        assert_eq!(bin_of(1024), 5);
        assert_eq!(bin_of(2047), 5);
        assert_eq!(bin_of(2048), 6);
    }

    #[test]
    fn every_power_of_two_starts_a_class() {
        for exponent in MIN_SIZE..SIZE_LIMIT - 1 {
            let lower = 1usize << exponent;
            let index = (exponent - MIN_SIZE) as usize;

            assert_eq!(bin_of(lower), index);
            assert_eq!(bin_of(2 * lower - 1), index);
        }
    }

    #[test]
    fn huge_sizes_clamp_into_the_last_bin() {
        assert_eq!(bin_of(1 << 31), BIN_COUNT - 1);
        assert_eq!(bin_of(u32::MAX as usize), BIN_COUNT - 1);
    }
}
