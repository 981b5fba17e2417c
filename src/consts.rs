//! Compile-time tunables. Changing any of these requires recompiling; there
//! is no runtime configuration surface.

use std::mem;

use crate::header::BlockHeader;

/// Every payload address handed to a caller and every stored block size is a
/// multiple of this. Must be a power of two no smaller than 8.
pub(crate) const ALIGNMENT: usize = 8;

/// Exponent of the smallest size class's lower bound: bin 0 collects blocks
/// whose total size is below `1 << (MIN_SIZE + 1)`.
pub(crate) const MIN_SIZE: u32 = 5;

/// Exponent of the largest size class's upper bound.
pub(crate) const SIZE_LIMIT: u32 = 32;

/// Number of segregated bins.
pub(crate) const BIN_COUNT: usize = (SIZE_LIMIT - MIN_SIZE) as usize;

/// Largest payload a single request may ask for. Header size fields are 32
/// bits wide, so the aligned total of any block has to fit one.
pub(crate) const MAX_REQUEST_SIZE: usize =
    (u32::MAX as usize - mem::size_of::<BlockHeader>()) & !(ALIGNMENT - 1);

const _: () = assert!(ALIGNMENT >= 8 && ALIGNMENT.is_power_of_two());

// Block boundaries advance in ALIGNMENT steps and payloads sit exactly one
// header past a boundary, so the header width must match the alignment or
// payloads would come out misaligned.
const _: () = assert!(ALIGNMENT == mem::size_of::<BlockHeader>());

const _: () = assert!(MIN_SIZE < SIZE_LIMIT);
