use std::ops::RangeInclusive;

use crate::{Error, Result};

/// An inclusive, dense range of buffer sizes, expressed as log2 of the byte count.
///
/// Every case execution copies `1 << exponent` bytes in each direction.
///
/// # Example
///
/// ```
/// use numa_duplex::SizeRange;
///
/// let sizes = SizeRange::new(10, 12).unwrap();
///
/// let bytes = sizes.exponents().map(SizeRange::bytes_for).collect::<Vec<_>>();
/// assert_eq!(bytes, [1024, 2048, 4096]);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SizeRange {
    min_exponent: u32,
    max_exponent: u32,
}

impl SizeRange {
    /// The default registration range: 256 bytes up to 2 GiB.
    pub const SMALL: Self = Self {
        min_exponent: 8,
        max_exponent: 31,
    };

    /// Largest exponent for which the byte count still fits in a `u64`.
    pub const MAX_EXPONENT: u32 = 63;

    /// Creates a range from `min_exponent` to `max_exponent`, both inclusive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSizeRange`] if the range is descending or if either bound is
    /// above [`SizeRange::MAX_EXPONENT`].
    pub fn new(min_exponent: u32, max_exponent: u32) -> Result<Self> {
        if min_exponent > max_exponent || max_exponent > Self::MAX_EXPONENT {
            return Err(Error::InvalidSizeRange {
                min: min_exponent,
                max: max_exponent,
            });
        }

        Ok(Self {
            min_exponent,
            max_exponent,
        })
    }

    /// Smallest log2 size in the range.
    #[must_use]
    pub fn min_exponent(&self) -> u32 {
        self.min_exponent
    }

    /// Largest log2 size in the range.
    #[must_use]
    pub fn max_exponent(&self) -> u32 {
        self.max_exponent
    }

    /// Iterates over every log2 size in the range, in ascending order.
    pub fn exponents(&self) -> RangeInclusive<u32> {
        self.min_exponent..=self.max_exponent
    }

    /// Number of sizes in the range.
    #[must_use]
    #[expect(
        clippy::arithmetic_side_effects,
        reason = "constructor guarantees min <= max <= 63"
    )]
    pub fn len(&self) -> usize {
        (self.max_exponent - self.min_exponent + 1) as usize
    }

    /// Always `false`; a size range contains at least one size.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The byte count for a log2 size.
    ///
    /// # Panics
    ///
    /// Panics if `exponent` is above [`SizeRange::MAX_EXPONENT`].
    #[must_use]
    pub fn bytes_for(exponent: u32) -> u64 {
        1_u64
            .checked_shl(exponent)
            .expect("size exponents are validated to be below 64 before use")
    }
}

impl Default for SizeRange {
    fn default() -> Self {
        Self::SMALL
    }
}
