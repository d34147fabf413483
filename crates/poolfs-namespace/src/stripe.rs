//! Stripe mapping for file content
//!
//! Maps logical byte ranges of a file to stripe objects in its data pool.

use poolfs_common::{Error, InodeId, Result};

/// Stripe index within a file
pub type StripeIndex = u64;

/// A range of bytes within one stripe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeRange {
    /// Stripe index
    pub index: StripeIndex,
    /// Byte offset within the stripe
    pub offset_in_stripe: u64,
    /// Number of bytes in this range
    pub length: u64,
    /// Offset of this range within the file
    pub file_offset: u64,
}

/// Maps file byte ranges to stripes
///
/// Files are divided into fixed-size stripes. Each stripe that has ever
/// been written is stored as its own object; holes are never materialized.
///
/// ```text
/// File (inode 6f1c...)
/// ├── Stripe 0:  bytes 0 - S        → 6f1c....0000000000000000
/// ├── Stripe 1:  bytes S - 2S       → 6f1c....0000000000000001
/// │   ...
/// └── Stripe N:  ...                → 6f1c....{N:016x}
/// ```
#[derive(Debug, Clone, Copy)]
pub struct StripeMapper {
    stripe_size: u64,
}

impl StripeMapper {
    /// Create a mapper; the stripe size must be positive
    pub fn new(stripe_size: u64) -> Result<Self> {
        if stripe_size == 0 {
            return Err(Error::invalid_argument("stripe size must be positive"));
        }
        Ok(Self { stripe_size })
    }

    pub const fn stripe_size(&self) -> u64 {
        self.stripe_size
    }

    /// Stripe holding the byte at `offset`
    pub const fn stripe_of(&self, offset: u64) -> StripeIndex {
        offset / self.stripe_size
    }

    /// File offset at which a stripe begins
    pub const fn stripe_start(&self, index: StripeIndex) -> u64 {
        index * self.stripe_size
    }

    /// Split `[start, start + length)` on stripe boundaries
    ///
    /// Fails with [`Error::InvalidArgument`] if the range ends past
    /// `u64::MAX`.
    pub fn byte_range_to_stripes(&self, start: u64, length: u64) -> Result<Vec<StripeRange>> {
        if length == 0 {
            return Ok(Vec::new());
        }

        let end = start.checked_add(length).ok_or_else(|| {
            Error::invalid_argument(format!("range {start}+{length} overflows the file offset"))
        })?;
        let first = self.stripe_of(start);
        let last = self.stripe_of(end - 1);

        Ok((first..=last)
            .map(|index| {
                let stripe_start = self.stripe_start(index);
                let stripe_end = stripe_start.saturating_add(self.stripe_size);

                // Intersection of [start, end) and [stripe_start, stripe_end)
                let range_start = start.max(stripe_start);
                let range_end = end.min(stripe_end);

                StripeRange {
                    index,
                    offset_in_stripe: range_start - stripe_start,
                    length: range_end - range_start,
                    file_offset: range_start,
                }
            })
            .collect())
    }

    /// Object prefix shared by all stripes of an inode
    pub fn object_prefix(inode: InodeId) -> String {
        format!("{inode}.")
    }

    /// Object name of one stripe
    pub fn stripe_object(inode: InodeId, index: StripeIndex) -> String {
        format!("{inode}.{index:016x}")
    }

    /// Stripe index encoded in an object name of `inode`
    pub fn parse_stripe_index(inode: InodeId, object: &str) -> Option<StripeIndex> {
        let suffix = object.strip_prefix(&Self::object_prefix(inode))?;
        if suffix.len() != 16 {
            return None;
        }
        u64::from_str_radix(suffix, 16).ok()
    }
}
