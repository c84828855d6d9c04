//! Capability contract of a block device that only transfers whole, aligned blocks.
//!
//! Implementors expose a [`Media`] snapshot and blocking transfer primitives through
//! [`BlockIo`], and optionally non-blocking primitives through [`AsyncBlockIo`].
mod block_io;

use std::{fmt, ops};

pub use block_io::*;

/// Logical block address, in unit of the device block size.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lba(pub u64);

impl fmt::Display for Lba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        "#".fmt(f)?;
        self.0.fmt(f)
    }
}

impl Lba {
    /// Split a byte offset into the block holding it and the offset inside that block.
    #[must_use]
    pub const fn from_bytes(offset: u64, block_size: u32) -> (Self, u32) {
        let bs = block_size as u64;
        (Self(offset / bs), (offset % bs) as u32)
    }

    #[must_use]
    pub const fn bytes(self, block_size: u32) -> u64 {
        match self.0.checked_mul(block_size as u64) {
            Some(bytes) => bytes,
            None => panic!("overflow"),
        }
    }
}

impl ops::Add<u64> for Lba {
    type Output = Lba;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl ops::AddAssign<u64> for Lba {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl ops::Sub for Lba {
    type Output = u64;

    fn sub(self, rhs: Lba) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Whether `ptr` satisfies the device alignment `io_align`.
///
/// An alignment of 0 or 1 means there is no requirement.
#[must_use]
pub fn is_aligned(ptr: *const u8, io_align: u32) -> bool {
    io_align < 2 || (ptr as usize) % io_align as usize == 0
}
