//! Aligned transfer buffers: the shared scratch buffer and per-subtask owned buffers.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use blkio::Error;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};

use crate::geometry::Geometry;

/// Allocate a zeroed buffer of `len` bytes whose start satisfies `align`.
///
/// Allocation failure is reported as [`Error::OutOfResources`] instead of aborting.
pub fn alloc_aligned(len: usize, align: u32) -> Result<BytesMut, Error> {
    let align = (align as usize).max(1);
    let cap = len.checked_add(align - 1).ok_or(Error::OutOfResources)?;
    let mut raw = Vec::new();
    raw.try_reserve_exact(cap)
        .map_err(|_| Error::OutOfResources)?;
    raw.resize(cap, 0u8);
    let mut buf = Bytes::from(raw)
        .try_into_mut()
        .unwrap_or_else(|shared| BytesMut::from(&shared[..]));
    // Pad against the final address, the conversion above may have moved the data.
    let pad = (align - buf.as_ptr() as usize % align) % align;
    buf.advance(pad);
    buf.truncate(len);
    Ok(buf)
}

/// Outstanding bytes of owned buffers, checked against an optional limit.
#[derive(Debug)]
struct Budget {
    limit: Option<usize>,
    used: AtomicUsize,
}

/// A reservation against the owned-buffer budget, returned on drop.
#[derive(Debug)]
pub struct Lease {
    budget: Arc<Budget>,
    len: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.budget.used.fetch_sub(self.len, Ordering::Release);
    }
}

/// A working buffer owned by exactly one subtask until its completion.
#[derive(Debug)]
pub struct OwnedBuf {
    pub buf: BytesMut,
    pub lease: Lease,
}

#[derive(Debug)]
pub struct Buffers {
    scratch: Mutex<BytesMut>,
    scratch_blocks: u32,
    budget: Arc<Budget>,
}

impl Buffers {
    /// Create the buffer pool, sizing the scratch buffer for `geo`.
    pub fn new(scratch_blocks: u32, limit: Option<usize>, geo: &Geometry) -> Result<Self, Error> {
        assert_ne!(scratch_blocks, 0);
        let len = scratch_len(scratch_blocks, geo)?;
        let scratch = alloc_aligned(len, geo.io_align)?;
        Ok(Self {
            scratch: Mutex::new(scratch),
            scratch_blocks,
            budget: Arc::new(Budget {
                limit,
                used: AtomicUsize::new(0),
            }),
        })
    }

    /// Capacity of the scratch buffer in blocks.
    #[must_use]
    pub fn scratch_blocks(&self) -> u32 {
        self.scratch_blocks
    }

    /// Bytes currently held by owned buffers.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.budget.used.load(Ordering::Acquire)
    }

    /// Exclusively acquire the scratch buffer, re-allocating it if the media geometry outgrew it.
    ///
    /// The returned buffer holds at least `scratch_blocks` blocks and is aligned for `geo`.
    pub fn acquire_scratch(&self, geo: &Geometry) -> Result<MutexGuard<'_, BytesMut>, Error> {
        let len = scratch_len(self.scratch_blocks, geo)?;
        let mut guard = self.scratch.lock();
        if guard.len() < len || !blkio::is_aligned(guard.as_ptr(), geo.io_align) {
            tracing::debug!(
                old_len = guard.len(),
                len,
                io_align = geo.io_align,
                "re-allocating scratch buffer",
            );
            *guard = alloc_aligned(len, geo.io_align)?;
        }
        Ok(guard)
    }

    /// Allocate an owned zeroed buffer, charged against the budget until dropped.
    pub fn allocate(&self, len: usize, align: u32) -> Result<OwnedBuf, Error> {
        let limit = self.budget.limit.unwrap_or(usize::MAX);
        self.budget
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(len).filter(|&n| n <= limit)
            })
            .map_err(|used| {
                tracing::trace!(len, used, limit, "owned buffer budget exhausted");
                Error::OutOfResources
            })?;
        let lease = Lease {
            budget: self.budget.clone(),
            len,
        };
        let buf = alloc_aligned(len, align)?;
        Ok(OwnedBuf { buf, lease })
    }
}

fn scratch_len(scratch_blocks: u32, geo: &Geometry) -> Result<usize, Error> {
    (scratch_blocks as usize)
        .checked_mul(geo.block_size as usize)
        .ok_or(Error::OutOfResources)
}
