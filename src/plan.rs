//! Splitting a byte-range request into block-aligned subtasks.
use blkio::{Error, Lba};

use crate::buffer::{Buffers, OwnedBuf};
use crate::geometry::Geometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskKind {
    /// Partial leading block.
    UnderRun,
    /// Whole blocks.
    Middle,
    /// Partial trailing block.
    OverRun,
}

/// Where a subtask's device transfer lands.
#[derive(Debug)]
pub enum WorkingBuf {
    /// Directly in the caller buffer.
    Direct,
    /// In the shared scratch buffer. Only valid for blocking subtasks.
    Scratch,
    /// In a buffer owned by the subtask until its completion.
    Owned(OwnedBuf),
}

/// One device transfer, covering a contiguous part of a request.
#[derive(Debug)]
pub struct Subtask {
    pub kind: SubtaskKind,
    pub lba: Lba,
    /// Offset of the covered bytes inside the first block. Only non-zero for `UnderRun`.
    pub offset: u32,
    /// Covered bytes of the caller buffer.
    pub len: usize,
    pub blocking: bool,
    /// The working buffer must be filled from the device before caller data is merged in.
    pub pre_read: bool,
    pub working: WorkingBuf,
}

impl Subtask {
    /// Bytes exchanged with the device.
    #[must_use]
    pub fn transfer_len(&self, block_size: u32) -> usize {
        match self.working {
            WorkingBuf::Direct => self.len,
            WorkingBuf::Scratch | WorkingBuf::Owned(_) => {
                (self.offset as usize + self.len).next_multiple_of(block_size as usize)
            }
        }
    }

    /// Byte address of the first covered byte on the media.
    #[must_use]
    pub fn byte_offset(&self, block_size: u32) -> u64 {
        self.lba.bytes(block_size) + u64::from(self.offset)
    }
}

/// Split `[offset, offset + len)` into subtasks in byte order.
///
/// `buf` is the address of the caller buffer, only used to decide whether the whole-block middle
/// region can be transferred in place. Blocking requests use the shared scratch buffer for
/// partial and misaligned blocks. Non-blocking requests allocate owned buffers instead, and fall
/// back to blocking scratch chunks for the middle region when the allocation fails.
///
/// The range must have been checked against the geometry.
pub fn plan(
    geo: &Geometry,
    op: Op,
    offset: u64,
    len: usize,
    buf: *const u8,
    blocking: bool,
    buffers: &Buffers,
) -> Result<Vec<Subtask>, Error> {
    let mut planner = Planner {
        geo,
        op,
        blocking,
        buffers,
        out: Vec::new(),
    };
    let bs = geo.block_size as usize;
    let (mut lba, head) = Lba::from_bytes(offset, geo.block_size);

    if len == 0 {
        planner.push(SubtaskKind::Middle, lba, head, 0, false, WorkingBuf::Direct);
        return Ok(planner.out);
    }

    let mut rest = len;
    if head != 0 {
        let n = rest.min(bs - head as usize);
        planner.edge(SubtaskKind::UnderRun, lba, head, n)?;
        lba += 1;
        rest -= n;
    }

    let tail = rest % bs;
    let middle = rest - tail;
    if middle != 0 {
        let pos = len - rest;
        planner.middle(lba, middle, buf.wrapping_add(pos));
        lba += (middle / bs) as u64;
    }

    if tail != 0 {
        planner.edge(SubtaskKind::OverRun, lba, 0, tail)?;
    }
    Ok(planner.out)
}

struct Planner<'a> {
    geo: &'a Geometry,
    op: Op,
    blocking: bool,
    buffers: &'a Buffers,
    out: Vec<Subtask>,
}

impl Planner<'_> {
    fn push(
        &mut self,
        kind: SubtaskKind,
        lba: Lba,
        offset: u32,
        len: usize,
        blocking: bool,
        working: WorkingBuf,
    ) {
        let pre_read = self.op == Op::Write && kind != SubtaskKind::Middle;
        self.out.push(Subtask {
            kind,
            lba,
            offset,
            len,
            blocking: blocking || self.blocking,
            pre_read,
            working,
        });
    }

    fn edge(&mut self, kind: SubtaskKind, lba: Lba, offset: u32, len: usize) -> Result<(), Error> {
        let working = if self.blocking {
            WorkingBuf::Scratch
        } else {
            let owned = self
                .buffers
                .allocate(self.geo.block_size as usize, self.geo.io_align)?;
            WorkingBuf::Owned(owned)
        };
        self.push(kind, lba, offset, len, false, working);
        Ok(())
    }

    fn middle(&mut self, mut lba: Lba, len: usize, ptr: *const u8) {
        if blkio::is_aligned(ptr, self.geo.io_align) {
            self.push(SubtaskKind::Middle, lba, 0, len, false, WorkingBuf::Direct);
            return;
        }

        if !self.blocking {
            match self.buffers.allocate(len, self.geo.io_align) {
                Ok(owned) => {
                    let working = WorkingBuf::Owned(owned);
                    self.push(SubtaskKind::Middle, lba, 0, len, false, working);
                    return;
                }
                Err(err) => {
                    tracing::debug!(%lba, len, %err, "falling back to blocking scratch chunks");
                }
            }
        }

        let bs = self.geo.block_size as usize;
        let chunk = self.buffers.scratch_blocks() as usize * bs;
        let mut rest = len;
        while rest != 0 {
            let n = rest.min(chunk);
            self.push(SubtaskKind::Middle, lba, 0, n, true, WorkingBuf::Scratch);
            lba += (n / bs) as u64;
            rest -= n;
        }
    }
}
