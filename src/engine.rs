//! Issuing planned subtasks to the device.
use std::sync::Arc;

use blkio::{AsyncBlockIo, BlockIo, Completion, Error, IoOutcome};
use bytes::BytesMut;
use parking_lot::MutexGuard;

use crate::buffer::{Buffers, OwnedBuf};
use crate::geometry::Geometry;
use crate::plan::{Op, Subtask, WorkingBuf};
use crate::task::{Registry, TaskId, Token};

/// The caller bytes covered by a blocking transfer.
#[derive(Debug)]
pub(crate) enum CallerBuf<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl CallerBuf<'_> {
    fn slice(&mut self, start: usize, len: usize) -> CallerBuf<'_> {
        match self {
            CallerBuf::Read(buf) => CallerBuf::Read(&mut buf[start..start + len]),
            CallerBuf::Write(buf) => CallerBuf::Write(&buf[start..start + len]),
        }
    }
}

/// The shared scratch buffer, acquired on first use and held until dropped.
pub(crate) struct Scratch<'a> {
    buffers: &'a Buffers,
    geo: &'a Geometry,
    guard: Option<MutexGuard<'a, BytesMut>>,
}

impl<'a> Scratch<'a> {
    pub fn new(buffers: &'a Buffers, geo: &'a Geometry) -> Self {
        Self {
            buffers,
            geo,
            guard: None,
        }
    }

    fn get(&mut self, len: usize) -> Result<&mut [u8], Error> {
        let guard = match &mut self.guard {
            Some(guard) => guard,
            slot @ None => slot.insert(self.buffers.acquire_scratch(self.geo)?),
        };
        Ok(&mut guard[..len])
    }
}

pub(crate) struct Engine<'a, D: ?Sized> {
    dev: &'a D,
    geo: &'a Geometry,
    media_id: u32,
    op: Op,
}

impl<'a, D: BlockIo + ?Sized> Engine<'a, D> {
    pub fn new(dev: &'a D, geo: &'a Geometry, media_id: u32, op: Op) -> Self {
        Self {
            dev,
            geo,
            media_id,
            op,
        }
    }

    /// Run every subtask with blocking device calls, in order, stopping at the first failure.
    pub fn execute(
        &self,
        subtasks: Vec<Subtask>,
        mut caller: CallerBuf<'_>,
        scratch: &mut Scratch<'_>,
    ) -> Result<(), Error> {
        let mut pos = 0;
        for mut st in subtasks {
            let part = caller.slice(pos, st.len);
            pos += st.len;
            if let Err(err) = self.run_blocking(&mut st, part, scratch) {
                tracing::debug!(kind = ?st.kind, lba = %st.lba, len = st.len, %err, "subtask failed");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Issue every subtask of an asynchronous request, tracked as one task in `registry`.
    ///
    /// `buf` is split into one part per subtask, and the parts are reassembled into the buffer
    /// handed back through `token` on success. Blocking subtasks are run inline and reported to
    /// the registry as they finish.
    ///
    /// An `Err` means the request failed before being handed to the device as a whole and
    /// `token` will not be signaled.
    pub fn submit(
        &self,
        subtasks: Vec<Subtask>,
        mut buf: BytesMut,
        registry: &Arc<Registry>,
        token: &Token,
        scratch: &mut Scratch<'_>,
    ) -> Result<(), Error> {
        let id = registry.register(token, subtasks.len());
        for (idx, mut st) in subtasks.into_iter().enumerate() {
            // Failed by an earlier completion. Nothing left worth issuing.
            if !registry.is_live(id) {
                return registry.fail_issue(id, idx, Error::Aborted);
            }

            let mut part = buf.split_to(st.len);
            let ret = if st.blocking {
                let caller = match self.op {
                    Op::Read => CallerBuf::Read(&mut part),
                    Op::Write => CallerBuf::Write(&part),
                };
                let ret = self.run_blocking(&mut st, caller, scratch);
                if ret.is_ok() {
                    registry.complete(id, idx, Ok(()), part);
                }
                ret
            } else {
                self.dispatch(st, part, registry, id, idx)
            };

            if let Err(err) = ret {
                tracing::debug!(task = id, subtask = idx, %err, "failed to issue subtask");
                return registry.fail_issue(id, idx, err);
            }
        }
        Ok(())
    }

    fn run_blocking(
        &self,
        st: &mut Subtask,
        caller: CallerBuf<'_>,
        scratch: &mut Scratch<'_>,
    ) -> Result<(), Error> {
        let (lba, media_id) = (st.lba, self.media_id);
        let xfer = st.transfer_len(self.geo.block_size);
        let range = st.offset as usize..st.offset as usize + st.len;
        let work = match &mut st.working {
            WorkingBuf::Direct => {
                return match caller {
                    CallerBuf::Read(buf) => self.dev.read_blocks(media_id, lba, buf),
                    CallerBuf::Write(buf) => self.dev.write_blocks(media_id, lba, buf),
                };
            }
            WorkingBuf::Scratch => scratch.get(xfer)?,
            WorkingBuf::Owned(owned) => &mut owned.buf[..xfer],
        };
        match caller {
            CallerBuf::Read(buf) => {
                self.dev.read_blocks(media_id, lba, work)?;
                buf.copy_from_slice(&work[range]);
            }
            CallerBuf::Write(buf) => {
                if st.pre_read {
                    self.dev.read_blocks(media_id, lba, work)?;
                }
                work[range].copy_from_slice(buf);
                self.dev.write_blocks(media_id, lba, work)?;
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        st: Subtask,
        mut part: BytesMut,
        registry: &Arc<Registry>,
        id: TaskId,
        idx: usize,
    ) -> Result<(), Error> {
        let aio: &dyn AsyncBlockIo = self.dev.async_io().ok_or(Error::Unsupported)?;
        let (lba, media_id) = (st.lba, self.media_id);
        let xfer = st.transfer_len(self.geo.block_size);
        let range = st.offset as usize..st.offset as usize + st.len;
        let registry = Arc::clone(registry);

        let OwnedBuf { mut buf, lease } = match st.working {
            WorkingBuf::Direct => {
                let done: Completion = Box::new(move |out: IoOutcome| {
                    registry.complete(id, idx, out.status, out.buf);
                });
                return match self.op {
                    Op::Read => aio.read_blocks_ex(media_id, lba, part, done),
                    Op::Write => aio.write_blocks_ex(media_id, lba, part, done),
                };
            }
            WorkingBuf::Owned(owned) => owned,
            WorkingBuf::Scratch => unreachable!("scratch subtasks are blocking"),
        };
        buf.truncate(xfer);

        match self.op {
            Op::Read => {
                let done: Completion = Box::new(move |out: IoOutcome| {
                    drop(lease);
                    let status = out.status.and_then(|()| {
                        let src = out.buf.get(range).ok_or(Error::DeviceError)?;
                        part.copy_from_slice(src);
                        Ok(())
                    });
                    registry.complete(id, idx, status, part);
                });
                aio.read_blocks_ex(media_id, lba, buf, done)
            }
            Op::Write => {
                if st.pre_read {
                    self.dev.read_blocks(media_id, lba, &mut buf)?;
                }
                buf[range].copy_from_slice(&part);
                let done: Completion = Box::new(move |out: IoOutcome| {
                    drop((lease, out.buf));
                    registry.complete(id, idx, out.status, part);
                });
                aio.write_blocks_ex(media_id, lba, buf, done)
            }
        }
    }
}
