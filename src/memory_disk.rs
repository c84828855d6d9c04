use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use blkio::{AsyncBlockIo, BlockIo, Completion, Error, IoOutcome, Lba, Media, MediaAttrs};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// When completions of non-blocking transfers are delivered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Before the submitting call returns.
    #[default]
    Inline,
    /// Only when explicitly released by [`MemoryDisk::complete_next`] and friends.
    Queued,
    /// From a spawned tokio task. Submission must happen inside a tokio runtime.
    Spawn,
}

/// A sparse RAM-backed block device with removable media and fault injection.
///
/// Transfers are performed at submission. Only the completion is deferred according to the
/// [`Delivery`] mode.
#[derive(Debug, Clone)]
pub struct MemoryDisk(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    media: Mutex<Media>,
    blocks: RwLock<HashMap<u64, Bytes>>,
    faults: Mutex<BTreeSet<u64>>,
    delivery: Mutex<Delivery>,
    queue: Mutex<VecDeque<Pending>>,
    async_capable: bool,
}

struct Pending {
    outcome: IoOutcome,
    done: Completion,
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

impl MemoryDisk {
    /// A zero-filled disk supporting non-blocking transfers.
    pub fn new(block_size: u32, io_align: u32, total_blocks: u64) -> Self {
        Self::build(block_size, io_align, total_blocks, true)
    }

    /// A zero-filled disk with blocking transfers only.
    pub fn new_blocking(block_size: u32, io_align: u32, total_blocks: u64) -> Self {
        Self::build(block_size, io_align, total_blocks, false)
    }

    fn build(block_size: u32, io_align: u32, total_blocks: u64, async_capable: bool) -> Self {
        assert!(block_size.is_power_of_two() && total_blocks != 0);
        let media = Media {
            media_id: 1,
            attrs: MediaAttrs::Present | MediaAttrs::Removable,
            block_size,
            io_align,
            last_block: Lba(total_blocks - 1),
        };
        Self(Arc::new(Inner {
            media: Mutex::new(media),
            blocks: RwLock::default(),
            faults: Mutex::default(),
            delivery: Mutex::default(),
            queue: Mutex::default(),
            async_capable,
        }))
    }

    pub fn set_delivery(&self, delivery: Delivery) {
        *self.0.delivery.lock() = delivery;
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.0.media.lock().attrs.set(MediaAttrs::ReadOnly, read_only);
    }

    pub fn remove_media(&self) {
        self.0.media.lock().attrs.remove(MediaAttrs::Present);
    }

    /// Insert a blank media with a new media id.
    pub fn insert_media(&self) {
        let mut media = self.0.media.lock();
        media.attrs.insert(MediaAttrs::Present);
        media.media_id = media.media_id.wrapping_add(1);
        self.0.blocks.write().clear();
        tracing::debug!(media_id = media.media_id, "media inserted");
    }

    /// Fail every later transfer touching `lba` with [`Error::DeviceError`].
    pub fn inject_fault(&self, lba: Lba) {
        self.0.faults.lock().insert(lba.0);
    }

    pub fn clear_faults(&self) {
        self.0.faults.lock().clear();
    }

    /// Copy media content at byte `offset` without any checks.
    pub fn peek(&self, offset: u64, len: usize) -> Vec<u8> {
        let bs = u64::from(self.0.media.lock().block_size);
        let blocks = self.0.blocks.read();
        (offset..offset + len as u64)
            .map(|pos| {
                blocks
                    .get(&(pos / bs))
                    .map_or(0, |data| data[(pos % bs) as usize])
            })
            .collect()
    }

    /// Overwrite media content at byte `offset` without any checks.
    pub fn poke(&self, offset: u64, data: &[u8]) {
        let bs = self.0.media.lock().block_size as usize;
        let mut blocks = self.0.blocks.write();
        for (pos, &b) in (offset..).zip(data) {
            let (lba, off) = Lba::from_bytes(pos, bs as u32);
            let block = blocks
                .entry(lba.0)
                .or_insert_with(|| Bytes::from(vec![0u8; bs]));
            let mut owned = BytesMut::from(&block[..]);
            owned[off as usize] = b;
            *block = owned.freeze();
        }
    }

    /// Number of queued completions.
    pub fn queued(&self) -> usize {
        self.0.queue.lock().len()
    }

    /// Deliver the oldest queued completion.
    pub fn complete_next(&self) -> bool {
        let Some(p) = self.0.queue.lock().pop_front() else {
            return false;
        };
        (p.done)(p.outcome);
        true
    }

    /// Deliver the newest queued completion.
    pub fn complete_last(&self) -> bool {
        let Some(p) = self.0.queue.lock().pop_back() else {
            return false;
        };
        (p.done)(p.outcome);
        true
    }

    /// Deliver every queued completion in submission order.
    pub fn complete_all(&self) -> usize {
        let mut cnt = 0;
        while self.complete_next() {
            cnt += 1;
        }
        cnt
    }

    /// Check a transfer that is about to be submitted.
    fn check(&self, media_id: u32, lba: Lba, buf: &[u8], write: bool) -> Result<Media, Error> {
        let media = *self.0.media.lock();
        if !media.is_present() {
            return Err(Error::NoMedia);
        }
        if media.media_id != media_id {
            return Err(Error::MediaChanged);
        }
        if write && media.is_read_only() {
            return Err(Error::WriteProtected);
        }
        if buf.is_empty() {
            return Ok(media);
        }
        let bs = media.block_size as usize;
        if buf.len() % bs != 0 || !blkio::is_aligned(buf.as_ptr(), media.io_align) {
            tracing::error!(%lba, len = buf.len(), "malformed transfer buffer");
            return Err(Error::InvalidParameter);
        }
        let end = lba.0.checked_add((buf.len() / bs) as u64);
        if end.map_or(true, |end| end > media.total_blocks()) {
            tracing::error!(%lba, len = buf.len(), "transfer out of range");
            return Err(Error::InvalidParameter);
        }
        Ok(media)
    }

    fn faulted(&self, lba: Lba, len: usize, block_size: u32) -> Result<(), Error> {
        let end = lba.0 + (len / block_size as usize) as u64;
        match self.0.faults.lock().range(lba.0..end).next() {
            Some(&bad) => {
                tracing::debug!(lba = %Lba(bad), "injected fault");
                Err(Error::DeviceError)
            }
            None => Ok(()),
        }
    }

    fn do_read(&self, lba: Lba, buf: &mut [u8], block_size: u32) -> Result<(), Error> {
        self.faulted(lba, buf.len(), block_size)?;
        let blocks = self.0.blocks.read();
        for (i, chunk) in buf.chunks_exact_mut(block_size as usize).enumerate() {
            match blocks.get(&(lba.0 + i as u64)) {
                Some(data) => chunk.copy_from_slice(data),
                None => chunk.fill(0),
            }
        }
        Ok(())
    }

    fn do_write(&self, lba: Lba, buf: &[u8], block_size: u32) -> Result<(), Error> {
        self.faulted(lba, buf.len(), block_size)?;
        let mut blocks = self.0.blocks.write();
        for (i, chunk) in buf.chunks_exact(block_size as usize).enumerate() {
            blocks.insert(lba.0 + i as u64, Bytes::copy_from_slice(chunk));
        }
        Ok(())
    }

    fn deliver(&self, outcome: IoOutcome, done: Completion) {
        let delivery = *self.0.delivery.lock();
        match delivery {
            Delivery::Inline => done(outcome),
            Delivery::Queued => self.0.queue.lock().push_back(Pending { outcome, done }),
            Delivery::Spawn => {
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    done(outcome);
                });
            }
        }
    }
}

impl BlockIo for MemoryDisk {
    fn media(&self) -> Media {
        *self.0.media.lock()
    }

    /// Abort every queued completion.
    fn reset(&self, _extended_verification: bool) -> Result<(), Error> {
        let aborted = std::mem::take(&mut *self.0.queue.lock());
        if !aborted.is_empty() {
            tracing::debug!(cnt = aborted.len(), "aborting queued completions");
        }
        for p in aborted {
            (p.done)(IoOutcome {
                status: Err(Error::Aborted),
                buf: p.outcome.buf,
            });
        }
        Ok(())
    }

    fn read_blocks(&self, media_id: u32, lba: Lba, buf: &mut [u8]) -> Result<(), Error> {
        let media = self.check(media_id, lba, buf, false)?;
        self.do_read(lba, buf, media.block_size)
    }

    fn write_blocks(&self, media_id: u32, lba: Lba, buf: &[u8]) -> Result<(), Error> {
        let media = self.check(media_id, lba, buf, true)?;
        self.do_write(lba, buf, media.block_size)
    }

    fn async_io(&self) -> Option<&dyn AsyncBlockIo> {
        self.0.async_capable.then_some(self as &dyn AsyncBlockIo)
    }
}

/// Media and parameter errors are reported at submission. Transfer faults are reported through
/// the completion.
impl AsyncBlockIo for MemoryDisk {
    fn read_blocks_ex(
        &self,
        media_id: u32,
        lba: Lba,
        mut buf: BytesMut,
        done: Completion,
    ) -> Result<(), Error> {
        let media = self.check(media_id, lba, &buf, false)?;
        let status = self.do_read(lba, &mut buf, media.block_size);
        self.deliver(IoOutcome { status, buf }, done);
        Ok(())
    }

    fn write_blocks_ex(
        &self,
        media_id: u32,
        lba: Lba,
        buf: BytesMut,
        done: Completion,
    ) -> Result<(), Error> {
        let media = self.check(media_id, lba, &buf, true)?;
        let status = self.do_write(lba, &buf, media.block_size);
        self.deliver(IoOutcome { status, buf }, done);
        Ok(())
    }

    fn flush_blocks_ex(&self, done: Completion) -> Result<(), Error> {
        let outcome = IoOutcome {
            status: Ok(()),
            buf: BytesMut::new(),
        };
        self.deliver(outcome, done);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_blocks() {
        let disk = MemoryDisk::new(512, 4, 8);
        let mut buf = vec![0xFFu8; 1024];
        disk.read_blocks(1, Lba(2), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        disk.poke(1000, &[1, 2, 3]);
        assert_eq!(disk.peek(999, 5), [0, 1, 2, 3, 0]);
        disk.read_blocks(1, Lba(1), &mut buf[..512]).unwrap();
        assert_eq!(buf[488..491], [1, 2, 3]);
    }

    #[test]
    fn transfer_checks() {
        let disk = MemoryDisk::new(512, 0, 4);
        let mut buf = vec![0u8; 1024];
        assert_eq!(
            disk.read_blocks(1, Lba(3), &mut buf),
            Err(Error::InvalidParameter),
        );
        assert_eq!(
            disk.read_blocks(1, Lba(0), &mut buf[..100]),
            Err(Error::InvalidParameter),
        );
        assert_eq!(disk.read_blocks(2, Lba(0), &mut buf), Err(Error::MediaChanged));
        // Zero-length transfers only check the media.
        assert_eq!(disk.read_blocks(1, Lba(100), &mut []), Ok(()));

        disk.set_read_only(true);
        assert_eq!(disk.write_blocks(1, Lba(0), &buf), Err(Error::WriteProtected));
        disk.remove_media();
        assert_eq!(disk.read_blocks(1, Lba(0), &mut []), Err(Error::NoMedia));
        disk.insert_media();
        assert_eq!(disk.media().media_id, 2);
    }

    #[test]
    fn faults() {
        let disk = MemoryDisk::new(512, 0, 4);
        disk.inject_fault(Lba(2));
        let buf = vec![1u8; 512];
        assert_eq!(disk.write_blocks(1, Lba(1), &buf), Ok(()));
        let buf = vec![1u8; 1024];
        assert_eq!(disk.write_blocks(1, Lba(1), &buf), Err(Error::DeviceError));
        disk.clear_faults();
        assert_eq!(disk.write_blocks(1, Lba(1), &buf), Ok(()));
    }

    #[test]
    fn queued_delivery_and_reset() {
        let disk = MemoryDisk::new(512, 0, 4);
        disk.set_delivery(Delivery::Queued);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for lba in 0..3 {
            let seen = seen.clone();
            let buf = BytesMut::zeroed(512);
            let done: Completion = Box::new(move |out| seen.lock().push((lba, out.status)));
            disk.read_blocks_ex(1, Lba(lba), buf, done).unwrap();
        }
        assert_eq!(disk.queued(), 3);
        assert!(disk.complete_last());
        assert!(disk.complete_next());
        disk.reset(false).unwrap();
        assert_eq!(disk.queued(), 0);
        assert_eq!(
            *seen.lock(),
            [(2, Ok(())), (0, Ok(())), (1, Err(Error::Aborted))],
        );
    }
}
