use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;

use crate::Lba;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MediaAttrs: u32 {
        const Present = 1 << 0;
        const Removable = 1 << 1;
        const ReadOnly = 1 << 2;
        const WriteCaching = 1 << 3;
    }
}

/// Status of a failed device or translation-layer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    #[error("no media in device")]
    NoMedia,
    #[error("media changed")]
    MediaChanged,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("out of resources")]
    OutOfResources,
    #[error("device error")]
    DeviceError,
    #[error("media is write protected")]
    WriteProtected,
    #[error("operation aborted")]
    Aborted,
    #[error("operation not supported")]
    Unsupported,
}

/// A snapshot of the media currently in the device.
///
/// Every field may change between two snapshots when removable media is swapped, in which case
/// `media_id` changes too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Media {
    pub media_id: u32,
    pub attrs: MediaAttrs,
    /// Transfer granularity in bytes.
    pub block_size: u32,
    /// Required alignment of transfer buffers. 0 and 1 mean no requirement.
    pub io_align: u32,
    pub last_block: Lba,
}

impl Media {
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.attrs.contains(MediaAttrs::Present)
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.attrs.contains(MediaAttrs::ReadOnly)
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.last_block.0 + 1
    }

    /// Media size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        Lba(self.total_blocks()).bytes(self.block_size)
    }
}

/// The result of a non-blocking transfer, handing the transfer buffer back to its owner.
pub struct IoOutcome {
    pub status: Result<(), Error>,
    pub buf: BytesMut,
}

impl fmt::Debug for IoOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoOutcome")
            .field("status", &self.status)
            .field("buf", &format_args!("<{} bytes>", self.buf.len()))
            .finish()
    }
}

/// Callback invoked exactly once when a non-blocking transfer finishes.
///
/// It may be invoked before the submitting call returns.
pub type Completion = Box<dyn FnOnce(IoOutcome) + Send + 'static>;

/// Blocking block transfer primitives.
///
/// All transfer buffers must be aligned to [`Media::io_align`] and have a length of a multiple
/// of [`Media::block_size`]. A zero-length transfer performs the media checks only.
pub trait BlockIo: Send + Sync {
    fn media(&self) -> Media;

    /// Reset the device, draining or aborting every in-flight transfer.
    fn reset(&self, _extended_verification: bool) -> Result<(), Error> {
        Ok(())
    }

    fn read_blocks(&self, media_id: u32, lba: Lba, buf: &mut [u8]) -> Result<(), Error>;

    fn write_blocks(&self, media_id: u32, lba: Lba, buf: &[u8]) -> Result<(), Error>;

    fn flush_blocks(&self) -> Result<(), Error> {
        Ok(())
    }

    /// The optional non-blocking capability of this device.
    fn async_io(&self) -> Option<&dyn AsyncBlockIo> {
        None
    }
}

/// Non-blocking block transfer primitives.
///
/// Buffers are moved into the device and handed back through the [`Completion`]. If submission
/// fails synchronously, the callback is dropped without being called.
pub trait AsyncBlockIo: Send + Sync {
    fn read_blocks_ex(
        &self,
        media_id: u32,
        lba: Lba,
        buf: BytesMut,
        done: Completion,
    ) -> Result<(), Error>;

    fn write_blocks_ex(
        &self,
        media_id: u32,
        lba: Lba,
        buf: BytesMut,
        done: Completion,
    ) -> Result<(), Error>;

    fn flush_blocks_ex(&self, done: Completion) -> Result<(), Error>;
}

impl<T: BlockIo + ?Sized> BlockIo for Arc<T> {
    fn media(&self) -> Media {
        (**self).media()
    }

    fn reset(&self, extended_verification: bool) -> Result<(), Error> {
        (**self).reset(extended_verification)
    }

    fn read_blocks(&self, media_id: u32, lba: Lba, buf: &mut [u8]) -> Result<(), Error> {
        (**self).read_blocks(media_id, lba, buf)
    }

    fn write_blocks(&self, media_id: u32, lba: Lba, buf: &[u8]) -> Result<(), Error> {
        (**self).write_blocks(media_id, lba, buf)
    }

    fn flush_blocks(&self) -> Result<(), Error> {
        (**self).flush_blocks()
    }

    fn async_io(&self) -> Option<&dyn AsyncBlockIo> {
        (**self).async_io()
    }
}
