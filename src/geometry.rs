//! Per-request snapshot of the device media.
use blkio::{BlockIo, Error, Lba, Media};

use crate::plan::Op;

/// Media geometry, re-read from the device at the start of every request since removable media
/// may be swapped at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    /// Buffer alignment requirement. 0 and 1 mean none.
    pub io_align: u32,
    pub total_blocks: u64,
    pub media_id: u32,
    pub read_only: bool,
    pub present: bool,
}

impl From<Media> for Geometry {
    fn from(media: Media) -> Self {
        Self {
            block_size: media.block_size,
            io_align: media.io_align,
            total_blocks: media.total_blocks(),
            media_id: media.media_id,
            read_only: media.is_read_only(),
            present: media.is_present(),
        }
    }
}

impl Geometry {
    pub fn resolve<D: BlockIo + ?Sized>(dev: &D) -> Self {
        dev.media().into()
    }

    /// Media size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        Lba(self.total_blocks).bytes(self.block_size)
    }

    /// Check the media state against a request.
    ///
    /// The order is fixed: absent media, then a stale media id, then write protection.
    pub fn validate(&self, media_id: u32, op: Op) -> Result<(), Error> {
        if !self.present {
            return Err(Error::NoMedia);
        }
        if self.media_id != media_id {
            tracing::debug!(expect = self.media_id, got = media_id, "media changed");
            return Err(Error::MediaChanged);
        }
        if op == Op::Write && self.read_only {
            return Err(Error::WriteProtected);
        }
        if self.block_size == 0 {
            tracing::error!("device reports zero block size");
            return Err(Error::DeviceError);
        }
        Ok(())
    }

    /// Check that `[offset, offset + len)` lies inside the media.
    ///
    /// Zero-length requests are always in range, even past the end.
    pub fn check_range(&self, offset: u64, len: usize) -> Result<(), Error> {
        if len == 0 {
            return Ok(());
        }
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size() => Ok(()),
            _ => {
                tracing::debug!(offset, len, size = self.size(), "request out of range");
                Err(Error::InvalidParameter)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use blkio::MediaAttrs;

    use super::*;

    fn geo() -> Geometry {
        Media {
            media_id: 3,
            attrs: MediaAttrs::Present | MediaAttrs::Removable,
            block_size: 512,
            io_align: 4,
            last_block: Lba(9),
        }
        .into()
    }

    #[test]
    fn from_media() {
        let g = geo();
        assert_eq!(g.total_blocks, 10);
        assert_eq!(g.size(), 5120);
        assert!(g.present);
        assert!(!g.read_only);
    }

    #[test]
    fn validate_order() {
        let g = Geometry {
            present: false,
            read_only: true,
            ..geo()
        };
        // Absent media wins over everything.
        assert_eq!(g.validate(4, Op::Write), Err(Error::NoMedia));

        let g = Geometry {
            read_only: true,
            ..geo()
        };
        assert_eq!(g.validate(4, Op::Write), Err(Error::MediaChanged));
        assert_eq!(g.validate(3, Op::Write), Err(Error::WriteProtected));
        assert_eq!(g.validate(3, Op::Read), Ok(()));
    }

    #[test]
    fn range() {
        let g = geo();
        assert_eq!(g.check_range(0, 5120), Ok(()));
        assert_eq!(g.check_range(5119, 1), Ok(()));
        assert_eq!(g.check_range(5119, 2), Err(Error::InvalidParameter));
        assert_eq!(g.check_range(u64::MAX, 1), Err(Error::InvalidParameter));
        assert_eq!(g.check_range(1 << 40, 0), Ok(()));
    }
}
