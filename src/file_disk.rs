use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use blkio::{BlockIo, Error, Lba, Media, MediaAttrs};

/// A blocking-only block device backed by a regular file.
#[derive(Debug)]
pub struct FileDisk {
    file: File,
    media: Media,
}

impl FileDisk {
    pub fn open(path: &Path, block_size: u32, read_only: bool) -> Result<Self> {
        ensure!(
            block_size.is_power_of_two(),
            "block size must be a power of two, got {block_size}",
        );
        let file = File::options()
            .read(true)
            .write(!read_only)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let size = file
            .metadata()
            .context("failed to query image size")?
            .len();
        ensure!(
            size != 0 && size % u64::from(block_size) == 0,
            "image size {size} is not a non-zero multiple of block size {block_size}",
        );

        let mut attrs = MediaAttrs::Present | MediaAttrs::WriteCaching;
        attrs.set(MediaAttrs::ReadOnly, read_only);
        let media = Media {
            media_id: 0,
            attrs,
            block_size,
            io_align: 0,
            last_block: Lba(size / u64::from(block_size) - 1),
        };
        Ok(Self { file, media })
    }

    fn check(&self, media_id: u32, lba: Lba, len: usize) -> Result<u64, Error> {
        if media_id != self.media.media_id {
            return Err(Error::MediaChanged);
        }
        let bs = self.media.block_size as usize;
        let blocks = (len / bs) as u64;
        if len % bs != 0 || lba.0.saturating_add(blocks) > self.media.total_blocks() {
            return Err(Error::InvalidParameter);
        }
        Ok(lba.bytes(self.media.block_size))
    }
}

fn convert_err(lba: Lba, err: &io::Error) -> Error {
    tracing::error!(%lba, %err, "image I/O failed");
    Error::DeviceError
}

impl BlockIo for FileDisk {
    fn media(&self) -> Media {
        self.media
    }

    fn read_blocks(&self, media_id: u32, lba: Lba, buf: &mut [u8]) -> Result<(), Error> {
        let off = self.check(media_id, lba, buf.len())?;
        self.file
            .read_exact_at(buf, off)
            .map_err(|err| convert_err(lba, &err))
    }

    fn write_blocks(&self, media_id: u32, lba: Lba, buf: &[u8]) -> Result<(), Error> {
        let off = self.check(media_id, lba, buf.len())?;
        if self.media.is_read_only() {
            return Err(Error::WriteProtected);
        }
        self.file
            .write_all_at(buf, off)
            .map_err(|err| convert_err(lba, &err))
    }

    fn flush_blocks(&self) -> Result<(), Error> {
        self.file
            .sync_data()
            .map_err(|err| convert_err(Lba(0), &err))
    }
}
