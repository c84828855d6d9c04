use std::fs;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use diskio::blkio::{BlockIo, Error};
use diskio::file_disk::FileDisk;
use diskio::memory_disk::{Delivery, MemoryDisk};
use diskio::{Config, DiskIo, Token};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A scratch image file removed on drop.
struct Image(PathBuf);

impl Image {
    fn new(name: &str, len: usize) -> Self {
        let path = std::env::temp_dir().join(format!("diskio-{}-{name}.img", std::process::id()));
        fs::write(&path, vec![0u8; len]).unwrap();
        Self(path)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

#[test]
fn file_disk_round_trip() {
    const SIZE: usize = 64 << 10;
    let img = Image::new("round-trip", SIZE);
    let dev = FileDisk::open(img.path(), 512, false).unwrap();
    assert!(dev.async_io().is_none());
    let disk = DiskIo::new(Config::default(), dev).unwrap();
    let media_id = disk.geometry().media_id;

    let mut shadow = vec![0u8; SIZE];
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..200 {
        let len = rng.random_range(0..4096);
        let start = rng.random_range(0..=SIZE - len);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        shadow[start..start + len].copy_from_slice(&data);
        disk.write(media_id, start as u64, &data).unwrap();
    }
    disk.flush().unwrap();
    assert_eq!(fs::read(img.path()).unwrap(), shadow);

    // Downgraded to blocking transfers, signaled before returning.
    let token = Token::new();
    disk.read_async(media_id, 1000, BytesMut::zeroed(3000), &token)
        .unwrap();
    assert_eq!(token.try_take().unwrap().unwrap(), shadow[1000..4000]);

    disk.flush_async(&token).unwrap();
    assert!(token.try_take().unwrap().unwrap().is_empty());
}

#[test]
fn file_disk_read_only() {
    let img = Image::new("read-only", 4096);
    fs::write(img.path(), [0x5Au8; 4096]).unwrap();
    let disk = DiskIo::new(
        Config::default(),
        FileDisk::open(img.path(), 1024, true).unwrap(),
    )
    .unwrap();
    let geo = disk.geometry();
    assert!(geo.read_only);
    assert_eq!(geo.size(), 4096);

    assert_eq!(
        disk.write(geo.media_id, 10, &[1, 2, 3]),
        Err(Error::WriteProtected),
    );
    let mut buf = [0u8; 5];
    disk.read(geo.media_id, 4091, &mut buf).unwrap();
    assert_eq!(buf, [0x5A; 5]);
    assert_eq!(
        disk.read(geo.media_id, 4092, &mut buf),
        Err(Error::InvalidParameter),
    );
}

#[test]
fn file_disk_rejects_bad_images() {
    let img = Image::new("bad-size", 1000);
    FileDisk::open(img.path(), 512, true).unwrap_err();
    FileDisk::open(img.path(), 100, true).unwrap_err();
    let img = Image::new("empty", 0);
    FileDisk::open(img.path(), 512, true).unwrap_err();
}

#[test]
fn media_swap() {
    let dev = MemoryDisk::new(512, 8, 8);
    let disk = DiskIo::new(Config::default(), dev.clone()).unwrap();
    let old = disk.geometry().media_id;
    disk.write(old, 0, b"hello").unwrap();

    dev.remove_media();
    let token = Token::new();
    assert_eq!(
        disk.read_async(old, 0, BytesMut::zeroed(5), &token),
        Err(Error::NoMedia),
    );
    assert!(!token.is_signaled());

    dev.insert_media();
    let new = disk.geometry().media_id;
    assert_ne!(old, new);
    let mut buf = [0u8; 5];
    assert_eq!(disk.read(old, 0, &mut buf), Err(Error::MediaChanged));
    // Fresh media is blank.
    disk.read(new, 0, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 5]);
}

#[tokio::test]
async fn spawned_completions() {
    let dev = MemoryDisk::new(4096, 4096, 32);
    dev.set_delivery(Delivery::Spawn);
    let disk = DiskIo::new(Config::default(), dev).unwrap();
    let media_id = disk.geometry().media_id;

    let token = Token::new();
    let data = (0..10_000u32).map(|i| i as u8).collect::<Vec<_>>();
    disk.write_async(media_id, 123, BytesMut::from(&data[..]), &token)
        .unwrap();
    assert_eq!(token.wait().await.unwrap(), data);

    disk.read_async(media_id, 123, BytesMut::zeroed(data.len()), &token)
        .unwrap();
    assert_eq!(token.wait().await.unwrap(), data);
    assert_eq!(disk.pending_tasks(), 0);
    disk.shutdown().await.unwrap();
}
