//! Byte-granular disk I/O layered over devices that only transfer whole, aligned blocks.
//!
//! [`DiskIo`] splits each request into a partial leading block, a whole-block middle and a
//! partial trailing block, merging partial writes with the existing media content.
mod buffer;
mod disk_io;
mod engine;
pub mod file_disk;
pub mod geometry;
pub mod memory_disk;
mod plan;
mod task;

pub use blkio;
pub use buffer::alloc_aligned;
pub use disk_io::{Config, DiskIo};
pub use plan::Op;
pub use task::Token;
