//! Content digest and random write primitives over a device path.
//!
//! Both are synchronous: the digest runs after the workload stops, and the
//! writer runs on the background writer's blocking task.

use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use crate::types::Digest;

/// Block size random writes are aligned to.
pub const BLOCK_SIZE: u64 = 4096;

/// Digest of everything readable at `path`.
pub trait ContentDigest: Send + Sync {
    fn digest(&self, path: &Path) -> io::Result<Digest>;
}

/// Writes random data to a device.
pub trait RandomWriter: Send + Sync {
    /// Write roughly `burst_bytes` of random blocks and flush them to the
    /// device. Returns the number of bytes written.
    fn write_random(&self, path: &Path, burst_bytes: u64) -> io::Result<u64>;
}

/// Streaming blake3 hash of the whole file or device.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Digest;

impl ContentDigest for Blake3Digest {
    fn digest(&self, path: &Path) -> io::Result<Digest> {
        let file = std::fs::File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update_reader(file)?;
        Ok(Digest(hasher.finalize().as_bytes().to_vec()))
    }
}

/// Writes random 4 KiB blocks at random aligned offsets.
///
/// The device must already exist and span at least one block; the writer
/// never grows it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileRandomWriter;

impl RandomWriter for FileRandomWriter {
    fn write_random(&self, path: &Path, burst_bytes: u64) -> io::Result<u64> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        let blocks = file.metadata()?.len() / BLOCK_SIZE;
        if blocks == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is smaller than one block", path.display()),
            ));
        }

        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        let count = burst_bytes.div_ceil(BLOCK_SIZE).max(1);
        for _ in 0..count {
            fastrand::fill(&mut buf);
            let block = fastrand::u64(..blocks);
            file.seek(SeekFrom::Start(block * BLOCK_SIZE))?;
            file.write_all(&buf)?;
        }
        file.sync_data()?;
        Ok(count * BLOCK_SIZE)
    }
}
