//! Aligned block I/O against a raw device or image file (spec.md §4, "Block
//! device I/O"). Everything above this layer addresses blocks by index; this
//! is the only module that deals in byte offsets.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::CoreResult;

/// Smallest and largest block sizes a volume may be formatted with.
pub const MIN_BLOCKSIZE: u32 = 512;
pub const MAX_BLOCKSIZE: u32 = 8192;

/// Is `size` a power of two in `[MIN_BLOCKSIZE, MAX_BLOCKSIZE]`?
pub fn blocksize_valid(size: u32) -> bool {
    (MIN_BLOCKSIZE..=MAX_BLOCKSIZE).contains(&size) && size.is_power_of_two()
}

/// A single block device or image file, addressed by fixed-size blocks.
pub struct BlockDevice {
    file: File,
    blocksize: u32,
    path: std::path::PathBuf,
}

impl BlockDevice {
    pub fn open(path: impl AsRef<Path>, blocksize: u32, read_only: bool) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())?;
        Ok(BlockDevice {
            file,
            blocksize,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn create(path: impl AsRef<Path>, blocksize: u32, block_count: u64) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        file.set_len(block_count * blocksize as u64)?;
        Ok(BlockDevice {
            file,
            blocksize,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn blocksize(&self) -> u32 {
        self.blocksize
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total number of whole blocks backing this device.
    pub fn block_count(&self) -> CoreResult<u64> {
        Ok(self.file.metadata()?.len() / self.blocksize as u64)
    }

    pub fn read_block(&self, block: u32, buf: &mut [u8]) -> CoreResult<()> {
        debug_assert_eq!(buf.len(), self.blocksize as usize);
        let offset = (block as u64) * (self.blocksize as u64);
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    pub fn write_block(&self, block: u32, buf: &[u8]) -> CoreResult<()> {
        debug_assert_eq!(buf.len(), self.blocksize as usize);
        let offset = (block as u64) * (self.blocksize as u64);
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Read at an arbitrary byte offset, not necessarily block-aligned
    /// (used for the superblock, which sits at a fixed byte offset that
    /// need not coincide with a block boundary at small block sizes).
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> CoreResult<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64) -> CoreResult<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    pub fn fsync(&self) -> CoreResult<()> {
        rustix::fs::fsync(&self.file).map_err(std::io::Error::from)?;
        Ok(())
    }

    pub fn set_len_blocks(&self, block_count: u64) -> CoreResult<()> {
        self.file.set_len(block_count * self.blocksize as u64)?;
        Ok(())
    }
}

/// Round `n` up to the next multiple of `to` (`to` need not be a power of two).
pub fn round_up(n: u64, to: u64) -> u64 {
    if to == 0 {
        return n;
    }
    n.div_ceil(to) * to
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocksize_validity() {
        assert!(blocksize_valid(512));
        assert!(blocksize_valid(4096));
        assert!(blocksize_valid(8192));
        assert!(!blocksize_valid(8193));
        assert!(!blocksize_valid(256));
        assert!(!blocksize_valid(16384));
        assert!(!blocksize_valid(3000));
    }

    #[test]
    fn round_up_basic() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(9, 8), 16);
    }

    #[test]
    fn read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let dev = BlockDevice::create(&path, 512, 16).unwrap();
        let buf = vec![0xAB; 512];
        dev.write_block(3, &buf).unwrap();
        let mut out = vec![0u8; 512];
        dev.read_block(3, &mut out).unwrap();
        assert_eq!(buf, out);
    }
}
