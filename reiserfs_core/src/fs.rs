//! `FileSystem`: the open-volume handle that ties a block device, buffer
//! cache, superblock, block bitmap, and object-id map together. `mkfs`
//! and `fsck` both drive the tree exclusively through this handle rather
//! than touching `BlockDevice`/`BufferCache` directly (spec.md §9,
//! "Global mutable state": every piece of volume state is owned here,
//! not behind process-global statics).

use std::rc::Rc;

use crate::balance::TreeGeometry;
use crate::bitmap::Bitmap;
use crate::block::BlockDevice;
use crate::cache::BufferCache;
use crate::error::{CoreError, CoreResult};
use crate::hash::HashKind;
use crate::objidmap::ObjectIdMap;
use crate::superblock::{FormatVersion, SuperBlock};

/// Fixed device id this toolkit registers its one open device under;
/// multi-device volumes are out of scope (spec.md Non-goals).
const DEV: u32 = 0;

/// Block index the superblock itself occupies, which (not the tree
/// root) is what `Bitmap::is_bitmap_block`/`spread_layout` key off of.
fn sb_block_index(version: FormatVersion, blocksize: u32) -> u32 {
    (SuperBlock::disk_offset(version, blocksize) / blocksize as u64) as u32
}

/// Every knob `mkfs` can set at format time.
pub struct CreateOptions {
    pub blocksize: u32,
    pub block_count: u64,
    pub hash: HashKind,
    pub version: FormatVersion,
    pub uuid: Option<uuid::Uuid>,
    pub label: Option<String>,
    /// Blocks to reserve up front as unusable (mkfs `-B`).
    pub bad_blocks: Vec<u32>,
    /// Override the journal's first block (mkfs `-o`); default places it
    /// right after the superblock's bitmap.
    pub journal_offset: Option<u32>,
    /// Override the journal's block count (mkfs `-s`); default sizes it
    /// from the device, capped at 8192 blocks.
    pub journal_size: Option<u32>,
    /// Override the largest single transaction (mkfs `-t`).
    pub max_trans_len: Option<u32>,
}

impl Default for CreateOptions {
    fn default() -> CreateOptions {
        CreateOptions {
            blocksize: 4096,
            block_count: 0,
            hash: HashKind::R5,
            version: FormatVersion::V3_6,
            uuid: None,
            label: None,
            bad_blocks: Vec::new(),
            journal_offset: None,
            journal_size: None,
            max_trans_len: None,
        }
    }
}

pub struct FileSystem {
    device: Rc<BlockDevice>,
    cache: BufferCache,
    pub sb: SuperBlock,
    pub bitmap: Bitmap,
    pub objidmap: ObjectIdMap,
    objidmap_cursor: u32,
    read_only: bool,
}

impl FileSystem {
    pub fn open(path: impl AsRef<std::path::Path>, read_only: bool) -> CoreResult<FileSystem> {
        // The blocksize isn't known until the superblock is read, so probe
        // with the smallest legal size first; `BlockDevice::read_block`
        // isn't used for the superblock itself (`pread` is offset-based),
        // so this only matters once we start reading formatted blocks.
        let probe = BlockDevice::open(path.as_ref(), crate::block::MIN_BLOCKSIZE, true)?;
        let sb = SuperBlock::read(&probe)?;
        if !crate::block::blocksize_valid(sb.blocksize) {
            return Err(CoreError::BadGeometry(format!("bad blocksize {}", sb.blocksize)));
        }
        if !sb.state_ok() {
            log::warn!("volume is not marked clean (state bits {:?})", sb.state);
        }

        let device = Rc::new(BlockDevice::open(path.as_ref(), sb.blocksize, read_only)?);
        let mut cache = BufferCache::new();
        cache.register_device(DEV, device.clone());

        let device_blocks = device.block_count()?;
        let bitmap = read_bitmap(&device, &sb, device_blocks as u32)?;
        let objidmap = ObjectIdMap::new(sb.objectid_map_cursor as u32, sb.objectid_map_max as u32);

        Ok(FileSystem {
            device,
            cache,
            sb,
            bitmap,
            objidmap,
            objidmap_cursor: 0,
            read_only,
        })
    }

    pub fn create(
        path: impl AsRef<std::path::Path>,
        blocksize: u32,
        block_count: u64,
        hash: HashKind,
        label: Option<String>,
    ) -> CoreResult<FileSystem> {
        Self::create_full(
            path,
            CreateOptions {
                blocksize,
                block_count,
                hash,
                uuid: Some(uuid::Uuid::new_v4()),
                label,
                ..CreateOptions::default()
            },
        )
    }

    /// `create` with every mkfs-level knob spelled out; used directly by
    /// [`crate::format::format`] so the CLI's `-u`/`--format`/`-B` options
    /// have somewhere to land.
    pub fn create_full(path: impl AsRef<std::path::Path>, opts: CreateOptions) -> CoreResult<FileSystem> {
        let CreateOptions {
            blocksize,
            block_count,
            hash,
            version,
            uuid,
            label,
            bad_blocks,
            journal_offset,
            journal_size,
            max_trans_len,
        } = opts;
        if !crate::block::blocksize_valid(blocksize) {
            return Err(CoreError::BadGeometry(format!("bad blocksize {blocksize}")));
        }
        let device = Rc::new(BlockDevice::create(path.as_ref(), blocksize, block_count)?);
        let mut cache = BufferCache::new();
        cache.register_device(DEV, device.clone());

        let sb_block = sb_block_index(version, blocksize);
        let bmap_count = (block_count as u32).div_ceil(blocksize * 8).max(1);
        // The journal starts right after the superblock's own bitmap
        // block(s); leave a tail past it for the root leaf and whatever
        // else mkfs still needs to lay down, since `embedded` otherwise
        // happily sizes the journal to reach the very end of the device.
        let journal_first = journal_offset.unwrap_or(sb_block + 1 + bmap_count);
        let reserve_tail = (block_count as u32 / 4).clamp(2, 64);
        let mut journal = crate::journal::JournalGeometry::embedded(
            journal_first,
            (block_count as u32).saturating_sub(reserve_tail),
        );
        if let Some(size) = journal_size {
            journal.block_count = size;
        }
        if let Some(tlen) = max_trans_len {
            journal.max_trans_len = tlen;
        }
        if !journal.valid(block_count as u32) {
            return Err(CoreError::BadGeometry("requested journal geometry does not fit the device".into()));
        }
        let root_block = journal.first_block + journal.block_count;
        if root_block >= block_count as u32 {
            return Err(CoreError::BadGeometry("volume too small for journal and root block".into()));
        }

        let sb = SuperBlock {
            version,
            block_count: block_count as u32,
            // root (1) + journal + bitmaps(1 each, not yet tracked precisely here)
            free_blocks: block_count as u32 - root_block - 1,
            root_block,
            blocksize,
            hash,
            tree_height: 1,
            bmap_count: bmap_count as u16,
            state: crate::superblock::SbState::CONSISTENT,
            objectid_map_cursor: 2,
            objectid_map_max: u16::MAX,
            uuid,
            label,
            journal: crate::superblock::JournalParams {
                first_block: journal.first_block,
                dev_block_count: journal.block_count,
                max_trans_len: journal.max_trans_len,
                magic: 0x5245_4653, // "REFS"
            },
        };

        let bitmap = Bitmap::new(block_count as usize);
        let objidmap = ObjectIdMap::new(2, u16::MAX as u32);

        let mut fs = FileSystem {
            device,
            cache,
            sb,
            bitmap,
            objidmap,
            objidmap_cursor: 0,
            read_only: false,
        };
        let sb_block = sb_block_index(fs.sb.version, blocksize);
        let spread = Bitmap::spread_layout(sb_block);
        for b in 0..block_count as u32 {
            if Bitmap::is_bitmap_block(spread, blocksize, sb_block, fs.sb.bmap_count as u32, b) {
                fs.reserve_block(b)?;
            }
        }
        fs.reserve_block(root_block)?;
        for b in journal.first_block..journal.first_block + journal.block_count {
            fs.reserve_block(b)?;
        }
        for b in bad_blocks {
            if b >= block_count as u32 {
                continue;
            }
            // A bad block already inside metadata is already reserved;
            // only outright data-area bad blocks need marking here.
            if !fs.bitmap.test(b as usize) {
                fs.reserve_block(b)?;
            }
        }
        Ok(fs)
    }

    pub fn geometry(&self) -> TreeGeometry {
        TreeGeometry {
            dev: DEV,
            blocksize: self.sb.blocksize,
            device_blocks: self.sb.block_count,
        }
    }

    pub fn cache_mut(&mut self) -> &mut BufferCache {
        &mut self.cache
    }

    pub fn device(&self) -> &BlockDevice {
        &self.device
    }

    /// Allocate one free block, marking it used. Used directly by mkfs
    /// and by the balancer's `alloc` closure.
    pub fn alloc_block(&mut self) -> Option<u32> {
        let bit = self.bitmap.alloc_from(0)?;
        self.sb.free_blocks = self.sb.free_blocks.saturating_sub(1);
        Some(bit as u32)
    }

    pub fn free_block(&mut self, block: u32) {
        if self.bitmap.test(block as usize) {
            self.bitmap.clear(block as usize);
            self.sb.free_blocks += 1;
        }
    }

    fn reserve_block(&mut self, block: u32) -> CoreResult<()> {
        if self.bitmap.test(block as usize) {
            return Err(CoreError::Inconsistent(format!("block {block} reserved twice")));
        }
        self.bitmap.set(block as usize);
        Ok(())
    }

    pub fn alloc_object_id(&mut self) -> CoreResult<u32> {
        self.objidmap.alloc(&mut self.objidmap_cursor)
    }

    /// Replace the object-id map and its allocation cursor wholesale, used
    /// by fsck's rebuild pass once it has recomputed both from live
    /// stat-data. Bypasses `alloc_object_id`'s incremental `mark` since the
    /// whole map is being swapped, not extended.
    pub fn set_objidmap(&mut self, map: ObjectIdMap, cursor: u32) {
        self.objidmap = map;
        self.objidmap_cursor = cursor;
    }

    /// Write the superblock, any dirty buffers, and sync the device.
    pub fn flush(&mut self) -> CoreResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.sb.objectid_map_cursor = self.objidmap_cursor.min(self.sb.objectid_map_max as u32) as u16;
        self.sb.write(&self.device)?;
        write_bitmap(&self.device, &self.sb, &self.bitmap)?;
        self.device.fsync()?;
        Ok(())
    }

    pub fn close(mut self) -> CoreResult<()> {
        self.flush()?;
        self.cache.invalidate_all(DEV);
        Ok(())
    }

    /// Drop every cached buffer for this device without writing it back.
    /// Used after an out-of-band write (e.g. rollback-log replay) bypasses
    /// the cache entirely and leaves it holding stale data.
    pub fn invalidate_all(&mut self) {
        self.cache.invalidate_all(DEV);
    }
}

/// Bitmap blocks hold raw bits, one bit per volume block, starting from
/// the first bitmap block's first byte; `Bitmap::is_bitmap_block` locates
/// them from the superblock's layout fields.
fn read_bitmap(dev: &BlockDevice, sb: &SuperBlock, device_blocks: u32) -> CoreResult<Bitmap> {
    let sb_block = sb_block_index(sb.version, sb.blocksize);
    let spread = Bitmap::spread_layout(sb_block);
    let mut bm = Bitmap::new(sb.block_count as usize);
    let mut buf = vec![0u8; sb.blocksize as usize];
    let mut bit = 0usize;
    for block in 0..device_blocks {
        if !Bitmap::is_bitmap_block(spread, sb.blocksize, sb_block, sb.bmap_count as u32, block) {
            continue;
        }
        dev.read_block(block, &mut buf)?;
        for byte in &buf {
            for i in 0..8 {
                if bit >= sb.block_count as usize {
                    break;
                }
                if (byte >> i) & 1 != 0 {
                    bm.set(bit);
                }
                bit += 1;
            }
        }
    }
    Ok(bm)
}

fn write_bitmap(dev: &BlockDevice, sb: &SuperBlock, bitmap: &Bitmap) -> CoreResult<()> {
    let sb_block = sb_block_index(sb.version, sb.blocksize);
    let spread = Bitmap::spread_layout(sb_block);
    let mut bit = 0usize;
    let mut buf = vec![0u8; sb.blocksize as usize];
    for block in 0..sb.block_count {
        if !Bitmap::is_bitmap_block(spread, sb.blocksize, sb_block, sb.bmap_count as u32, block) {
            continue;
        }
        buf.iter_mut().for_each(|b| *b = 0);
        'outer: for byte in buf.iter_mut() {
            for i in 0..8 {
                if bit >= bitmap.bit_size() {
                    break 'outer;
                }
                if bitmap.test(bit) {
                    *byte |= 1 << i;
                }
                bit += 1;
            }
        }
        dev.write_block(block, &buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_reserves_root_and_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let fs = FileSystem::create(&path, 1024, 4096, HashKind::R5, Some("test".into())).unwrap();
        assert!(fs.bitmap.test(fs.sb.root_block as usize));
        assert!(fs.bitmap.test(fs.sb.journal.first_block as usize));
    }

    #[test]
    fn open_after_create_reads_back_same_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let mut fs = FileSystem::create(&path, 1024, 4096, HashKind::Tea, None).unwrap();
        fs.flush().unwrap();
        drop(fs);

        let reopened = FileSystem::open(&path, true).unwrap();
        assert_eq!(reopened.sb.blocksize, 1024);
        assert_eq!(reopened.sb.block_count, 4096);
        assert_eq!(reopened.sb.hash, HashKind::Tea);
        assert!(reopened.bitmap.test(reopened.sb.root_block as usize));
    }
}
