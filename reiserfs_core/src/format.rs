//! `mkfs` (spec.md §6, §9 "mkreiserfs.c's concrete formatting order"):
//! lay down the superblock, bitmap, journal and an empty root directory
//! in that order, on top of [`crate::fs::FileSystem::create_full`].

use crate::error::CoreResult;
use crate::fs::{CreateOptions, FileSystem};
use crate::hash::HashKind;
use crate::item::directory::Directory;
use crate::item::stat_data::{StatData, StatDataFormat};
use crate::item::{ItemBody, ItemFlags, ItemHeader};
use crate::key::{Key, KeyFormat};
use crate::node::Leaf;
use crate::superblock::FormatVersion;

/// The root directory's key pair is fixed across every volume this
/// toolkit formats, matching the original's hardcoded root location.
pub const ROOT_DIR_ID: u32 = 1;
pub const ROOT_OBJECT_ID: u32 = 2;

/// `lost+found`'s reserved object id, allocated during format so repair
/// can always find (or recreate) it without a namespace lookup.
pub const LOST_FOUND_OBJECT_ID: u32 = 3;

pub struct FormatOptions {
    pub blocksize: u32,
    pub block_count: u64,
    pub hash: HashKind,
    pub version: FormatVersion,
    pub uuid: Option<uuid::Uuid>,
    pub label: Option<String>,
    pub bad_blocks: Vec<u32>,
    pub journal_offset: Option<u32>,
    pub journal_size: Option<u32>,
    pub max_trans_len: Option<u32>,
}

impl Default for FormatOptions {
    fn default() -> FormatOptions {
        FormatOptions {
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

/// Format `path` as a fresh volume and return it open and ready for use.
/// `opts.block_count` must already reflect the target device's size (the
/// CLI's `mkfs <device> [block-count]` is responsible for measuring the
/// device and defaulting `block-count`, since that's OS glue, not core).
pub fn format(path: impl AsRef<std::path::Path>, opts: FormatOptions) -> CoreResult<FileSystem> {
    log::info!(
        "formatting {} blocks of size {} (hash={})",
        opts.block_count,
        opts.blocksize,
        opts.hash
    );

    let mut fs = FileSystem::create_full(
        path,
        CreateOptions {
            blocksize: opts.blocksize,
            block_count: opts.block_count,
            hash: opts.hash,
            version: opts.version,
            uuid: opts.uuid,
            label: opts.label,
            bad_blocks: opts.bad_blocks,
            journal_offset: opts.journal_offset,
            journal_size: opts.journal_size,
            max_trans_len: opts.max_trans_len,
        },
    )?;

    write_root_directory(&mut fs)?;
    reserve_lost_and_found_id(&mut fs)?;
    fs.flush()?;
    log::info!("format complete: root block {}", fs.sb.root_block);
    Ok(fs)
}

/// Lay down a single leaf at `sb.root_block` holding the root's stat-data
/// and a directory item with just `.` and `..` (scenario A: "tree
/// contains exactly two entries under root dir key (1,2,0,0)").
fn write_root_directory(fs: &mut FileSystem) -> CoreResult<()> {
    let dir = Directory::seed(ROOT_DIR_ID, ROOT_OBJECT_ID, ROOT_DIR_ID, ROOT_OBJECT_ID);
    let dir_entry_count = dir.entry_count();
    let dir_len = dir.encoded_len();

    let sd = StatData {
        format: StatDataFormat::V2,
        mode: 0o40755,
        nlink: 2,
        size: dir_len as u64,
        uid: 0,
        gid: 0,
        atime: 0,
        mtime: 0,
        ctime: 0,
        first_direct_byte_or_generation: 0,
        blocks: 1,
    };
    let sd_len = sd.encoded_len();

    let sd_header = ItemHeader {
        key: Key::stat_data(ROOT_DIR_ID, ROOT_OBJECT_ID),
        format: KeyFormat::Long,
        item_len: sd_len as u16,
        item_location: 0,
        entry_count_or_free: 0,
        flags: ItemFlags::empty(),
    };
    let dir_header = ItemHeader {
        key: Key::new(ROOT_DIR_ID, ROOT_OBJECT_ID, 1, crate::key::ItemKind::Directory),
        format: KeyFormat::Long,
        item_len: dir_len as u16,
        item_location: 0,
        entry_count_or_free: dir_entry_count as u16,
        flags: ItemFlags::empty(),
    };

    let leaf = Leaf {
        format: KeyFormat::Long,
        items: vec![(sd_header, ItemBody::StatData(sd)), (dir_header, ItemBody::Directory(dir))],
    };

    let blocksize = fs.sb.blocksize as usize;
    let mut buf = vec![0u8; blocksize];
    leaf.encode(&mut buf);
    if leaf.used_space() + crate::node::BLOCK_HEAD_LEN > blocksize {
        return Err(crate::error::CoreError::BadGeometry(
            "block size too small to hold an empty root directory".into(),
        ));
    }

    let buffer = fs.cache_mut().open(0, fs.sb.root_block, blocksize)?;
    {
        let mut inner = buffer.borrow_mut();
        inner.data_mut().copy_from_slice(&buf);
        inner.uptodate = true;
    }
    fs.cache_mut().write(&buffer)?;
    fs.cache_mut().close(buffer);
    fs.sb.tree_height = 1;
    Ok(())
}

/// Reserve object id 3 for `lost+found` so a later `mkdir` (by fsck, on
/// first use) doesn't race the normal allocator for it.
fn reserve_lost_and_found_id(fs: &mut FileSystem) -> CoreResult<()> {
    fs.objidmap.mark(LOST_FOUND_OBJECT_ID);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_produces_root_with_dot_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let mut fs = format(
            &path,
            FormatOptions { block_count: 8192, ..FormatOptions::default() },
        )
        .unwrap();

        assert_eq!(fs.sb.blocksize, 4096);
        assert_eq!(fs.sb.block_count, 8192);

        let buf = fs.cache_mut().read(0, fs.sb.root_block, 4096).unwrap();
        let leaf = Leaf::decode(&buf.borrow().data, 8192).unwrap();
        fs.cache_mut().close(buf);
        assert_eq!(leaf.items.len(), 2);
        match &leaf.items[1].1 {
            ItemBody::Directory(d) => assert_eq!(d.entry_count(), 2),
            _ => unreachable!(),
        }
    }
}
