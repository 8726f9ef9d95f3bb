//! Pass 0: superblock sanity (spec.md §4.9, step 0). Runs before anything
//! else touches the tree, since every later pass trusts `sb.block_count`,
//! `sb.blocksize` and the journal geometry to address the device.

use crate::error::{CoreError, CoreResult};

use super::RepairEngine;

/// Validate the superblock against the device it actually sits on; in fix
/// mode, correct the handful of fields that are safe to derive rather than
/// trust (free block count, bitmap count).
pub fn check_superblock(engine: &mut RepairEngine, fix: bool) -> CoreResult<()> {
    let device_blocks = engine.fs.device().block_count()?;
    if engine.fs.sb.block_count as u64 > device_blocks {
        engine.findings.fatal += 1;
        if !fix {
            return Ok(());
        }
        log::warn!(
            "superblock claims {} blocks but device only has {device_blocks}",
            engine.fs.sb.block_count
        );
        engine.fs.sb.block_count = device_blocks as u32;
        engine.findings.fixed += 1;
    }

    if !crate::block::blocksize_valid(engine.fs.sb.blocksize) {
        engine.findings.fatal += 1;
        return Ok(());
    }

    let journal = &engine.fs.sb.journal;
    let journal_geometry = crate::journal::JournalGeometry {
        first_block: journal.first_block,
        block_count: journal.dev_block_count,
        max_trans_len: journal.max_trans_len,
    };
    if !journal_geometry.valid(engine.fs.sb.block_count) {
        engine.findings.fatal += 1;
        log::warn!("journal geometry in superblock is not sane for this device");
    }

    let free_on_disk = engine.fs.bitmap.zeros() as u32;
    if engine.fs.sb.free_blocks != free_on_disk {
        engine.findings.fixable += 1;
        if fix {
            log::info!(
                "correcting free block count: {} -> {free_on_disk}",
                engine.fs.sb.free_blocks
            );
            engine.fs.sb.free_blocks = free_on_disk;
            engine.findings.fixed += 1;
        }
    }

    if !engine.fs.sb.state_ok() {
        engine.findings.fixable += 1;
        if fix {
            engine.fs.sb.mark_clean();
            engine.findings.fixed += 1;
        }
    }

    Ok(())
}

/// `--rebuild-sb`: the superblock itself already parsed (or `FileSystem::open`
/// couldn't have produced `engine.fs`), so this recomputes the fields a
/// rebuild can get wrong without a full tree rebuild — block/free counts and
/// tree height — from the bitmap and tree that are still readable.
pub fn rebuild_superblock(engine: &mut RepairEngine) -> CoreResult<()> {
    let device_blocks = engine.fs.device().block_count()?;
    if device_blocks == 0 {
        return Err(CoreError::BadGeometry("device reports zero blocks".into()));
    }
    engine.fs.sb.block_count = device_blocks as u32;
    engine.fs.sb.free_blocks = engine.fs.bitmap.zeros() as u32;

    let leaves = super::collect_all_leaves(&mut engine.fs)?;
    let height = tree_height_of(&mut engine.fs, leaves.first().map(|(b, _)| *b).unwrap_or(engine.fs.sb.root_block))?;
    engine.fs.sb.tree_height = height;
    engine.fs.sb.mark_clean();
    engine.findings.fixed += 1;
    Ok(())
}

fn tree_height_of(fs: &mut crate::fs::FileSystem, start: u32) -> CoreResult<u16> {
    let mut block = fs.sb.root_block;
    let mut height = 1u16;
    loop {
        let buf = fs.cache_mut().read(0, block, fs.sb.blocksize as usize)?;
        let data = buf.borrow().data().to_vec();
        fs.cache_mut().close(buf);
        let head = crate::node::BlockHead::decode(&data);
        if head.is_leaf() {
            let _ = start;
            return Ok(height);
        }
        let internal = crate::node::Internal::decode(&data)
            .map_err(|_| CoreError::Inconsistent("root descends through a non-internal, non-leaf block".into()))?;
        block = *internal.pointers.first().ok_or(CoreError::Inconsistent("internal node with no pointers".into()))?;
        height += 1;
    }
}
