//! Pass 4: bitmap reconciliation (spec.md §4.9 step 4) — recompute which
//! blocks are actually in use from the tree and metadata layout pass1-3
//! committed, and replace the on-disk bitmap if it disagrees.

use crate::bitmap::Bitmap;
use crate::error::CoreResult;
use crate::node::Internal;

use super::RepairEngine;

pub fn reconcile_bitmap(engine: &mut RepairEngine, fix: bool) -> CoreResult<()> {
    let mut authoritative = Bitmap::new(engine.fs.sb.block_count as usize);

    let sb_block = (crate::superblock::SuperBlock::disk_offset(engine.fs.sb.version, engine.fs.sb.blocksize)
        / engine.fs.sb.blocksize as u64) as u32;
    let spread = Bitmap::spread_layout(sb_block);
    for block in 0..engine.fs.sb.block_count {
        if Bitmap::is_bitmap_block(spread, engine.fs.sb.blocksize, sb_block, engine.fs.sb.bmap_count as u32, block)
            || block == sb_block
        {
            authoritative.set(block as usize);
        }
    }
    let journal = engine.fs.sb.journal;
    for block in journal.first_block..journal.first_block + journal.dev_block_count {
        if (block as usize) < authoritative.bit_size() {
            authoritative.set(block as usize);
        }
    }

    mark_subtree(engine, engine.fs.sb.root_block, &mut authoritative)?;

    let differs = !authoritative.compare(&engine.fs.bitmap);
    if differs {
        engine.findings.fixable += 1;
        if fix {
            log::info!(
                "bitmap disagreed with the tree on {} blocks; replacing",
                (0..authoritative.bit_size())
                    .filter(|&b| authoritative.test(b) != engine.fs.bitmap.test(b))
                    .count()
            );
            engine.fs.bitmap = authoritative;
            engine.fs.sb.free_blocks = engine.fs.bitmap.zeros() as u32;
            engine.findings.fixed += 1;
        }
    }
    Ok(())
}

/// Rebuild the object-id map from every stat-data item actually present in
/// the tree, so a rebuild doesn't leave ids that no longer exist reserved
/// forever or hand out an id still held by a surviving object.
pub fn rebuild_objidmap(engine: &mut RepairEngine) -> CoreResult<()> {
    let leaves = super::collect_all_leaves(&mut engine.fs)?;

    let mut fresh = crate::objidmap::ObjectIdMap::new(0, engine.fs.sb.objectid_map_max as u32);
    let mut max_id = 0u32;
    for (_, leaf) in &leaves {
        for (ih, body) in &leaf.items {
            if matches!(body, crate::item::ItemBody::StatData(_)) {
                fresh.mark(ih.key.object_id);
                fresh.mark(ih.key.dir_id);
                max_id = max_id.max(ih.key.object_id).max(ih.key.dir_id);
            }
        }
    }

    let cursor = (max_id + 1).min(engine.fs.sb.objectid_map_max as u32);
    engine.fs.set_objidmap(fresh, cursor);
    log::info!("rebuilt object-id map from live stat-data; cursor now {cursor}");
    Ok(())
}

fn mark_subtree(engine: &mut RepairEngine, block: u32, bitmap: &mut Bitmap) -> CoreResult<()> {
    if (block as usize) >= bitmap.bit_size() || bitmap.test(block as usize) {
        return Ok(());
    }
    bitmap.set(block as usize);

    let data = {
        let buf = engine.fs.cache_mut().read(0, block, engine.fs.sb.blocksize as usize)?;
        let d = buf.borrow().data().to_vec();
        engine.fs.cache_mut().close(buf);
        d
    };
    let head = crate::node::BlockHead::decode(&data);
    if head.is_leaf() {
        if let Ok(leaf) = crate::node::Leaf::decode(&data, engine.fs.sb.block_count) {
            for (_, body) in &leaf.items {
                if let crate::item::ItemBody::Extent(e) = body {
                    for &ptr in &e.pointers {
                        if ptr != 0 && (ptr as usize) < bitmap.bit_size() {
                            bitmap.set(ptr as usize);
                        }
                    }
                }
            }
        }
        return Ok(());
    }
    if let Ok(internal) = Internal::decode(&data) {
        for &ptr in &internal.pointers {
            mark_subtree(engine, ptr, bitmap)?;
        }
    }
    Ok(())
}
