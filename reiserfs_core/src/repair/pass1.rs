//! Pass 1: rebuild the tree from scratch (spec.md §4.9 step 1, `--rebuild-tree`).
//!
//! Unlike the balancer's `insert_leaf_item` (which edits one item into a
//! leaf the search already located inside a live tree), this pass starts
//! with no trustworthy tree at all: every block on the device is probed,
//! the ones that still decode as valid leaves are kept, and a fresh set of
//! internal levels is built bottom-up over the survivors, the way
//! `mkreiserfs`/rebuild-tree builds a tree from a flat run of leaves rather
//! than growing one key at a time.

use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};
use crate::item::ItemBody;
use crate::key::{Key, KeyFormat};
use crate::node::{Internal, Leaf, BLOCK_HEAD_LEN};

use super::{classify_block, probe_tree_block, BlockKind, ProbedBlock, RepairEngine};

struct Candidate {
    block: u32,
    low: Key,
    high: Key,
    item_count: usize,
}

/// Scan every block, keep the ones that decode as valid leaves (when two
/// candidates' key ranges collide, keep whichever holds more items rather
/// than mechanically favoring key order), then reconcile unformatted
/// extent pointers across the survivors before rebuilding the internal
/// levels over what's left.
pub fn rebuild_tree(engine: &mut RepairEngine) -> CoreResult<()> {
    let block_count = engine.fs.sb.block_count;
    let mut candidates: Vec<Candidate> = Vec::new();

    for block in 0..block_count {
        if classify_block(&engine.fs, block) != BlockKind::Tree {
            continue;
        }
        match probe_tree_block(&mut engine.fs, block)? {
            ProbedBlock::Leaf(leaf) if !leaf.items.is_empty() => {
                let low = leaf.items.first().unwrap().0.key;
                let high = leaf.items.last().unwrap().0.key;
                candidates.push(Candidate { block, low, high, item_count: leaf.items.len() });
            }
            _ => {}
        }
    }

    candidates.sort_by_key(|c| c.low);

    // leaves_bitmap: which candidate blocks are actually kept once
    // overlaps are resolved.
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        match kept.last() {
            Some(prev) if candidate.low <= prev.high => {
                if candidate.item_count > prev.item_count {
                    log::warn!(
                        "leaf at block {} overlaps leaf at block {} and holds more items; keeping {} instead",
                        candidate.block,
                        prev.block,
                        candidate.block
                    );
                    engine.findings.fixable += 1;
                    engine.findings.fixed += 1;
                    kept.pop();
                    kept.push(candidate);
                } else {
                    log::warn!(
                        "leaf at block {} overlaps leaf at block {}; dropping the smaller one",
                        candidate.block,
                        prev.block
                    );
                    engine.findings.fixable += 1;
                    engine.findings.fixed += 1;
                }
            }
            _ => kept.push(candidate),
        }
    }

    if kept.is_empty() {
        return Err(CoreError::Inconsistent("no valid leaves found; nothing to rebuild from".into()));
    }

    reconcile_unformatted_pointers(engine, &kept)?;

    let kept: Vec<u32> = kept.into_iter().map(|c| c.block).collect();
    log::info!("rebuild-tree: keeping {} of {} candidate leaves", kept.len(), block_count);

    let format = KeyFormat::Long;
    let mut level_keys: Vec<Key> = Vec::with_capacity(kept.len());
    let mut level_sizes: Vec<u16> = Vec::with_capacity(kept.len());
    for &block in &kept {
        let leaf = read_leaf(engine, block, block_count)?;
        level_keys.push(leaf.items.first().unwrap().0.key);
        level_sizes.push(leaf.used_space() as u16);
    }

    let mut level_blocks = kept;
    let mut height: u16 = 1;
    let key_len = Key::encoded_len(format);
    let fanout = ((engine.fs.sb.blocksize as usize - BLOCK_HEAD_LEN) / (key_len + 4)).max(2) - 1;

    while level_blocks.len() > 1 {
        let mut next_blocks = Vec::new();
        let mut next_keys = Vec::new();
        let mut next_sizes = Vec::new();

        let mut i = 0;
        while i < level_blocks.len() {
            let end = (i + fanout + 1).min(level_blocks.len());
            let group_pointers = level_blocks[i..end].to_vec();
            // The group's own delimiting keys are every key after the
            // first child in the group (group_pointers.len() - 1 of them).
            let group_keys = level_keys[i + 1..end].to_vec();
            let group_sizes = level_sizes[i..end].to_vec();

            let node = Internal { format, keys: group_keys, pointers: group_pointers, child_used_space: group_sizes };
            let block = engine
                .fs
                .alloc_block()
                .ok_or(CoreError::NoDiskSpace)?;
            engine.log_pre_image(block)?;
            let buf = engine.fs.cache_mut().open(0, block, engine.fs.sb.blocksize as usize)?;
            {
                let mut inner = buf.borrow_mut();
                node.encode(inner.data_mut(), height + 1);
                inner.uptodate = true;
            }
            engine.fs.cache_mut().write(&buf)?;
            engine.fs.cache_mut().close(buf);

            next_keys.push(level_keys[i]);
            next_sizes.push(node.encoded_len() as u16);
            next_blocks.push(block);
            i = end;
        }

        level_blocks = next_blocks;
        level_keys = next_keys;
        level_sizes = next_sizes;
        height += 1;
    }

    engine.fs.sb.root_block = level_blocks[0];
    engine.fs.sb.tree_height = height;
    engine.recovered_leaves = {
        // Re-probe from the final layout so pass2/pass3 see the same leaf
        // set pass1 committed, in case any were dropped above.
        let mut leaves = Vec::new();
        collect_recovered_leaves(engine, engine.fs.sb.root_block, &mut leaves)?;
        leaves
    };
    log::info!(
        "rebuild-tree: new root at block {} (height {})",
        engine.fs.sb.root_block,
        engine.fs.sb.tree_height
    );
    Ok(())
}

/// Count how many kept leaves' extent items reference each unformatted
/// (data) block. A block referenced by more than one extent item has
/// ambiguous ownership (`bad_unfm`) and its pointer is zeroed everywhere
/// it appears rather than assigned to a guess; every other referenced
/// block is `good_unfm` and is left alone.
fn reconcile_unformatted_pointers(engine: &mut RepairEngine, kept: &[Candidate]) -> CoreResult<()> {
    let block_count = engine.fs.sb.block_count;
    let mut refcount: HashMap<u32, u32> = HashMap::new();

    for candidate in kept {
        let leaf = read_leaf(engine, candidate.block, block_count)?;
        for (_, body) in &leaf.items {
            if let ItemBody::Extent(e) = body {
                for &p in &e.pointers {
                    if p != 0 {
                        *refcount.entry(p).or_insert(0) += 1;
                    }
                }
            }
        }
    }

    let bad_unfm: std::collections::HashSet<u32> =
        refcount.iter().filter(|&(_, &count)| count > 1).map(|(&block, _)| block).collect();
    let good_unfm = refcount.len() - bad_unfm.len();
    log::info!(
        "rebuild-tree: {} unformatted blocks referenced once, {} referenced ambiguously",
        good_unfm,
        bad_unfm.len()
    );

    if bad_unfm.is_empty() {
        return Ok(());
    }

    for candidate in kept {
        let mut leaf = read_leaf(engine, candidate.block, block_count)?;
        let mut changed = false;
        for (_, body) in leaf.items.iter_mut() {
            if let ItemBody::Extent(e) = body {
                let zeroed = e.zero_matching(|p| bad_unfm.contains(&p));
                if zeroed > 0 {
                    changed = true;
                }
            }
        }
        if changed {
            for (ih, body) in leaf.items.iter_mut() {
                ih.item_len = body.encoded_len() as u16;
            }
            engine.findings.fixable += 1;
            engine.findings.fixed += 1;
            engine.log_pre_image(candidate.block)?;
            let buf = engine.fs.cache_mut().open(0, candidate.block, engine.fs.sb.blocksize as usize)?;
            {
                let mut inner = buf.borrow_mut();
                leaf.encode(inner.data_mut());
                inner.uptodate = true;
            }
            engine.fs.cache_mut().write(&buf)?;
            engine.fs.cache_mut().close(buf);
        }
    }

    Ok(())
}

fn read_leaf(engine: &mut RepairEngine, block: u32, device_blocks: u32) -> CoreResult<Leaf> {
    let data = {
        let buf = engine.fs.cache_mut().read(0, block, engine.fs.sb.blocksize as usize)?;
        let d = buf.borrow().data().to_vec();
        engine.fs.cache_mut().close(buf);
        d
    };
    Leaf::decode(&data, device_blocks).map_err(|_| CoreError::Inconsistent("kept leaf failed to redecode".into()))
}

fn collect_recovered_leaves(engine: &mut RepairEngine, block: u32, out: &mut Vec<u32>) -> CoreResult<()> {
    let data = {
        let buf = engine.fs.cache_mut().read(0, block, engine.fs.sb.blocksize as usize)?;
        let d = buf.borrow().data().to_vec();
        engine.fs.cache_mut().close(buf);
        d
    };
    let head = crate::node::BlockHead::decode(&data);
    if head.is_leaf() {
        out.push(block);
        return Ok(());
    }
    let internal = Internal::decode(&data).map_err(|_| CoreError::Inconsistent("rebuilt internal node unreadable".into()))?;
    for &ptr in &internal.pointers {
        collect_recovered_leaves(engine, ptr, out)?;
    }
    Ok(())
}
