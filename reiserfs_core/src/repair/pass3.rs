//! Pass 3: relink orphans under `lost+found` (spec.md §4.9 step 3). Objects
//! pass2 found with stat-data but no directory entry pointing at them are
//! real, recoverable data; losing them silently is worse than surfacing
//! them somewhere findable.

use std::collections::HashMap;

use crate::error::CoreResult;
use crate::format::{LOST_FOUND_OBJECT_ID, ROOT_DIR_ID, ROOT_OBJECT_ID};
use crate::hash::{OFFSET_DOT, OFFSET_DOT_DOT};
use crate::item::directory::Directory;
use crate::item::stat_data::{StatData, StatDataFormat};
use crate::item::{ItemBody, ItemFlags, ItemHeader};
use crate::key::{Key, KeyFormat};
use crate::path::search_by_key;

use super::RepairEngine;

/// Check every directory's `.`/`..` against where it actually lives in the
/// tree: `.` must point at the directory itself, `..` at whichever
/// directory holds the one incoming entry that names it (the root is its
/// own parent). Entries that disagree are rewritten in place.
pub fn fix_parent_links(engine: &mut RepairEngine, fix: bool) -> CoreResult<()> {
    let leaves = if engine.recovered_leaves.is_empty() {
        super::collect_all_leaves(&mut engine.fs)?
    } else {
        let mut out = Vec::with_capacity(engine.recovered_leaves.len());
        for &block in &engine.recovered_leaves.clone() {
            let buf = engine.fs.cache_mut().read(0, block, engine.fs.sb.blocksize as usize)?;
            let data = buf.borrow().data().to_vec();
            engine.fs.cache_mut().close(buf);
            let leaf = crate::node::Leaf::decode(&data, engine.fs.sb.block_count)
                .map_err(|_| crate::error::CoreError::Inconsistent("recovered leaf failed to redecode".into()))?;
            out.push((block, leaf));
        }
        out
    };

    // Reverse map: an object named by a non-`.`/`..` entry has that
    // entry's owning directory as its true parent.
    let mut parent_of: HashMap<(u32, u32), (u32, u32)> = HashMap::new();
    for (_, leaf) in &leaves {
        for (ih, body) in &leaf.items {
            if let ItemBody::Directory(dir) = body {
                let owner = (ih.key.dir_id, ih.key.object_id);
                for (head, name) in &dir.entries {
                    if name == b"." || name == b".." {
                        continue;
                    }
                    parent_of.insert((head.target_dir_id, head.target_object_id), owner);
                }
            }
        }
    }

    let root = (ROOT_DIR_ID, ROOT_OBJECT_ID);
    let mut bad: Vec<(u32, Key, (u32, u32), (u32, u32))> = Vec::new();
    for (block, leaf) in &leaves {
        for (ih, body) in &leaf.items {
            let ItemBody::Directory(dir) = body else { continue };
            let owner = (ih.key.dir_id, ih.key.object_id);
            let expected_parent = *parent_of.get(&owner).unwrap_or(&root);
            for (head, name) in &dir.entries {
                let target = (head.target_dir_id, head.target_object_id);
                if name == b"." && target != owner {
                    bad.push((*block, ih.key, owner, expected_parent));
                } else if name == b".." && target != expected_parent {
                    bad.push((*block, ih.key, owner, expected_parent));
                }
            }
        }
    }

    if bad.is_empty() {
        return Ok(());
    }
    engine.findings.fixable += bad.len() as u64;
    if !fix {
        return Ok(());
    }

    let mut by_block: HashMap<u32, Vec<(Key, (u32, u32), (u32, u32))>> = HashMap::new();
    for (block, key, owner, parent) in bad {
        by_block.entry(block).or_default().push((key, owner, parent));
    }
    let fixed_count: u64 = by_block.values().map(|v| v.len() as u64).sum();
    for (block, fixes) in by_block {
        let data = {
            let buf = engine.fs.cache_mut().read(0, block, engine.fs.sb.blocksize as usize)?;
            let d = buf.borrow().data().to_vec();
            engine.fs.cache_mut().close(buf);
            d
        };
        let mut leaf = crate::node::Leaf::decode(&data, engine.fs.sb.block_count)
            .map_err(|_| crate::error::CoreError::Inconsistent("leaf failed to redecode".into()))?;
        for (ih, body) in leaf.items.iter_mut() {
            for (key, owner, parent) in &fixes {
                if ih.key != *key {
                    continue;
                }
                if let ItemBody::Directory(dir) = body {
                    for (head, name) in dir.entries.iter_mut() {
                        if name == b"." && head.offset == OFFSET_DOT {
                            head.target_dir_id = owner.0;
                            head.target_object_id = owner.1;
                        } else if name == b".." && head.offset == OFFSET_DOT_DOT {
                            head.target_dir_id = parent.0;
                            head.target_object_id = parent.1;
                        }
                    }
                    log::info!("fixed `.`/`..` targets for directory ({}, {})", owner.0, owner.1);
                }
            }
        }
        engine.log_pre_image(block)?;
        let buf = engine.fs.cache_mut().open(0, block, engine.fs.sb.blocksize as usize)?;
        {
            let mut inner = buf.borrow_mut();
            leaf.encode(inner.data_mut());
            inner.uptodate = true;
        }
        engine.fs.cache_mut().write(&buf)?;
        engine.fs.cache_mut().close(buf);
    }
    engine.findings.fixed += fixed_count;
    Ok(())
}

pub fn relink_lost_objects(engine: &mut RepairEngine, fix: bool) -> CoreResult<()> {
    if engine.orphan_objects.is_empty() {
        return Ok(());
    }
    engine.findings.fixable += engine.orphan_objects.len() as u64;
    if !fix {
        return Ok(());
    }

    ensure_lost_and_found(engine)?;

    let orphans: Vec<(u32, u32)> = engine.orphan_objects.iter().copied().collect();
    for (dir_id, object_id) in orphans {
        let name = format!("{object_id}").into_bytes();
        link_into_lost_and_found(engine, dir_id, object_id, &name)?;
        engine.findings.fixed += 1;
    }
    Ok(())
}

/// Create `lost+found` under the root directory if no directory item for
/// `LOST_FOUND_OBJECT_ID` exists yet.
fn ensure_lost_and_found(engine: &mut RepairEngine) -> CoreResult<()> {
    let key = Key::stat_data(ROOT_DIR_ID, LOST_FOUND_OBJECT_ID);
    let geo = engine.fs.geometry();
    let (path, result) = search_by_key(
        engine.fs.cache_mut(),
        geo.dev,
        engine.fs.sb.root_block,
        geo.blocksize,
        geo.device_blocks,
        &key,
    )?;
    let exists = result == crate::path::SearchResult::Found;
    path.release(engine.fs.cache_mut());
    if exists {
        return Ok(());
    }

    log::info!("creating lost+found (object id {LOST_FOUND_OBJECT_ID})");
    let dir = Directory::seed(LOST_FOUND_OBJECT_ID, LOST_FOUND_OBJECT_ID, ROOT_DIR_ID, ROOT_OBJECT_ID);
    let sd = StatData {
        format: StatDataFormat::V2,
        mode: 0o40755,
        nlink: 2,
        size: dir.encoded_len() as u64,
        uid: 0,
        gid: 0,
        atime: 0,
        mtime: 0,
        ctime: 0,
        first_direct_byte_or_generation: 0,
        blocks: 1,
    };
    insert_item(engine, Key::stat_data(LOST_FOUND_OBJECT_ID, LOST_FOUND_OBJECT_ID), ItemBody::StatData(sd), 0)?;
    let entry_count = dir.entry_count();
    insert_item(
        engine,
        Key::new(LOST_FOUND_OBJECT_ID, LOST_FOUND_OBJECT_ID, 1, crate::key::ItemKind::Directory),
        ItemBody::Directory(dir),
        entry_count,
    )?;

    add_entry_to_directory(engine, ROOT_DIR_ID, ROOT_OBJECT_ID, b"lost+found", LOST_FOUND_OBJECT_ID, LOST_FOUND_OBJECT_ID)
}

fn link_into_lost_and_found(engine: &mut RepairEngine, target_dir_id: u32, target_object_id: u32, name: &[u8]) -> CoreResult<()> {
    add_entry_to_directory(engine, LOST_FOUND_OBJECT_ID, LOST_FOUND_OBJECT_ID, name, target_dir_id, target_object_id)
}

/// Add one entry to the directory item owned by `(owner_dir_id,
/// owner_object_id)`, re-encoding and rewriting that single leaf item in
/// place. Assumes the directory still fits in its existing leaf after
/// growing by one entry — true for the small number of relinks a single
/// fsck run produces, but unlike `insert_leaf_item` this does not split a
/// leaf that overflows; a `lost+found` that outgrows its leaf across many
/// runs would need that handled through the balancer instead.
fn add_entry_to_directory(
    engine: &mut RepairEngine,
    owner_dir_id: u32,
    owner_object_id: u32,
    name: &[u8],
    target_dir_id: u32,
    target_object_id: u32,
) -> CoreResult<()> {
    let dir_key = Key::new(owner_dir_id, owner_object_id, 1, crate::key::ItemKind::Directory);
    let geo = engine.fs.geometry();
    let (path, result) = search_by_key(
        engine.fs.cache_mut(),
        geo.dev,
        engine.fs.sb.root_block,
        geo.blocksize,
        geo.device_blocks,
        &dir_key,
    )?;
    if result != crate::path::SearchResult::Found {
        path.release(engine.fs.cache_mut());
        return Err(crate::error::CoreError::Inconsistent(format!(
            "directory ({owner_dir_id}, {owner_object_id}) has no directory item to link into"
        )));
    }

    let block = path.leaf().buffer.key().block;
    let position = path.leaf().position;
    let mut leaf = path.leaf_decoded(geo.device_blocks)?;
    path.release(engine.fs.cache_mut());

    let (ih, body) = &mut leaf.items[position];
    let hash = engine.fs.sb.hash;
    if let ItemBody::Directory(dir) = body {
        let offset = dir.offset_for(hash, name);
        dir.insert_sorted(
            crate::item::directory::DirEntryHead {
                offset,
                target_dir_id,
                target_object_id,
                location: 0,
                visible: true,
            },
            name.to_vec(),
        );
        ih.entry_count_or_free = dir.entry_count() as u16;
    } else {
        return Err(crate::error::CoreError::Inconsistent("expected a directory item".into()));
    }

    engine.log_pre_image(block)?;
    let buf = engine.fs.cache_mut().open(geo.dev, block, geo.blocksize as usize)?;
    {
        let mut inner = buf.borrow_mut();
        leaf.encode(inner.data_mut());
        inner.uptodate = true;
    }
    engine.fs.cache_mut().write(&buf)?;
    engine.fs.cache_mut().close(buf);
    Ok(())
}

fn insert_item(engine: &mut RepairEngine, key: Key, body: ItemBody, entry_count: usize) -> CoreResult<()> {
    let geo = engine.fs.geometry();
    let (path, result) = search_by_key(
        engine.fs.cache_mut(),
        geo.dev,
        engine.fs.sb.root_block,
        geo.blocksize,
        geo.device_blocks,
        &key,
    )?;
    if result == crate::path::SearchResult::Found {
        path.release(engine.fs.cache_mut());
        return Ok(());
    }
    let position = path.leaf().position;
    let leaf_block = path.leaf().buffer.key().block;
    let header = ItemHeader {
        key,
        format: KeyFormat::Long,
        item_len: body.encoded_len() as u16,
        item_location: 0,
        entry_count_or_free: entry_count as u16,
        flags: ItemFlags::empty(),
    };
    // `insert_leaf_item`'s alloc closure can't borrow `engine.fs` itself
    // (the cache borrow below is already live for the call), so pre-allocate
    // the blocks a worst-case cascading split all the way to a new root
    // could need: one per tree level plus the two halves of a fresh root.
    let spare_needed = engine.fs.sb.tree_height as usize + 2;
    let mut spare: Vec<u32> = (0..spare_needed).filter_map(|_| engine.fs.alloc_block()).collect();
    // A split writes into the spare blocks too; the leaf itself is always
    // touched, so its pre-image is the one we can log unconditionally here.
    engine.log_pre_image(leaf_block)?;
    for &s in &spare {
        engine.log_pre_image(s)?;
    }

    let mut root_block = engine.fs.sb.root_block;
    let mut tree_height = engine.fs.sb.tree_height;
    let result = crate::balance::insert_leaf_item(
        engine.fs.cache_mut(),
        &geo,
        path,
        &mut root_block,
        &mut tree_height,
        position,
        header,
        body,
        || spare.pop(),
    );
    engine.fs.sb.root_block = root_block;
    engine.fs.sb.tree_height = tree_height;
    for leftover in spare {
        engine.fs.free_block(leftover);
    }
    result
}
