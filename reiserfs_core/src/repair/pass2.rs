//! Pass 2: semantic checks (spec.md §4.9 step 2) — does every directory
//! entry point at an object that actually has stat-data, does every
//! object's stat-data agree with what references it, are directory items
//! themselves well-formed. Also home of `--clean-attributes`, which only
//! clears the repair bookkeeping bits a previous run may have left behind.

use std::collections::{HashMap, HashSet};

use crate::error::CoreResult;
use crate::item::stat_data::{S_IFDIR, S_IFMT, S_IFREG};
use crate::item::{ItemBody, ItemFlags};
use crate::key::Key;

use super::RepairEngine;

/// One object's worth of information gathered while walking the tree:
/// whether it has stat-data, how many directory entries (orphan-relevant
/// ones, i.e. not `.`/`..`) point at it, its true link count counting
/// every incoming name including `.`/`..`, whether it has a directory
/// item of its own, and the size/block-count its data items actually add
/// up to.
#[derive(Default)]
struct ObjectInfo {
    has_stat_data: bool,
    referenced_by: u32,
    link_count: u32,
    is_directory: bool,
    size_bytes: u64,
    data_blocks: u64,
}

pub fn check_semantics(engine: &mut RepairEngine, fix: bool) -> CoreResult<()> {
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

    let mut objects: HashMap<(u32, u32), ObjectInfo> = HashMap::new();
    // (block the directory item lives in, that item's key, the dangling entry's name)
    let mut dangling: Vec<(u32, Key, Vec<u8>)> = Vec::new();
    // (block, item key) of directory items whose entries fail `check`
    // (hash mismatch or broken sort/location invariants).
    let mut bad_hash: Vec<(u32, Key)> = Vec::new();

    let blocksize = engine.fs.sb.blocksize as u64;
    for (block, leaf) in &leaves {
        for (ih, body) in &leaf.items {
            match body {
                ItemBody::StatData(_) => {
                    objects.entry((ih.key.dir_id, ih.key.object_id)).or_default().has_stat_data = true;
                }
                ItemBody::Directory(dir) => {
                    objects.entry((ih.key.dir_id, ih.key.object_id)).or_default().is_directory = true;
                    if !dir.check(engine.fs.sb.hash) {
                        engine.findings.fixable += 1;
                        bad_hash.push((*block, ih.key));
                    }
                    for (head, name) in &dir.entries {
                        let target = (head.target_dir_id, head.target_object_id);
                        objects.entry(target).or_default().link_count += 1;
                        if name == b"." || name == b".." {
                            continue;
                        }
                        objects.entry(target).or_default().referenced_by += 1;
                    }
                }
                ItemBody::Direct(bytes) => {
                    let end = ih.key.offset + bytes.len() as u64;
                    let info = objects.entry((ih.key.dir_id, ih.key.object_id)).or_default();
                    info.size_bytes = info.size_bytes.max(end);
                }
                ItemBody::Extent(e) => {
                    let end_blocks = ih.key.offset + e.pointers.len() as u64;
                    let info = objects.entry((ih.key.dir_id, ih.key.object_id)).or_default();
                    info.size_bytes = info.size_bytes.max(end_blocks * blocksize);
                    info.data_blocks += e.pointers.iter().filter(|&&p| p != 0).count() as u64;
                }
            }
        }
    }

    for (block, leaf) in &leaves {
        for (ih, body) in &leaf.items {
            if let ItemBody::Directory(dir) = body {
                for (head, name) in &dir.entries {
                    if name == b"." || name == b".." {
                        continue;
                    }
                    let target = (head.target_dir_id, head.target_object_id);
                    if !objects.get(&target).map(|o| o.has_stat_data).unwrap_or(false) {
                        dangling.push((*block, ih.key, name.clone()));
                    }
                }
            }
        }
    }

    if !dangling.is_empty() {
        engine.findings.fixable += dangling.len() as u64;
        if fix {
            let mut by_block: HashMap<u32, Vec<(Key, Vec<u8>)>> = HashMap::new();
            for (block, key, name) in &dangling {
                by_block.entry(*block).or_default().push((*key, name.clone()));
            }
            for (block, removals) in by_block {
                let data = {
                    let buf = engine.fs.cache_mut().read(0, block, engine.fs.sb.blocksize as usize)?;
                    let d = buf.borrow().data().to_vec();
                    engine.fs.cache_mut().close(buf);
                    d
                };
                let mut leaf = crate::node::Leaf::decode(&data, engine.fs.sb.block_count)
                    .map_err(|_| crate::error::CoreError::Inconsistent("leaf failed to redecode".into()))?;
                for (ih, body) in leaf.items.iter_mut() {
                    if let ItemBody::Directory(dir) = body {
                        for (key, name) in &removals {
                            if ih.key == *key && dir.remove_by_name(name) {
                                log::info!(
                                    "removing dangling directory entry {:?} from ({}, {})",
                                    String::from_utf8_lossy(name),
                                    key.dir_id,
                                    key.object_id
                                );
                                ih.entry_count_or_free = dir.entry_count() as u16;
                            }
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
            engine.findings.fixed += dangling.len() as u64;
        }
    }

    if !bad_hash.is_empty() && fix {
        let mut by_block: HashMap<u32, Vec<Key>> = HashMap::new();
        for (block, key) in &bad_hash {
            by_block.entry(*block).or_default().push(*key);
        }
        for (block, keys) in by_block {
            let data = {
                let buf = engine.fs.cache_mut().read(0, block, engine.fs.sb.blocksize as usize)?;
                let d = buf.borrow().data().to_vec();
                engine.fs.cache_mut().close(buf);
                d
            };
            let mut leaf = crate::node::Leaf::decode(&data, engine.fs.sb.block_count)
                .map_err(|_| crate::error::CoreError::Inconsistent("leaf failed to redecode".into()))?;
            for (ih, body) in leaf.items.iter_mut() {
                if keys.contains(&ih.key) {
                    if let ItemBody::Directory(dir) = body {
                        dir.rehash(engine.fs.sb.hash);
                        ih.entry_count_or_free = dir.entry_count() as u16;
                        ih.item_len = dir.encoded_len() as u16;
                        log::info!("re-hashed directory entries for object ({}, {})", ih.key.dir_id, ih.key.object_id);
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
        engine.findings.fixed += bad_hash.len() as u64;
    }

    // Recompute each object's nlink/size/blocks/mode-type bits against
    // what its directory entries and data items actually show, and find
    // which leaf/key its stat-data item lives at so a fix can rewrite it.
    let mut stat_locations: HashMap<(u32, u32), (u32, Key)> = HashMap::new();
    for (block, leaf) in &leaves {
        for (ih, body) in &leaf.items {
            if matches!(body, ItemBody::StatData(_)) {
                stat_locations.insert((ih.key.dir_id, ih.key.object_id), (*block, ih.key));
            }
        }
    }

    let mut bad_stat: Vec<(u32, Key, u32, u64, u64, bool)> = Vec::new();
    for (&object, info) in &objects {
        if !info.has_stat_data {
            continue;
        }
        let Some(&(block, key)) = stat_locations.get(&object) else { continue };
        let leaf = leaves.iter().find(|(b, _)| *b == block).map(|(_, l)| l);
        let Some(leaf) = leaf else { continue };
        let Some((_, ItemBody::StatData(sd))) = leaf.items.iter().find(|(ih, _)| ih.key == key) else { continue };

        let mismatched = sd.nlink != info.link_count
            || sd.size != info.size_bytes
            || sd.blocks != info.data_blocks
            || (info.is_directory && sd.mode & S_IFMT != S_IFDIR)
            || (!info.is_directory && sd.mode & S_IFMT == S_IFDIR);
        if mismatched {
            bad_stat.push((block, key, info.link_count, info.size_bytes, info.data_blocks, info.is_directory));
        }
    }

    if !bad_stat.is_empty() {
        engine.findings.fixable += bad_stat.len() as u64;
        if fix {
            let fixed_count = bad_stat.len() as u64;
            let mut by_block: HashMap<u32, Vec<(Key, u32, u64, u64, bool)>> = HashMap::new();
            for (block, key, nlink, size, blocks, is_dir) in bad_stat {
                by_block.entry(block).or_default().push((key, nlink, size, blocks, is_dir));
            }
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
                    for (key, nlink, size, blocks, is_dir) in &fixes {
                        if ih.key != *key {
                            continue;
                        }
                        if let ItemBody::StatData(sd) = body {
                            sd.nlink = *nlink;
                            sd.size = *size;
                            sd.blocks = *blocks;
                            sd.mode = (sd.mode & !S_IFMT) | if *is_dir { S_IFDIR } else if sd.mode & S_IFMT == S_IFDIR { S_IFREG } else { sd.mode & S_IFMT };
                            log::info!(
                                "recomputed stat-data for object ({}, {}): nlink={} size={} blocks={}",
                                key.dir_id,
                                key.object_id,
                                nlink,
                                size,
                                blocks
                            );
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
        }
    }

    // Objects with stat-data but zero incoming references (besides
    // `.`/`..`) are orphans pass3 will need to relink; record them so that
    // pass doesn't have to re-walk the tree.
    let orphans: HashSet<(u32, u32)> = objects
        .iter()
        .filter(|(_, info)| info.has_stat_data && info.referenced_by == 0)
        .map(|(&k, _)| k)
        .collect();
    engine.orphan_objects = orphans;

    Ok(())
}

/// `--clean-attributes`: clear the repair bookkeeping bits
/// (`UNREACHABLE`/`CHECKED`/`UNALIGNED`) a previous interrupted run left on
/// item headers, leaving `HAS_TAIL` (a real on-disk fact, not bookkeeping)
/// untouched.
pub fn clean_attributes(engine: &mut RepairEngine) -> CoreResult<()> {
    let leaves = super::collect_all_leaves(&mut engine.fs)?;
    for (block, mut leaf) in leaves {
        let mut changed = false;
        for (ih, _) in leaf.items.iter_mut() {
            let bookkeeping = ItemFlags::UNREACHABLE | ItemFlags::CHECKED | ItemFlags::UNALIGNED;
            if ih.flags.intersects(bookkeeping) {
                ih.flags.remove(bookkeeping);
                changed = true;
            }
        }
        if changed {
            engine.log_pre_image(block)?;
            let buf = engine.fs.cache_mut().open(0, block, engine.fs.sb.blocksize as usize)?;
            {
                let mut inner = buf.borrow_mut();
                leaf.encode(inner.data_mut());
                inner.uptodate = true;
            }
            engine.fs.cache_mut().write(&buf)?;
            engine.fs.cache_mut().close(buf);
            engine.findings.fixed += 1;
        }
    }
    Ok(())
}
