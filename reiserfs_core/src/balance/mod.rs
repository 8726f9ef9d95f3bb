//! The B+ tree balancer (spec.md §4.8): `fix_nodes` plans an edit without
//! touching disk, `do_balance` carries the plan out. This module ties the
//! two phases to the buffer cache and path machinery.
//!
//! Splits cascade from the edited leaf all the way to the root: each
//! internal level the new key/pointer pair lands on is itself re-checked
//! against `blocksize`, split again if it overflows, and the tree grows a
//! new root only once the cascade has climbed past the existing one.
//! Shifting into a neighbor is tried first (`fix_nodes::plan_leaf_edit`)
//! and is deliberately scoped to the leaf's immediate same-parent
//! siblings rather than `path`'s arbitrary cross-branch
//! `left_neighbor_leaf`/`right_neighbor_leaf`, which know nothing of
//! block numbers and can't report back far enough for this module to
//! write the result.

pub mod do_balance;
pub mod fix_nodes;
pub mod virtual_node;

use crate::cache::BufferCache;
use crate::error::{BalanceCode, CoreError, CoreResult};
use crate::item::{ItemBody, ItemHeader};
use crate::key::Key;
use crate::node::{BlockHead, Internal, Leaf, LEAF_LEVEL};
use crate::path::Path;

use do_balance::{
    find_internal_split_point, grow_root, insert_item, insert_key_ptr, remove_pointer,
    set_child_used_space, shrink_root, split_internal, split_leaf,
};
use fix_nodes::{plan_leaf_edit, LeafAction};
use virtual_node::PendingEdit;

/// Addressing and capacity the balancer needs but doesn't own.
pub struct TreeGeometry {
    pub dev: u32,
    pub blocksize: u32,
    pub device_blocks: u32,
}

fn write_leaf(cache: &mut BufferCache, geo: &TreeGeometry, block: u32, leaf: &Leaf) -> CoreResult<()> {
    let buf = cache.open(geo.dev, block, geo.blocksize as usize)?;
    {
        let mut inner = buf.borrow_mut();
        leaf.encode(inner.data_mut());
        inner.uptodate = true;
    }
    cache.write(&buf)?;
    cache.close(buf);
    Ok(())
}

fn write_internal(cache: &mut BufferCache, geo: &TreeGeometry, block: u32, node: &Internal, level: u16) -> CoreResult<()> {
    let buf = cache.open(geo.dev, block, geo.blocksize as usize)?;
    {
        let mut inner = buf.borrow_mut();
        node.encode(inner.data_mut(), level);
        inner.uptodate = true;
    }
    cache.write(&buf)?;
    cache.close(buf);
    Ok(())
}

fn read_leaf(cache: &mut BufferCache, geo: &TreeGeometry, block: u32) -> CoreResult<Leaf> {
    let buf = cache.read(geo.dev, block, geo.blocksize as usize)?;
    let data = buf.borrow().data().to_vec();
    cache.close(buf);
    Leaf::decode(&data, geo.device_blocks).map_err(|_| CoreError::Inconsistent("bad leaf".into()))
}

fn read_internal(cache: &mut BufferCache, geo: &TreeGeometry, block: u32) -> CoreResult<(Internal, u16)> {
    let buf = cache.read(geo.dev, block, geo.blocksize as usize)?;
    let data = buf.borrow().data().to_vec();
    cache.close(buf);
    let level = BlockHead::decode(&data).level;
    let node = Internal::decode(&data).map_err(|_| CoreError::Inconsistent("bad internal node".into()))?;
    Ok((node, level))
}

/// The immediate same-parent sibling leaves of the leaf `path` landed on,
/// read fresh from disk (not through the path's own pinned buffers, since
/// `fix_nodes` only needs their content to plan, not to hold them open).
fn sibling_leaves(
    cache: &mut BufferCache,
    geo: &TreeGeometry,
    path: &Path,
) -> CoreResult<(Option<Leaf>, Option<Leaf>)> {
    let depth = path.depth();
    if depth < 2 {
        return Ok((None, None));
    }
    let parent = &path.elements[depth - 2];
    let parent_data = parent.buffer.borrow().data().to_vec();
    let parent_node =
        Internal::decode(&parent_data).map_err(|_| CoreError::Inconsistent("bad parent internal node".into()))?;

    let left = if parent.position > 0 {
        Some(read_leaf(cache, geo, parent_node.pointers[parent.position - 1])?)
    } else {
        None
    };
    let right = if parent.position + 1 < parent_node.pointers.len() {
        Some(read_leaf(cache, geo, parent_node.pointers[parent.position + 1])?)
    } else {
        None
    };
    Ok((left, right))
}

/// Insert one item into the leaf `path` landed on. Tries shifting whole
/// items into a same-parent neighbor before splitting; a split cascades
/// upward through as many internal levels as overflow, growing a new
/// root only once the cascade outgrows the existing tree. `alloc` hands
/// out a fresh block number for a split-off leaf or internal node; it
/// returns `None` when the volume is full.
pub fn insert_leaf_item(
    cache: &mut BufferCache,
    geo: &TreeGeometry,
    path: Path,
    root_block: &mut u32,
    tree_height: &mut u16,
    position: usize,
    header: ItemHeader,
    body: ItemBody,
    mut alloc: impl FnMut() -> Option<u32>,
) -> CoreResult<()> {
    let leaf = path.leaf_decoded(geo.device_blocks)?;
    let leaf_block = path.leaf().buffer.key().block;
    let depth = path.depth();
    let (left, right) = sibling_leaves(cache, geo, &path)?;

    let edit = PendingEdit::InsertItem { position, header, body: body.clone() };
    let plan = plan_leaf_edit(&leaf, left.as_ref(), right.as_ref(), edit.clone(), geo.blocksize as usize, true);

    match plan.code {
        BalanceCode::NoBalancingNeeded => {
            let mut leaf = leaf;
            insert_item(&mut leaf, position, header, body);
            write_leaf(cache, geo, leaf_block, &leaf)?;
            refresh_parent_used_space(cache, geo, &path, leaf.used_space() as u16)?;
            path.release(cache);
            Ok(())
        }
        BalanceCode::NoDiskSpace => {
            path.release(cache);
            Err(CoreError::NoDiskSpace)
        }
        BalanceCode::CarryOn => match plan.action {
            LeafAction::ShiftLeft(n) => {
                let mut left = left.expect("ShiftLeft planned without a left neighbor");
                let mut remainder = Leaf { format: leaf.format, items: leaf.items[n..].to_vec() };
                left.items.extend(leaf.items[..n].iter().cloned());
                insert_item(&mut remainder, position - n, header, body.clone());
                let left_block = {
                    let parent = &path.elements[depth - 2];
                    let parent_data = parent.buffer.borrow().data().to_vec();
                    let parent_node = Internal::decode(&parent_data)
                        .map_err(|_| CoreError::Inconsistent("bad parent internal node".into()))?;
                    parent_node.pointers[parent.position - 1]
                };
                write_leaf(cache, geo, left_block, &left)?;
                write_leaf(cache, geo, leaf_block, &remainder)?;
                update_parent_after_shift(cache, geo, &path, left_block, left.used_space() as u16, remainder.used_space() as u16, remainder.items.first().map(|(ih, _)| ih.key))?;
                path.release(cache);
                Ok(())
            }
            LeafAction::ShiftRight(n) => {
                let mut right = right.expect("ShiftRight planned without a right neighbor");
                let total = leaf.items.len();
                let mut remainder = Leaf { format: leaf.format, items: leaf.items[..total - n].to_vec() };
                let tail: Vec<_> = leaf.items[total - n..].iter().cloned().collect();
                right.items.splice(0..0, tail);
                insert_item(&mut remainder, position, header, body.clone());
                let right_block = {
                    let parent = &path.elements[depth - 2];
                    let parent_data = parent.buffer.borrow().data().to_vec();
                    let parent_node = Internal::decode(&parent_data)
                        .map_err(|_| CoreError::Inconsistent("bad parent internal node".into()))?;
                    parent_node.pointers[parent.position + 1]
                };
                write_leaf(cache, geo, leaf_block, &remainder)?;
                write_leaf(cache, geo, right_block, &right)?;
                update_parent_after_shift(cache, geo, &path, leaf_block, remainder.used_space() as u16, right.used_space() as u16, right.items.first().map(|(ih, _)| ih.key))?;
                path.release(cache);
                Ok(())
            }
            LeafAction::Split(_) | LeafAction::None => {
                let mut combined = leaf.clone();
                insert_item(&mut combined, position, header, body);
                let split_at = match plan.action {
                    LeafAction::Split(at) => at,
                    _ => do_balance::find_split_point(&combined, geo.blocksize as usize),
                };
                let (new_left, new_right) = split_leaf(&combined, split_at);
                let delim = new_right.items.first().map(|(ih, _)| ih.key).ok_or_else(|| {
                    CoreError::Inconsistent("split produced an empty right leaf".into())
                })?;

                let right_block = alloc().ok_or(CoreError::NoDiskSpace)?;
                write_leaf(cache, geo, leaf_block, &new_left)?;
                write_leaf(cache, geo, right_block, &new_right)?;

                if depth == 1 {
                    let left_block = alloc().ok_or(CoreError::NoDiskSpace)?;
                    write_leaf(cache, geo, left_block, &new_left)?;
                    let new_root = grow_root(
                        new_left.format,
                        left_block,
                        new_left.used_space() as u16,
                        right_block,
                        new_right.used_space() as u16,
                        delim,
                    );
                    write_internal(cache, geo, *root_block, &new_root, LEAF_LEVEL + 1)?;
                    *tree_height += 1;
                    path.release(cache);
                    Ok(())
                } else {
                    cascade_insert_up(
                        cache,
                        geo,
                        &path,
                        depth - 2,
                        new_left.used_space() as u16,
                        Some((delim, right_block, new_right.used_space() as u16)),
                        root_block,
                        tree_height,
                        &mut alloc,
                    )?;
                    path.release(cache);
                    Ok(())
                }
            }
        },
    }
}

/// Update the leaf's entry in its immediate parent's `child_used_space`
/// after an in-place edit that didn't change the leaf's key range.
fn refresh_parent_used_space(cache: &mut BufferCache, geo: &TreeGeometry, path: &Path, used: u16) -> CoreResult<()> {
    let depth = path.depth();
    if depth < 2 {
        return Ok(());
    }
    let parent = &path.elements[depth - 2];
    let parent_block = parent.buffer.key().block;
    let parent_data = parent.buffer.borrow().data().to_vec();
    let mut parent_node =
        Internal::decode(&parent_data).map_err(|_| CoreError::Inconsistent("bad parent internal node".into()))?;
    let level = BlockHead::decode(&parent_data).level;
    set_child_used_space(&mut parent_node, parent.position, used);
    write_internal(cache, geo, parent_block, &parent_node, level)
}

/// After shifting items between the edited leaf and a same-parent
/// neighbor, refresh both children's recorded used-space and, since the
/// boundary between them moved, the delimiter key that separates them.
fn update_parent_after_shift(
    cache: &mut BufferCache,
    geo: &TreeGeometry,
    path: &Path,
    left_child_block: u32,
    left_used: u16,
    right_used: u16,
    new_delim: Option<Key>,
) -> CoreResult<()> {
    let depth = path.depth();
    let parent = &path.elements[depth - 2];
    let parent_block = parent.buffer.key().block;
    let parent_data = parent.buffer.borrow().data().to_vec();
    let mut parent_node =
        Internal::decode(&parent_data).map_err(|_| CoreError::Inconsistent("bad parent internal node".into()))?;
    let level = BlockHead::decode(&parent_data).level;
    let left_pos = parent_node.pointers.iter().position(|&p| p == left_child_block).ok_or_else(|| {
        CoreError::Inconsistent("shifted child not found in parent".into())
    })?;
    set_child_used_space(&mut parent_node, left_pos, left_used);
    set_child_used_space(&mut parent_node, left_pos + 1, right_used);
    if let Some(delim) = new_delim {
        if left_pos < parent_node.keys.len() {
            parent_node.keys[left_pos] = delim;
        }
    }
    write_internal(cache, geo, parent_block, &parent_node, level)
}

/// Apply a used-space refresh and, if present, a new key/pointer pair at
/// `path.elements[level]`, splitting that node and continuing the
/// cascade upward whenever the result overflows `geo.blocksize`. Grows a
/// new root once the cascade climbs past the current one.
#[allow(clippy::too_many_arguments)]
fn cascade_insert_up(
    cache: &mut BufferCache,
    geo: &TreeGeometry,
    path: &Path,
    mut level: usize,
    mut child_used_space: u16,
    mut new_entry: Option<(Key, u32, u16)>,
    root_block: &mut u32,
    tree_height: &mut u16,
    alloc: &mut impl FnMut() -> Option<u32>,
) -> CoreResult<()> {
    loop {
        let elem = &path.elements[level];
        let node_block = elem.buffer.key().block;
        let data = elem.buffer.borrow().data().to_vec();
        let mut node = Internal::decode(&data).map_err(|_| CoreError::Inconsistent("bad internal node".into()))?;
        let node_level = BlockHead::decode(&data).level;

        set_child_used_space(&mut node, elem.position, child_used_space);
        if let Some((key, ptr, used)) = new_entry.take() {
            insert_key_ptr(&mut node, elem.position, key, ptr, used);
        }

        if node.encoded_len() <= geo.blocksize as usize {
            write_internal(cache, geo, node_block, &node, node_level)?;
            return Ok(());
        }

        let split_at = find_internal_split_point(&node, geo.blocksize as usize);
        let (new_left, delim, new_right) = split_internal(&node, split_at);
        let right_block = alloc().ok_or(CoreError::NoDiskSpace)?;

        if level == 0 {
            let left_block = alloc().ok_or(CoreError::NoDiskSpace)?;
            write_internal(cache, geo, left_block, &new_left, node_level)?;
            write_internal(cache, geo, right_block, &new_right, node_level)?;
            let new_root = grow_root(
                new_left.format,
                left_block,
                new_left.encoded_len() as u16,
                right_block,
                new_right.encoded_len() as u16,
                delim,
            );
            write_internal(cache, geo, *root_block, &new_root, node_level + 1)?;
            *tree_height += 1;
            return Ok(());
        }

        write_internal(cache, geo, node_block, &new_left, node_level)?;
        write_internal(cache, geo, right_block, &new_right, node_level)?;
        child_used_space = new_left.encoded_len() as u16;
        new_entry = Some((delim, right_block, new_right.encoded_len() as u16));
        level -= 1;
    }
}

/// Minimum fraction of `blocksize` a leaf should hold before the balancer
/// tries to merge it into a same-parent neighbor on delete.
const MIN_FILL_NUM: usize = 1;
const MIN_FILL_DEN: usize = 2;

/// Delete the item `path` landed on, merging the leaf into a same-parent
/// neighbor if the deletion leaves it under-full and a neighbor has room,
/// and shrinking the root if that merge collapses it to a single child.
/// `free` reclaims a block whose contents were merged away.
pub fn delete_leaf_item(
    cache: &mut BufferCache,
    geo: &TreeGeometry,
    path: Path,
    root_block: &mut u32,
    tree_height: &mut u16,
    mut free: impl FnMut(u32),
) -> CoreResult<()> {
    let mut leaf = path.leaf_decoded(geo.device_blocks)?;
    let leaf_block = path.leaf().buffer.key().block;
    let position = path.leaf().position;
    let depth = path.depth();
    do_balance::delete_items(&mut leaf, position, 1);

    if depth == 1 {
        write_leaf(cache, geo, leaf_block, &leaf)?;
        path.release(cache);
        return Ok(());
    }

    let under_full = leaf.used_space() * MIN_FILL_DEN < geo.blocksize as usize * MIN_FILL_NUM;
    let (left, right) = sibling_leaves(cache, geo, &path)?;

    if under_full {
        if let Some(mut left_leaf) = left {
            let merged_used = left_leaf.used_space() + leaf_extra_bytes(&leaf);
            if merged_used <= geo.blocksize as usize {
                left_leaf.items.extend(leaf.items.iter().cloned());
                let parent = &path.elements[depth - 2];
                let parent_block = parent.buffer.key().block;
                let parent_data = parent.buffer.borrow().data().to_vec();
                let mut parent_node = Internal::decode(&parent_data)
                    .map_err(|_| CoreError::Inconsistent("bad parent internal node".into()))?;
                let parent_level = BlockHead::decode(&parent_data).level;
                let left_block = parent_node.pointers[parent.position - 1];
                write_leaf(cache, geo, left_block, &left_leaf)?;
                set_child_used_space(&mut parent_node, parent.position - 1, left_leaf.used_space() as u16);
                remove_pointer(&mut parent_node, parent.position);
                free(leaf_block);
                finish_delete_merge(cache, geo, parent_block, parent_node, parent_level, depth - 2, root_block, tree_height)?;
                path.release(cache);
                return Ok(());
            }
        }
        if let Some(mut right_leaf) = right {
            let merged_used = leaf.used_space() + leaf_extra_bytes(&right_leaf);
            if merged_used <= geo.blocksize as usize {
                leaf.items.extend(right_leaf.items.drain(..));
                let parent = &path.elements[depth - 2];
                let parent_block = parent.buffer.key().block;
                let parent_data = parent.buffer.borrow().data().to_vec();
                let mut parent_node = Internal::decode(&parent_data)
                    .map_err(|_| CoreError::Inconsistent("bad parent internal node".into()))?;
                let parent_level = BlockHead::decode(&parent_data).level;
                let right_block = parent_node.pointers[parent.position + 1];
                write_leaf(cache, geo, leaf_block, &leaf)?;
                set_child_used_space(&mut parent_node, parent.position, leaf.used_space() as u16);
                remove_pointer(&mut parent_node, parent.position + 1);
                free(right_block);
                finish_delete_merge(cache, geo, parent_block, parent_node, parent_level, depth - 2, root_block, tree_height)?;
                path.release(cache);
                return Ok(());
            }
        }
    }

    write_leaf(cache, geo, leaf_block, &leaf)?;
    refresh_parent_used_space(cache, geo, &path, leaf.used_space() as u16)?;
    path.release(cache);
    Ok(())
}

/// Bytes `leaf`'s items would add to another leaf's `used_space()`
/// total if merged in (header array entries plus bodies, no block head
/// of its own).
fn leaf_extra_bytes(leaf: &Leaf) -> usize {
    use crate::item::ITEM_HEADER_LEN;
    leaf.items.iter().map(|(_, b)| ITEM_HEADER_LEN + b.encoded_len()).sum()
}

/// Write back the parent node a leaf merge modified and, if it collapsed
/// to a single child, shrink the root by one level.
fn finish_delete_merge(
    cache: &mut BufferCache,
    geo: &TreeGeometry,
    parent_block: u32,
    parent_node: Internal,
    parent_level: u16,
    parent_path_level: usize,
    root_block: &mut u32,
    tree_height: &mut u16,
) -> CoreResult<()> {
    if parent_path_level == 0 {
        if let Some(only_child) = shrink_root(&parent_node) {
            let (child_node, child_level) = read_internal(cache, geo, only_child)?;
            write_internal(cache, geo, *root_block, &child_node, child_level)?;
            *tree_height -= 1;
            return Ok(());
        }
    }
    write_internal(cache, geo, parent_block, &parent_node, parent_level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockDevice;
    use crate::item::stat_data::{StatData, StatDataFormat};
    use crate::item::ItemFlags;
    use crate::key::KeyFormat;
    use crate::path::search_by_key;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn sd_item(id: u32) -> (ItemHeader, ItemBody) {
        let sd = StatData {
            format: StatDataFormat::V2,
            mode: 0o100644,
            nlink: 1,
            size: 0,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            first_direct_byte_or_generation: 0,
            blocks: 0,
        };
        let ih = ItemHeader {
            key: Key::stat_data(1, id),
            format: KeyFormat::Long,
            item_len: sd.encoded_len() as u16,
            item_location: 0,
            entry_count_or_free: 0,
            flags: ItemFlags::empty(),
        };
        (ih, ItemBody::StatData(sd))
    }

    #[test]
    fn insert_without_split_lands_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("img");
        let dev = BlockDevice::create(&img, 4096, 200).unwrap();
        let leaf = Leaf { format: KeyFormat::Long, items: vec![] };
        let mut buf = vec![0u8; 4096];
        leaf.encode(&mut buf);
        dev.write_block(10, &buf).unwrap();

        let mut cache = BufferCache::new();
        cache.register_device(0, Rc::new(dev));
        let geo = TreeGeometry { dev: 0, blocksize: 4096, device_blocks: 200 };
        let mut root_block = 10u32;
        let mut height = 1u16;

        let key = Key::stat_data(1, 5);
        let (path, _) = search_by_key(&mut cache, 0, root_block, 4096, 200, &key).unwrap();
        let (ih, body) = sd_item(5);
        let next_free = Rc::new(RefCell::new(50u32));
        let nf = next_free.clone();
        insert_leaf_item(&mut cache, &geo, path, &mut root_block, &mut height, 0, ih, body, move || {
            let mut b = nf.borrow_mut();
            let v = *b;
            *b += 1;
            Some(v)
        })
        .unwrap();

        let (path2, result) = search_by_key(&mut cache, 0, root_block, 4096, 200, &key).unwrap();
        assert_eq!(result, crate::path::SearchResult::Found);
        path2.release(&mut cache);
        assert_eq!(height, 1);
    }

    #[test]
    fn insert_past_capacity_splits_root_leaf_and_grows_tree() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("img");
        let dev = BlockDevice::create(&img, 256, 200).unwrap();
        let leaf = Leaf { format: KeyFormat::Long, items: (0..4).map(sd_item).collect() };
        let mut buf = vec![0u8; 256];
        leaf.encode(&mut buf);
        dev.write_block(10, &buf).unwrap();

        let mut cache = BufferCache::new();
        cache.register_device(0, Rc::new(dev));
        let geo = TreeGeometry { dev: 0, blocksize: 256, device_blocks: 200 };
        let mut root_block = 10u32;
        let mut height = 1u16;

        let key = Key::stat_data(1, 100);
        let (path, _) = search_by_key(&mut cache, 0, root_block, 256, 200, &key).unwrap();
        let (ih, body) = sd_item(100);
        let next_free = Rc::new(RefCell::new(50u32));
        let nf = next_free.clone();
        insert_leaf_item(&mut cache, &geo, path, &mut root_block, &mut height, 4, ih, body, move || {
            let mut b = nf.borrow_mut();
            let v = *b;
            *b += 1;
            Some(v)
        })
        .unwrap();

        assert_eq!(height, 2);
        let (path2, result) = search_by_key(&mut cache, 0, root_block, 256, 200, &key).unwrap();
        assert_eq!(result, crate::path::SearchResult::Found);
        path2.release(&mut cache);
    }
}
