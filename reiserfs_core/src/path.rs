//! Tree search (spec.md §4.4): a `Path` is the root-to-leaf stack of
//! pinned buffers and child positions a search walked through, kept
//! alive so the balancer can revisit ancestors without re-reading them
//! and so callers can ask for the item/leaf immediately left or right of
//! where the search landed.

use crate::cache::{Buffer, BufferCache};
use crate::error::{CoreError, CoreResult};
use crate::key::Key;
use crate::node::{BlockHead, Internal, Leaf};

/// Reiserfs trees are shallow by construction (4K items per node at
/// minimum branching); five levels comfortably covers any volume this
/// toolkit can format.
pub const TREE_HEIGHT_MAX: usize = 5;

/// One level of a `Path`: the buffer for that level's block, and the
/// index into that block's item/pointer array the search descended (or
/// landed on, at the leaf).
#[derive(Clone)]
pub struct PathElement {
    pub buffer: Buffer,
    pub position: usize,
}

/// Whether a key search landed exactly on an item or only at the
/// position it would be inserted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found,
    NotFound,
}

pub struct Path {
    pub elements: Vec<PathElement>,
}

impl Path {
    pub fn leaf(&self) -> &PathElement {
        self.elements.last().expect("path has no levels")
    }

    pub fn leaf_decoded(&self, device_blocks: u32) -> CoreResult<Leaf> {
        let data = self.leaf().buffer.borrow().data().to_vec();
        Leaf::decode(&data, device_blocks).map_err(|_| CoreError::Inconsistent("leaf decode failed".into()))
    }

    pub fn depth(&self) -> usize {
        self.elements.len()
    }

    /// Release every buffer this path holds pinned (spec.md: `pathrelse`).
    /// Consumes the path; a `Path` left unreleased is a pin leak.
    pub fn release(self, cache: &mut BufferCache) {
        for elem in self.elements {
            cache.close(elem.buffer);
        }
    }
}

/// Search the tree rooted at `root_block` for `key`, returning the
/// resulting path and whether the key was found exactly.
pub fn search_by_key(
    cache: &mut BufferCache,
    dev: u32,
    root_block: u32,
    blocksize: u32,
    device_blocks: u32,
    key: &Key,
) -> CoreResult<(Path, SearchResult)> {
    let mut elements = Vec::with_capacity(TREE_HEIGHT_MAX);
    let mut block = root_block;

    loop {
        let buffer = cache.read(dev, block, blocksize as usize)?;
        let head = BlockHead::decode(&buffer.borrow().data());

        if head.is_leaf() {
            let data = buffer.borrow().data().to_vec();
            let leaf = Leaf::decode(&data, device_blocks).map_err(|_| CoreError::Inconsistent("bad leaf".into()))?;
            let pos = leaf.items.partition_point(|(ih, _)| ih.key < *key);
            let found = pos < leaf.items.len() && leaf.items[pos].0.key == *key;
            elements.push(PathElement { buffer, position: pos });
            return Ok((Path { elements }, if found { SearchResult::Found } else { SearchResult::NotFound }));
        }

        let data = buffer.borrow().data().to_vec();
        let internal = Internal::decode(&data).map_err(|_| CoreError::Inconsistent("bad internal node".into()))?;
        let pos = internal.keys.partition_point(|k| *k <= *key);
        elements.push(PathElement { buffer, position: pos });
        block = internal.pointers[pos];

        if elements.len() >= TREE_HEIGHT_MAX {
            return Err(CoreError::Inconsistent("tree deeper than TREE_HEIGHT_MAX".into()));
        }
    }
}

/// Re-descend to the leaf immediately left of `path`'s leaf, reusing the
/// shared-ancestor prefix of the path and reading fresh blocks only below
/// the branch point. Returns `None` at the tree's leftmost leaf.
pub fn left_neighbor_leaf(
    cache: &mut BufferCache,
    dev: u32,
    blocksize: u32,
    path: &Path,
) -> CoreResult<Option<Leaf>> {
    sibling_leaf(cache, dev, blocksize, path, Direction::Left)
}

pub fn right_neighbor_leaf(
    cache: &mut BufferCache,
    dev: u32,
    blocksize: u32,
    path: &Path,
) -> CoreResult<Option<Leaf>> {
    sibling_leaf(cache, dev, blocksize, path, Direction::Right)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Left,
    Right,
}

fn sibling_leaf(
    cache: &mut BufferCache,
    dev: u32,
    blocksize: u32,
    path: &Path,
    dir: Direction,
) -> CoreResult<Option<Leaf>> {
    // Walk up from the parent of the leaf until we find a level where the
    // path didn't take the extreme (first/last) pointer, i.e. there's a
    // sibling subtree to descend into.
    let mut branch_level = None;
    for (level, elem) in path.elements.iter().enumerate().rev().skip(1) {
        let data = elem.buffer.borrow().data().to_vec();
        let internal = Internal::decode(&data).map_err(|_| CoreError::Inconsistent("bad internal node".into()))?;
        let at_extreme = match dir {
            Direction::Left => elem.position == 0,
            Direction::Right => elem.position == internal.pointers.len() - 1,
        };
        if !at_extreme {
            branch_level = Some((level, internal));
            break;
        }
    }

    let (level, internal) = match branch_level {
        Some(x) => x,
        None => return Ok(None),
    };

    let sibling_pos = match dir {
        Direction::Left => path.elements[level].position - 1,
        Direction::Right => path.elements[level].position + 1,
    };
    let mut block = internal.pointers[sibling_pos];

    // Descend to the leaf, always taking the rightmost child going left
    // or the leftmost child going right, since that's the child adjacent
    // to the original leaf.
    loop {
        let buffer = cache.read(dev, block, blocksize as usize)?;
        let head = BlockHead::decode(&buffer.borrow().data());
        if head.is_leaf() {
            let data = buffer.borrow().data().to_vec();
            let leaf = Leaf::decode(&data, u32::MAX).map_err(|_| CoreError::Inconsistent("bad leaf".into()))?;
            cache.close(buffer);
            return Ok(Some(leaf));
        }
        let data = buffer.borrow().data().to_vec();
        let child = Internal::decode(&data).map_err(|_| CoreError::Inconsistent("bad internal node".into()))?;
        cache.close(buffer);
        block = match dir {
            Direction::Left => *child.pointers.last().unwrap(),
            Direction::Right => child.pointers[0],
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::stat_data::{StatData, StatDataFormat};
    use crate::item::{ItemBody, ItemFlags, ItemHeader};
    use crate::key::{ItemKind, KeyFormat};
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

    fn setup_single_leaf() -> (BufferCache, u32, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let dev = crate::block::BlockDevice::create(&path, 4096, 100).unwrap();
        let leaf = Leaf { format: KeyFormat::Long, items: vec![sd_item(10), sd_item(20), sd_item(30)] };
        let mut buf = vec![0u8; 4096];
        leaf.encode(&mut buf);
        dev.write_block(5, &buf).unwrap();
        let mut cache = BufferCache::new();
        cache.register_device(0, Rc::new(dev));
        (cache, 5, dir)
    }

    #[test]
    fn search_finds_exact_key() {
        let (mut cache, root, _dir) = setup_single_leaf();
        let key = Key::stat_data(1, 20);
        let (path, result) = search_by_key(&mut cache, 0, root, 4096, 1_000_000, &key).unwrap();
        assert_eq!(result, SearchResult::Found);
        assert_eq!(path.leaf().position, 1);
        path.release(&mut cache);
    }

    #[test]
    fn search_reports_insertion_point_when_missing() {
        let (mut cache, root, _dir) = setup_single_leaf();
        let key = Key::stat_data(1, 15);
        let (path, result) = search_by_key(&mut cache, 0, root, 4096, 1_000_000, &key).unwrap();
        assert_eq!(result, SearchResult::NotFound);
        assert_eq!(path.leaf().position, 1);
        path.release(&mut cache);
    }
}
