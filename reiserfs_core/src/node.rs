//! Formatted-node codec: the block header shared by leaves and internal
//! nodes, the leaf item-header/body layout, and the internal node's
//! key/pointer arrays (spec.md §3, §4.6).
//!
//! A leaf's level is always 1; internal nodes carry `level > 1` up to the
//! tree height recorded in the superblock. Both share a 24-byte header at
//! the start of the block.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::item::directory::Directory;
use crate::item::extent::Extent;
use crate::item::stat_data::{StatData, StatDataFormat};
use crate::item::{ItemBody, ItemHeader, ITEM_HEADER_LEN};
use crate::key::{ItemKind, Key, KeyFormat};

pub const BLOCK_HEAD_LEN: usize = 24;

/// Header common to every formatted block (spec.md §3: "block header").
#[derive(Debug, Clone, Copy)]
pub struct BlockHead {
    pub level: u16,
    pub item_count: u16,
    /// Bytes in the block not occupied by the header, item headers, item
    /// bodies (leaf) or key/pointer arrays (internal).
    pub free_space: u16,
    pub format: KeyFormat,
}

pub const LEAF_LEVEL: u16 = 1;

impl BlockHead {
    pub fn encode(&self, buf: &mut [u8]) {
        let mut w = &mut buf[0..BLOCK_HEAD_LEN];
        w.write_u16::<LittleEndian>(self.level).unwrap();
        w.write_u16::<LittleEndian>(self.item_count).unwrap();
        w.write_u16::<LittleEndian>(self.free_space).unwrap();
        let format_bit: u16 = match self.format {
            KeyFormat::Short => 0,
            KeyFormat::Long => 1,
        };
        w.write_u16::<LittleEndian>(format_bit).unwrap();
        // Remaining header bytes are reserved (the real format also keeps
        // a "reserved for future use" counter here; we don't use it).
        w.write_u32::<LittleEndian>(0).unwrap();
        w.write_u32::<LittleEndian>(0).unwrap();
        w.write_u32::<LittleEndian>(0).unwrap();
    }

    pub fn decode(buf: &[u8]) -> BlockHead {
        let mut r = &buf[0..BLOCK_HEAD_LEN];
        let level = r.read_u16::<LittleEndian>().unwrap();
        let item_count = r.read_u16::<LittleEndian>().unwrap();
        let free_space = r.read_u16::<LittleEndian>().unwrap();
        let format_bit = r.read_u16::<LittleEndian>().unwrap();
        let format = if format_bit == 0 { KeyFormat::Short } else { KeyFormat::Long };
        BlockHead { level, item_count, free_space, format }
    }

    pub fn is_leaf(&self) -> bool {
        self.level == LEAF_LEVEL
    }
}

/// A decoded leaf: item headers in tree order plus their decoded bodies.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub format: KeyFormat,
    pub items: Vec<(ItemHeader, ItemBody)>,
}

impl Leaf {
    pub fn empty(format: KeyFormat) -> Leaf {
        Leaf { format, items: Vec::new() }
    }

    pub fn free_space(&self, blocksize: u32) -> u16 {
        let used = BLOCK_HEAD_LEN
            + self.items.len() * ITEM_HEADER_LEN
            + self.items.iter().map(|(_, b)| b.encoded_len()).sum::<usize>();
        (blocksize as usize).saturating_sub(used) as u16
    }

    pub fn used_space(&self) -> usize {
        self.items.len() * ITEM_HEADER_LEN
            + self.items.iter().map(|(_, b)| b.encoded_len()).sum::<usize>()
    }

    pub fn decode(buf: &[u8], device_blocks: u32) -> Result<Leaf, DecodeError> {
        let head = BlockHead::decode(buf);
        if !head.is_leaf() {
            return Err(DecodeError::NotALeaf);
        }
        let mut items = Vec::with_capacity(head.item_count as usize);
        for i in 0..head.item_count as usize {
            let header_off = BLOCK_HEAD_LEN + i * ITEM_HEADER_LEN;
            let header_buf = buf
                .get(header_off..header_off + ITEM_HEADER_LEN)
                .ok_or(DecodeError::Truncated)?;
            // ItemHeader::decode guesses the key format; re-decode the key
            // using the node-level format we actually know here.
            let mut ih = ItemHeader::decode(header_buf);
            ih.key = Key::decode(head.format, &header_buf[0..16]);
            ih.format = head.format;

            let body_off = ih.item_location as usize;
            let body_len = ih.item_len as usize;
            let body_buf = buf.get(body_off..body_off + body_len).ok_or(DecodeError::Truncated)?;
            let body = decode_body(&ih, body_buf, device_blocks).ok_or(DecodeError::BadItem)?;
            items.push((ih, body));
        }
        Ok(Leaf { format: head.format, items })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        let blocksize = buf.len();
        let head = BlockHead {
            level: LEAF_LEVEL,
            item_count: self.items.len() as u16,
            free_space: self.free_space(blocksize as u32),
            format: self.format,
        };
        head.encode(buf);

        let mut body_end = blocksize;
        for (i, (ih, body)) in self.items.iter().enumerate() {
            let len = body.encoded_len();
            body_end -= len;
            let mut ih = *ih;
            ih.item_location = body_end as u16;
            ih.item_len = len as u16;
            let header_off = BLOCK_HEAD_LEN + i * ITEM_HEADER_LEN;
            ih.encode(&mut buf[header_off..header_off + ITEM_HEADER_LEN]);
            body.encode(&mut buf[body_end..body_end + len]);
        }
    }

    /// `leaf_valid` (spec.md §4.6): items are key-sorted, non-overlapping,
    /// each within bounds, and each passes its type-specific validator.
    pub fn valid(&self, blocksize: u32, device_blocks: u32, hash: crate::hash::HashKind) -> bool {
        for w in self.items.windows(2) {
            if w[0].0.key >= w[1].0.key {
                return false;
            }
        }
        let mut cursor = BLOCK_HEAD_LEN + self.items.len() * ITEM_HEADER_LEN;
        for (ih, body) in self.items.iter().rev() {
            if ih.item_len as usize != body.encoded_len() {
                return false;
            }
            cursor += ih.item_len as usize;
            if cursor > blocksize as usize {
                return false;
            }
            if !item_body_valid(ih, body, device_blocks, hash) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    NotALeaf,
    NotInternal,
    Truncated,
    BadItem,
}

fn decode_body(ih: &ItemHeader, buf: &[u8], device_blocks: u32) -> Option<ItemBody> {
    match ih.key.kind {
        ItemKind::StatData => {
            let format = if ih.item_len as usize == crate::item::stat_data::STAT_DATA_V1_LEN
                && ih.format == KeyFormat::Short
            {
                StatDataFormat::V1
            } else {
                StatDataFormat::V2
            };
            Some(ItemBody::StatData(StatData::decode(format, buf)))
        }
        ItemKind::Direct => Some(ItemBody::Direct(buf.to_vec())),
        ItemKind::Indirect => {
            if !Extent::check(buf.len(), buf, device_blocks) {
                return None;
            }
            Some(ItemBody::Extent(Extent::decode(buf)))
        }
        ItemKind::Directory => Some(ItemBody::Directory(Directory::decode(ih.entry_count_or_free as usize, buf))),
    }
}

fn item_body_valid(ih: &ItemHeader, body: &ItemBody, device_blocks: u32, hash: crate::hash::HashKind) -> bool {
    match body {
        ItemBody::StatData(sd) => ih.key.offset == 0 && sd.encoded_len() == ih.item_len as usize,
        ItemBody::Direct(bytes) => bytes.len() == ih.item_len as usize,
        ItemBody::Extent(_) => {
            let mut raw = vec![0u8; ih.item_len as usize];
            body.encode(&mut raw);
            Extent::check(raw.len(), &raw, device_blocks)
        }
        ItemBody::Directory(d) => d.entry_count() == ih.entry_count_or_free as usize && d.check(hash),
    }
}

/// A decoded internal node: `item_count + 1` child block pointers
/// separated by `item_count` delimiting keys (spec.md §3).
#[derive(Debug, Clone)]
pub struct Internal {
    pub format: KeyFormat,
    pub keys: Vec<Key>,
    pub pointers: Vec<u32>,
    /// Used-space byte count of each child, parallel to `pointers`
    /// (spec.md §3: "the amount of used space in that child, for rapid
    /// balance checks"). A leaf child's entry is its `used_space()` plus
    /// the block header; an internal child's entry is its own
    /// `encoded_len()`.
    pub child_used_space: Vec<u16>,
}

const POINTER_LEN: usize = 4;
const CHILD_USED_LEN: usize = 2;

impl Internal {
    pub fn decode(buf: &[u8]) -> Result<Internal, DecodeError> {
        let head = BlockHead::decode(buf);
        if head.is_leaf() {
            return Err(DecodeError::NotInternal);
        }
        let key_len = Key::encoded_len(head.format);
        let key_area = BLOCK_HEAD_LEN;
        let ptr_area = key_area + head.item_count as usize * key_len;

        let mut keys = Vec::with_capacity(head.item_count as usize);
        for i in 0..head.item_count as usize {
            let off = key_area + i * key_len;
            let kb = buf.get(off..off + key_len).ok_or(DecodeError::Truncated)?;
            keys.push(Key::decode(head.format, kb));
        }

        let ptr_count = head.item_count as usize + 1;
        let mut pointers = Vec::with_capacity(ptr_count);
        let mut r = buf.get(ptr_area..ptr_area + ptr_count * POINTER_LEN).ok_or(DecodeError::Truncated)?;
        for _ in 0..ptr_count {
            pointers.push(r.read_u32::<LittleEndian>().unwrap());
        }

        let cub_area = ptr_area + ptr_count * POINTER_LEN;
        let mut cr = buf.get(cub_area..cub_area + ptr_count * CHILD_USED_LEN).ok_or(DecodeError::Truncated)?;
        let mut child_used_space = Vec::with_capacity(ptr_count);
        for _ in 0..ptr_count {
            child_used_space.push(cr.read_u16::<LittleEndian>().unwrap());
        }

        Ok(Internal { format: head.format, keys, pointers, child_used_space })
    }

    pub fn encode(&self, buf: &mut [u8], level: u16) {
        debug_assert_eq!(self.pointers.len(), self.keys.len() + 1);
        debug_assert_eq!(self.pointers.len(), self.child_used_space.len());
        let key_len = Key::encoded_len(self.format);
        let used = self.encoded_len();
        let head = BlockHead {
            level,
            item_count: self.keys.len() as u16,
            free_space: (buf.len().saturating_sub(used)) as u16,
            format: self.format,
        };
        head.encode(buf);

        let key_area = BLOCK_HEAD_LEN;
        for (i, k) in self.keys.iter().enumerate() {
            let off = key_area + i * key_len;
            k.encode(self.format, &mut buf[off..off + key_len]);
        }
        let ptr_area = key_area + self.keys.len() * key_len;
        {
            let mut w = &mut buf[ptr_area..ptr_area + self.pointers.len() * POINTER_LEN];
            for &p in &self.pointers {
                w.write_u32::<LittleEndian>(p).unwrap();
            }
        }
        let cub_area = ptr_area + self.pointers.len() * POINTER_LEN;
        let mut cw = &mut buf[cub_area..cub_area + self.child_used_space.len() * CHILD_USED_LEN];
        for &u in &self.child_used_space {
            cw.write_u16::<LittleEndian>(u).unwrap();
        }
    }

    /// Bytes this node would occupy on disk: header, key array, pointer
    /// array, and the parallel used-space array.
    pub fn encoded_len(&self) -> usize {
        let key_len = Key::encoded_len(self.format);
        BLOCK_HEAD_LEN + self.keys.len() * key_len + self.pointers.len() * (POINTER_LEN + CHILD_USED_LEN)
    }

    /// `internal_valid` (spec.md §4.6): delimiting keys are strictly
    /// increasing and every pointer is a plausible block number.
    pub fn valid(&self, device_blocks: u32) -> bool {
        if self.pointers.len() != self.keys.len() + 1 {
            return false;
        }
        if self.pointers.len() != self.child_used_space.len() {
            return false;
        }
        if self.keys.windows(2).any(|w| w[0] >= w[1]) {
            return false;
        }
        self.pointers.iter().all(|&p| p != 0 && p < device_blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::stat_data::{StatData, StatDataFormat};
    use crate::key::ItemKind;

    fn sd_item(object_id: u32) -> (ItemHeader, ItemBody) {
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
            key: Key::stat_data(1, object_id),
            format: KeyFormat::Long,
            item_len: sd.encoded_len() as u16,
            item_location: 0,
            entry_count_or_free: 0,
            flags: crate::item::ItemFlags::empty(),
        };
        (ih, ItemBody::StatData(sd))
    }

    #[test]
    fn leaf_roundtrip() {
        let leaf = Leaf { format: KeyFormat::Long, items: vec![sd_item(10), sd_item(20)] };
        let mut buf = vec![0u8; 4096];
        leaf.encode(&mut buf);
        let back = Leaf::decode(&buf, 1_000_000).unwrap();
        assert_eq!(back.items.len(), 2);
        assert_eq!(back.items[0].0.key, leaf.items[0].0.key);
        assert_eq!(back.items[1].0.key, leaf.items[1].0.key);
    }

    #[test]
    fn leaf_valid_rejects_unsorted_keys() {
        let mut leaf = Leaf { format: KeyFormat::Long, items: vec![sd_item(20), sd_item(10)] };
        let mut buf = vec![0u8; 4096];
        leaf.encode(&mut buf);
        // valid() operates on the in-memory Leaf directly; construct one
        // with a reversed key order to exercise the sortedness check.
        leaf.items.reverse();
        assert!(!leaf.valid(4096, 1_000_000, crate::hash::HashKind::R5));
    }

    #[test]
    fn internal_roundtrip() {
        let node = Internal {
            format: KeyFormat::Long,
            keys: vec![Key::new(1, 50, 0, ItemKind::StatData)],
            pointers: vec![5, 9],
            child_used_space: vec![100, 200],
        };
        let mut buf = vec![0u8; 4096];
        node.encode(&mut buf, 2);
        let back = Internal::decode(&buf).unwrap();
        assert_eq!(back.pointers, node.pointers);
        assert_eq!(back.keys, node.keys);
        assert_eq!(back.child_used_space, node.child_used_space);
    }

    #[test]
    fn internal_valid_rejects_bad_pointer_count() {
        let node = Internal { format: KeyFormat::Long, keys: vec![], pointers: vec![], child_used_space: vec![] };
        assert!(!node.valid(1000));
    }

    #[test]
    fn internal_valid_rejects_mismatched_used_space_array() {
        let node = Internal {
            format: KeyFormat::Long,
            keys: vec![],
            pointers: vec![5],
            child_used_space: vec![],
        };
        assert!(!node.valid(1000));
    }
}
