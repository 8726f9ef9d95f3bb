//! The four item variants a leaf may hold (spec.md §3), their shared
//! item-header, and the neighbor-mergeability rule used by the balancer.

pub mod directory;
pub mod extent;
pub mod stat_data;

use bitflags::bitflags;

use crate::key::{ItemKind, Key, KeyFormat};

bitflags! {
    /// Flags carried in every item header. The last three are used
    /// exclusively by the repair engine (spec.md §3).
    pub struct ItemFlags: u8 {
        /// Not yet linked into the namespace by the repair engine.
        const UNREACHABLE = 0b0001;
        /// Already validated by the current repair pass.
        const CHECKED     = 0b0010;
        /// Direct item holds a file tail (as opposed to a full-block body).
        const HAS_TAIL    = 0b0100;
        /// Body length is not block-size aligned (repair bookkeeping).
        const UNALIGNED   = 0b1000;
    }
}

/// Sum type over a decoded item body (spec.md §9, "Sum-type items": the
/// leaf codec decodes once per access rather than re-inspecting the raw
/// header on every field access).
#[derive(Debug, Clone)]
pub enum ItemBody {
    StatData(stat_data::StatData),
    Direct(Vec<u8>),
    Extent(extent::Extent),
    Directory(directory::Directory),
}

impl ItemBody {
    pub fn kind(&self) -> ItemKind {
        match self {
            ItemBody::StatData(_) => ItemKind::StatData,
            ItemBody::Direct(_) => ItemKind::Direct,
            ItemBody::Extent(_) => ItemKind::Indirect,
            ItemBody::Directory(_) => ItemKind::Directory,
        }
    }

    /// Encoded byte length of the body (excludes the item header).
    pub fn encoded_len(&self) -> usize {
        match self {
            ItemBody::StatData(sd) => sd.encoded_len(),
            ItemBody::Direct(bytes) => bytes.len(),
            ItemBody::Extent(e) => e.encoded_len(),
            ItemBody::Directory(d) => d.encoded_len(),
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        match self {
            ItemBody::StatData(sd) => sd.encode(out),
            ItemBody::Direct(bytes) => out[..bytes.len()].copy_from_slice(bytes),
            ItemBody::Extent(e) => e.encode(out),
            ItemBody::Directory(d) => d.encode(out),
        }
    }
}

/// Header describing one item inside a leaf (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct ItemHeader {
    pub key: Key,
    pub format: KeyFormat,
    /// Byte length of the item body.
    pub item_len: u16,
    /// Byte offset of the item body within the leaf block.
    pub item_location: u16,
    /// Entry count for directory items, free-space-in-last-unformatted
    /// for extent items; unused (0) for stat-data/direct.
    pub entry_count_or_free: u16,
    pub flags: ItemFlags,
}

pub const ITEM_HEADER_LEN: usize = 24;

impl ItemHeader {
    pub fn encode(&self, buf: &mut [u8]) {
        use byteorder::{LittleEndian, WriteBytesExt};
        assert!(buf.len() >= ITEM_HEADER_LEN);
        let mut w = &mut buf[0..16];
        self.key.encode(self.format, &mut w);
        let mut rest = &mut buf[16..ITEM_HEADER_LEN];
        rest.write_u16::<LittleEndian>(self.item_len).unwrap();
        rest.write_u16::<LittleEndian>(self.item_location).unwrap();
        rest.write_u16::<LittleEndian>(self.entry_count_or_free).unwrap();
        // format occupies the low 12 bits, flags the high 4, of one u16
        // (spec.md §9: "packs format (12 bits) and flags (4 bits)").
        let format_bits: u16 = match self.format {
            KeyFormat::Short => 0,
            KeyFormat::Long => 1,
        };
        let packed = (format_bits & 0x0fff) | ((self.flags.bits() as u16) << 12);
        rest.write_u16::<LittleEndian>(packed).unwrap();
    }

    pub fn decode(buf: &[u8]) -> ItemHeader {
        use byteorder::{LittleEndian, ReadBytesExt};
        assert!(buf.len() >= ITEM_HEADER_LEN);
        // Format is determined by the caller (it's a tree-wide property,
        // not per-item), so we decode the key optimistically as long-form
        // here and let the leaf codec re-decode with the right format.
        let key = Key::decode_long(&buf[0..16]);
        let mut rest = &buf[16..ITEM_HEADER_LEN];
        let item_len = rest.read_u16::<LittleEndian>().unwrap();
        let item_location = rest.read_u16::<LittleEndian>().unwrap();
        let entry_count_or_free = rest.read_u16::<LittleEndian>().unwrap();
        let packed = rest.read_u16::<LittleEndian>().unwrap();
        let format = if packed & 0x0fff == 0 { KeyFormat::Short } else { KeyFormat::Long };
        let flags = ItemFlags::from_bits_truncate((packed >> 12) as u8);
        ItemHeader { key, format, item_len, item_location, entry_count_or_free, flags }
    }
}

/// Two half-open byte ranges `[a0, a1)` and `[b0, b1)`; do they touch or
/// overlap?
fn ranges_abut(a0: u64, a1: u64, b0: u64, b1: u64) -> bool {
    a0 == b1 || b0 == a1
}

/// Can `left` and `right` be merged into a single item (spec.md §4.6)?
/// Directories are always mergeable when adjacent by key; direct/extent
/// items merge when their byte ranges touch; stat-data never merges.
pub fn mergeable(left: &ItemHeader, right: &ItemHeader, _blocksize: u32) -> bool {
    if !left.key.same_object(&right.key) {
        return false;
    }
    if left.key.kind != right.key.kind {
        return false;
    }
    match left.key.kind {
        ItemKind::StatData => false,
        ItemKind::Directory => true,
        ItemKind::Direct => {
            let a0 = left.key.offset;
            let a1 = a0 + left.item_len as u64;
            let b0 = right.key.offset;
            let b1 = b0 + right.item_len as u64;
            ranges_abut(a0, a1, b0, b1)
        }
        ItemKind::Indirect => {
            let ptrs_left = left.item_len as u64 / 4;
            let ptrs_right = right.item_len as u64 / 4;
            let a0 = left.key.offset;
            let a1 = a0 + ptrs_left;
            let b0 = right.key.offset;
            let b1 = b0 + ptrs_right;
            ranges_abut(a0, a1, b0, b1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ItemKind;

    fn ih(kind: ItemKind, offset: u64, len: u16) -> ItemHeader {
        ItemHeader {
            key: Key::new(1, 100, offset, kind),
            format: KeyFormat::Long,
            item_len: len,
            item_location: 0,
            entry_count_or_free: 0,
            flags: ItemFlags::empty(),
        }
    }

    #[test]
    fn header_roundtrip() {
        let h = ih(ItemKind::Direct, 1, 5);
        let mut buf = [0u8; ITEM_HEADER_LEN];
        h.encode(&mut buf);
        let back = ItemHeader::decode(&buf);
        assert_eq!(back.key, h.key);
        assert_eq!(back.item_len, h.item_len);
        assert_eq!(back.format, h.format);
    }

    #[test]
    fn stat_data_never_mergeable() {
        let a = ih(ItemKind::StatData, 0, 44);
        let b = ih(ItemKind::StatData, 0, 44);
        assert!(!mergeable(&a, &b, 4096));
    }

    #[test]
    fn direct_items_merge_when_abutting() {
        let a = ih(ItemKind::Direct, 0, 8);
        let b = ih(ItemKind::Direct, 8, 8);
        assert!(mergeable(&a, &b, 4096));
        let c = ih(ItemKind::Direct, 9, 8);
        assert!(!mergeable(&a, &c, 4096));
    }

    #[test]
    fn directory_items_always_mergeable_same_object() {
        let a = ih(ItemKind::Directory, 0, 40);
        let b = ih(ItemKind::Directory, 100, 40);
        assert!(mergeable(&a, &b, 4096));
    }
}
