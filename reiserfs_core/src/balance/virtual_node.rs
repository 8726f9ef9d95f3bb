//! Virtual-node projection (spec.md §4.8): a byte-accounting model of
//! what a leaf would look like after a pending edit is applied, used by
//! `fix_nodes` to decide whether the real leaf needs to be split before
//! the edit is actually carried out.

use crate::item::{ItemBody, ItemHeader};
use crate::node::{Leaf, BLOCK_HEAD_LEN};

/// An edit the balancer is about to apply to one leaf.
#[derive(Debug, Clone)]
pub enum PendingEdit {
    InsertItem { position: usize, header: ItemHeader, body: ItemBody },
    DeleteItem { position: usize },
    /// Append bytes to an existing direct item, or encoded pointers to an
    /// existing extent item, at `position`.
    PasteIntoItem { position: usize, appended_len: usize },
}

impl PendingEdit {
    /// The leaf-item index this edit targets (insertion point for
    /// `InsertItem`, the item itself for `DeleteItem`/`PasteIntoItem`).
    pub fn position(&self) -> usize {
        match self {
            PendingEdit::InsertItem { position, .. } => *position,
            PendingEdit::DeleteItem { position } => *position,
            PendingEdit::PasteIntoItem { position, .. } => *position,
        }
    }

    /// This edit re-targeted at `position() - n`, for use once the first
    /// `n` items of the leaf have been shifted away to a left neighbor.
    pub fn shifted(&self, n: usize) -> PendingEdit {
        match self {
            PendingEdit::InsertItem { position, header, body } => {
                PendingEdit::InsertItem { position: position - n, header: *header, body: body.clone() }
            }
            PendingEdit::DeleteItem { position } => PendingEdit::DeleteItem { position: position - n },
            PendingEdit::PasteIntoItem { position, appended_len } => {
                PendingEdit::PasteIntoItem { position: position - n, appended_len: *appended_len }
            }
        }
    }

    fn header_delta(&self) -> isize {
        match self {
            PendingEdit::InsertItem { .. } => 1,
            PendingEdit::DeleteItem { .. } => -1,
            PendingEdit::PasteIntoItem { .. } => 0,
        }
    }

    fn body_delta(&self, leaf: &Leaf) -> isize {
        match self {
            PendingEdit::InsertItem { body, .. } => body.encoded_len() as isize,
            PendingEdit::DeleteItem { position } => -(leaf.items[*position].1.encoded_len() as isize),
            PendingEdit::PasteIntoItem { appended_len, .. } => *appended_len as isize,
        }
    }
}

/// Projects the byte size a leaf would occupy after applying `edit`,
/// without actually mutating it.
pub struct VirtualNode<'a> {
    pub leaf: &'a Leaf,
    pub edit: PendingEdit,
}

impl<'a> VirtualNode<'a> {
    pub fn new(leaf: &'a Leaf, edit: PendingEdit) -> Self {
        VirtualNode { leaf, edit }
    }

    /// Projected occupied bytes (header + item-header array + bodies)
    /// after the edit, ignoring any further splitting.
    pub fn projected_used_space(&self) -> usize {
        use crate::item::ITEM_HEADER_LEN;
        let current_headers = self.leaf.items.len() as isize;
        let headers_after = (current_headers + self.edit.header_delta()).max(0) as usize;

        let bodies_now: isize = self.leaf.items.iter().map(|(_, b)| b.encoded_len() as isize).sum();
        let bodies_after = (bodies_now + self.edit.body_delta(self.leaf)).max(0) as usize;

        BLOCK_HEAD_LEN + headers_after * ITEM_HEADER_LEN + bodies_after
    }

    pub fn fits(&self, blocksize: usize) -> bool {
        self.projected_used_space() <= blocksize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::stat_data::{StatData, StatDataFormat};
    use crate::item::{ItemFlags, ITEM_HEADER_LEN};
    use crate::key::{Key, KeyFormat};

    fn leaf_with_n_items(n: usize) -> Leaf {
        let mut items = Vec::new();
        for i in 0..n {
            let sd = StatData {
                format: StatDataFormat::V2,
                mode: 0,
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
                key: Key::stat_data(1, i as u32),
                format: KeyFormat::Long,
                item_len: sd.encoded_len() as u16,
                item_location: 0,
                entry_count_or_free: 0,
                flags: ItemFlags::empty(),
            };
            items.push((ih, ItemBody::StatData(sd)));
        }
        Leaf { format: KeyFormat::Long, items }
    }

    #[test]
    fn insert_projection_accounts_for_new_item() {
        let leaf = leaf_with_n_items(2);
        let before = VirtualNode::new(&leaf, PendingEdit::DeleteItem { position: 0 }).leaf.items.len();
        let sd = StatData {
            format: StatDataFormat::V2,
            mode: 0,
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
            key: Key::stat_data(1, 99),
            format: KeyFormat::Long,
            item_len: sd.encoded_len() as u16,
            item_location: 0,
            entry_count_or_free: 0,
            flags: ItemFlags::empty(),
        };
        let edit = PendingEdit::InsertItem { position: 1, header: ih, body: ItemBody::StatData(sd) };
        let vn = VirtualNode::new(&leaf, edit);
        assert_eq!(before, 2);
        assert_eq!(vn.projected_used_space(), BLOCK_HEAD_LEN + 3 * ITEM_HEADER_LEN + 3 * 44);
    }

    #[test]
    fn fits_respects_blocksize() {
        let leaf = leaf_with_n_items(1);
        let vn = VirtualNode::new(&leaf, PendingEdit::PasteIntoItem { position: 0, appended_len: 0 });
        assert!(vn.fits(4096));
        assert!(!vn.fits(10));
    }
}
