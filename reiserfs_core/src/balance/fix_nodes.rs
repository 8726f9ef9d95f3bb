//! The balancer's planning phase (spec.md §4.8): decide, without
//! mutating anything, whether a pending leaf edit fits in place, can be
//! absorbed by shifting whole items into a neighbor that has room
//! (`check_left`/`check_right`), or needs the leaf split.
//!
//! Shifting is tried before splitting because it keeps the tree's fill
//! factor higher and avoids minting a new block for an edit a neighbor
//! could have absorbed; `mergeable()` additionally steers a forced split
//! away from cutting between two items that could otherwise be combined.

use crate::balance::virtual_node::{PendingEdit, VirtualNode};
use crate::error::BalanceCode;
use crate::item::mergeable;
use crate::node::{Leaf, BLOCK_HEAD_LEN};

use super::do_balance::find_split_point;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafAction {
    /// The edit applies to the leaf as-is; nothing else moves.
    None,
    /// Move the leaf's first `n` items into the left neighbor before
    /// applying the edit to what remains.
    ShiftLeft(usize),
    /// Move the leaf's last `n` items into the right neighbor before
    /// applying the edit to what remains.
    ShiftRight(usize),
    /// No neighbor had room; split the post-edit leaf at this item index.
    Split(usize),
}

#[derive(Debug)]
pub struct LeafPlan {
    pub code: BalanceCode,
    pub action: LeafAction,
}

/// Bytes `items` would occupy inside a leaf, headers included.
fn items_bytes(items: &[(crate::item::ItemHeader, crate::item::ItemBody)]) -> usize {
    use crate::item::ITEM_HEADER_LEN;
    items.iter().map(|(_, b)| ITEM_HEADER_LEN + b.encoded_len()).sum()
}

/// Smallest `n` (capped at `max_n`) such that removing the leaf's first
/// `n` items leaves a remainder that, with `edit` re-targeted onto it,
/// fits in `blocksize`. `None` if no such `n` exists within the cap.
fn min_shift_left_for_fit(leaf: &Leaf, edit: &PendingEdit, max_n: usize, blocksize: usize) -> Option<usize> {
    for n in 0..=max_n {
        let remainder = Leaf { format: leaf.format, items: leaf.items[n..].to_vec() };
        let shifted = edit.shifted(n);
        if VirtualNode::new(&remainder, shifted).fits(blocksize) {
            return Some(n);
        }
    }
    None
}

fn min_shift_right_for_fit(leaf: &Leaf, edit: &PendingEdit, max_n: usize, blocksize: usize) -> Option<usize> {
    let total = leaf.items.len();
    for n in 0..=max_n {
        let remainder = Leaf { format: leaf.format, items: leaf.items[..total - n].to_vec() };
        if VirtualNode::new(&remainder, edit.clone()).fits(blocksize) {
            return Some(n);
        }
    }
    None
}

/// Plan a single leaf edit against the (optional) decoded left/right
/// neighbor under the same parent. `free_block_available` reports
/// whether the allocator has at least one block free, since only the
/// `Split` outcome needs one.
pub fn plan_leaf_edit(
    leaf: &Leaf,
    left: Option<&Leaf>,
    right: Option<&Leaf>,
    edit: PendingEdit,
    blocksize: usize,
    free_block_available: bool,
) -> LeafPlan {
    let vn = VirtualNode::new(leaf, edit.clone());
    if vn.fits(blocksize) {
        return LeafPlan { code: BalanceCode::NoBalancingNeeded, action: LeafAction::None };
    }

    // check_left: how many leading items would need to move out for the
    // remainder (plus the edit) to fit, and does the left neighbor have
    // room for that many?
    if let Some(left) = left {
        let edit_pos = edit.position();
        let max_n = match &edit {
            PendingEdit::InsertItem { .. } => edit_pos,
            _ => edit_pos, // DeleteItem/PasteIntoItem must keep the edited item in the remainder
        };
        if let Some(n) = min_shift_left_for_fit(leaf, &edit, max_n, blocksize) {
            if n > 0 {
                let left_after = BLOCK_HEAD_LEN + left.used_space() + items_bytes(&leaf.items[..n]);
                if left_after <= blocksize {
                    return LeafPlan { code: BalanceCode::CarryOn, action: LeafAction::ShiftLeft(n) };
                }
            }
        }
    }

    // check_right: same idea, moving a trailing run into the right
    // neighbor instead.
    if let Some(right) = right {
        let edit_pos = edit.position();
        let max_n = leaf.items.len().saturating_sub(edit_pos);
        if let Some(n) = min_shift_right_for_fit(leaf, &edit, max_n, blocksize) {
            if n > 0 {
                let total = leaf.items.len();
                let right_after = BLOCK_HEAD_LEN + right.used_space() + items_bytes(&leaf.items[total - n..]);
                if right_after <= blocksize {
                    return LeafPlan { code: BalanceCode::CarryOn, action: LeafAction::ShiftRight(n) };
                }
            }
        }
    }

    if !free_block_available {
        return LeafPlan { code: BalanceCode::NoDiskSpace, action: LeafAction::None };
    }

    let mut combined = leaf.clone();
    match &edit {
        PendingEdit::InsertItem { position, header, body } => {
            combined.items.insert(*position, (*header, body.clone()));
        }
        PendingEdit::DeleteItem { position } => {
            combined.items.remove(*position);
        }
        PendingEdit::PasteIntoItem { .. } => {
            // Paste targets are direct/extent items; the balancer applies
            // the byte append itself before calling into `fix_nodes` for
            // anything beyond a pure fits-check, so `combined` already
            // reflects the edit via `leaf` in that caller. Nothing to do
            // here but fall through to the generic split-point search.
        }
    }
    let mut split_at = find_split_point(&combined, blocksize);
    // Avoid splitting directly between two items that could be merged
    // into one; nudge the boundary over by one where that's still a
    // legal split point.
    if split_at > 0
        && split_at < combined.items.len()
        && mergeable(&combined.items[split_at - 1].0, &combined.items[split_at].0, blocksize as u32)
        && split_at + 1 < combined.items.len()
    {
        split_at += 1;
    }
    LeafPlan { code: BalanceCode::CarryOn, action: LeafAction::Split(split_at) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::stat_data::{StatData, StatDataFormat};
    use crate::item::{ItemBody, ItemFlags, ItemHeader};
    use crate::key::{Key, KeyFormat};

    fn sd_item(id: u32) -> (ItemHeader, ItemBody) {
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
    fn small_insert_needs_no_balancing() {
        let leaf = Leaf { format: KeyFormat::Long, items: vec![sd_item(1)] };
        let (ih, body) = sd_item(2);
        let edit = PendingEdit::InsertItem { position: 1, header: ih, body };
        let plan = plan_leaf_edit(&leaf, None, None, edit, 4096, true);
        assert_eq!(plan.code, BalanceCode::NoBalancingNeeded);
        assert_eq!(plan.action, LeafAction::None);
    }

    #[test]
    fn oversized_insert_without_neighbors_or_free_block_is_no_disk_space() {
        let items: Vec<_> = (0..80).map(sd_item).collect();
        let leaf = Leaf { format: KeyFormat::Long, items };
        let (ih, body) = sd_item(1000);
        let edit = PendingEdit::InsertItem { position: 40, header: ih, body };
        let plan = plan_leaf_edit(&leaf, None, None, edit, 256, false);
        assert_eq!(plan.code, BalanceCode::NoDiskSpace);
    }

    #[test]
    fn oversized_insert_with_free_block_plans_a_split() {
        let items: Vec<_> = (0..80).map(sd_item).collect();
        let leaf = Leaf { format: KeyFormat::Long, items };
        let (ih, body) = sd_item(1000);
        let edit = PendingEdit::InsertItem { position: 40, header: ih, body };
        let plan = plan_leaf_edit(&leaf, None, None, edit, 256, true);
        assert_eq!(plan.code, BalanceCode::CarryOn);
        assert!(matches!(plan.action, LeafAction::Split(_)));
    }

    #[test]
    fn oversized_insert_shifts_into_roomy_left_neighbor_instead_of_splitting() {
        let items: Vec<_> = (0..40).map(sd_item).collect();
        let leaf = Leaf { format: KeyFormat::Long, items };
        let left = Leaf { format: KeyFormat::Long, items: vec![] };
        let (ih, body) = sd_item(1000);
        let edit = PendingEdit::InsertItem { position: 39, header: ih, body };
        let plan = plan_leaf_edit(&leaf, Some(&left), None, edit, 512, false);
        assert_eq!(plan.code, BalanceCode::CarryOn);
        assert!(matches!(plan.action, LeafAction::ShiftLeft(_)));
    }

    #[test]
    fn oversized_insert_shifts_into_roomy_right_neighbor_when_left_is_full() {
        let items: Vec<_> = (0..40).map(sd_item).collect();
        let leaf = Leaf { format: KeyFormat::Long, items };
        let left_items: Vec<_> = (100..180).map(sd_item).collect();
        let left = Leaf { format: KeyFormat::Long, items: left_items };
        let right = Leaf { format: KeyFormat::Long, items: vec![] };
        let (ih, body) = sd_item(1000);
        let edit = PendingEdit::InsertItem { position: 0, header: ih, body };
        let plan = plan_leaf_edit(&leaf, Some(&left), Some(&right), edit, 512, false);
        assert_eq!(plan.code, BalanceCode::CarryOn);
        assert!(matches!(plan.action, LeafAction::ShiftRight(_)));
    }
}
