//! Repair engine (spec.md §4.9): five passes over a volume that may have
//! lost some or all of its internal tree structure, driven by a
//! [`RepairMode`] chosen at the CLI. Passes 1-4 share one [`RepairEngine`]
//! so later passes can see what earlier ones found without re-scanning the
//! device.
//!
//! Grounded on the same buffer-cache/path/balance primitives `fs::FileSystem`
//! already exposes; the passes themselves are new, since no teacher module
//! does multi-pass filesystem reconstruction, but every block they touch
//! goes through the existing cache/bitmap/tree machinery rather than
//! inventing a second way to read or write a block.

pub mod pass0;
pub mod pass1;
pub mod pass2;
pub mod pass3;
pub mod pass4;
pub mod rollback;
pub mod state_dump;

use crate::bitmap::Bitmap;
use crate::error::CoreResult;
use crate::fs::FileSystem;
use crate::node::{BlockHead, Internal, Leaf};

use rollback::RollbackLog;

/// Exit codes (spec.md §6, "fsck exit status"): bit flags, not an ordinal
/// scale, since more than one condition can hold at once.
pub const EXIT_OK: i32 = 0;
pub const EXIT_FIXED: i32 = 1;
pub const EXIT_REBOOT: i32 = 2;
pub const EXIT_FIXABLE: i32 = 4;
pub const EXIT_FATAL: i32 = 8;
pub const EXIT_OPERATIONAL_ERROR: i32 = 16;
pub const EXIT_USER_CANCELLED: i32 = 32;

/// Which of fsck's six modes to run (spec.md §6 CLI surface).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairMode {
    Check,
    FixFixable,
    RebuildTree,
    RebuildSb,
    CleanAttributes,
    RollbackFsckChanges,
}

/// What a raw block turns out to be once probed, independent of whatever
/// the superblock or bitmap currently claim about it (spec.md §4.9,
/// "classify every block"; ported from `reiserfs_fs_block` in journal.c).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Out of device range.
    Invalid,
    Journal,
    Super,
    Bitmap,
    /// Decodes as a structurally valid leaf or internal node.
    Tree,
    Unformatted,
}

/// Running tally of what a pass found, reported back as the process exit
/// status (spec.md §6/§7).
#[derive(Debug, Clone, Copy, Default)]
pub struct Findings {
    pub fixable: u64,
    pub fixed: u64,
    pub fatal: u64,
}

impl Findings {
    pub fn exit_code(&self) -> i32 {
        let mut code = EXIT_OK;
        if self.fixed > 0 {
            code |= EXIT_FIXED;
        }
        if self.fixable > 0 {
            code |= EXIT_FIXABLE;
        }
        if self.fatal > 0 {
            code |= EXIT_FATAL;
        }
        code
    }
}

/// Classify `block` against the volume's known metadata regions before
/// falling back to "try decoding it".
pub fn classify_block(fs: &FileSystem, block: u32) -> BlockKind {
    if block >= fs.sb.block_count {
        return BlockKind::Invalid;
    }
    let sb_block = (crate::superblock::SuperBlock::disk_offset(fs.sb.version, fs.sb.blocksize)
        / fs.sb.blocksize as u64) as u32;
    if block == sb_block {
        return BlockKind::Super;
    }
    let spread = Bitmap::spread_layout(sb_block);
    if Bitmap::is_bitmap_block(spread, fs.sb.blocksize, sb_block, fs.sb.bmap_count as u32, block) {
        return BlockKind::Bitmap;
    }
    let journal = &fs.sb.journal;
    if block >= journal.first_block && block < journal.first_block + journal.dev_block_count {
        return BlockKind::Journal;
    }
    BlockKind::Tree
}

/// Read `block` and decide whether it's a valid leaf, a valid internal
/// node, or neither (in which case it's either genuinely unformatted data
/// or a formerly-tree block whose header was clobbered).
pub fn probe_tree_block(fs: &mut FileSystem, block: u32) -> CoreResult<ProbedBlock> {
    let device_blocks = fs.sb.block_count;
    let buf = fs.cache_mut().read(0, block, fs.sb.blocksize as usize)?;
    let data = buf.borrow().data().to_vec();
    fs.cache_mut().close(buf);

    let head = BlockHead::decode(&data);
    if head.is_leaf() {
        if let Ok(leaf) = Leaf::decode(&data, device_blocks) {
            if leaf.valid(fs.sb.blocksize, device_blocks, fs.sb.hash) {
                return Ok(ProbedBlock::Leaf(leaf));
            }
        }
    } else if let Ok(internal) = Internal::decode(&data) {
        if internal.valid(device_blocks) {
            return Ok(ProbedBlock::Internal(internal, head.level));
        }
    }
    Ok(ProbedBlock::Unformatted)
}

pub enum ProbedBlock {
    Leaf(Leaf),
    Internal(Internal, u16),
    Unformatted,
}

/// Depth-first walk of the tree rooted at `fs.sb.root_block`, returning
/// every leaf block in key order. Used by the passes that don't already
/// have a recovered-leaf list from pass1 (a healthy tree, or `--check`
/// against one that might not be).
pub fn collect_all_leaves(fs: &mut FileSystem) -> CoreResult<Vec<(u32, Leaf)>> {
    let mut out = Vec::new();
    let mut stack = vec![fs.sb.root_block];
    let device_blocks = fs.sb.block_count;
    while let Some(block) = stack.pop() {
        let buf = fs.cache_mut().read(0, block, fs.sb.blocksize as usize)?;
        let data = buf.borrow().data().to_vec();
        fs.cache_mut().close(buf);
        let head = BlockHead::decode(&data);
        if head.is_leaf() {
            if let Ok(leaf) = Leaf::decode(&data, device_blocks) {
                out.push((block, leaf));
            }
            continue;
        }
        if let Ok(internal) = Internal::decode(&data) {
            // Push in reverse so pointers are visited, and therefore
            // collected, in ascending key order.
            for &ptr in internal.pointers.iter().rev() {
                stack.push(ptr);
            }
        }
    }
    Ok(out)
}

/// Orchestrates one fsck run end to end. Holds the open filesystem plus
/// whatever state accumulates across passes (the rollback log, running
/// findings); individual passes are free functions taking `&mut self` so
/// `state_dump` can snapshot progress between any two of them.
pub struct RepairEngine {
    pub fs: FileSystem,
    pub mode: RepairMode,
    pub findings: Findings,
    pub rollback: Option<RollbackLog>,
    /// Blocks pass1 recovered as valid leaves, keyed by block number, kept
    /// around for pass2/pass3 to walk without re-reading the device.
    pub recovered_leaves: Vec<u32>,
    /// Objects pass2 found with stat-data but no incoming directory
    /// reference; pass3 relinks these under `lost+found`.
    pub orphan_objects: std::collections::HashSet<(u32, u32)>,
}

impl RepairEngine {
    pub fn new(fs: FileSystem, mode: RepairMode) -> RepairEngine {
        RepairEngine {
            fs,
            mode,
            findings: Findings::default(),
            rollback: None,
            recovered_leaves: Vec::new(),
            orphan_objects: std::collections::HashSet::new(),
        }
    }

    /// Enable the rollback log (fsck `-l <file>`): every block this run
    /// modifies gets its pre-image recorded first.
    pub fn with_rollback(mut self, path: impl AsRef<std::path::Path>) -> CoreResult<RepairEngine> {
        self.rollback = Some(RollbackLog::create(path)?);
        Ok(self)
    }

    /// Record `block`'s current on-disk contents to the rollback log, if
    /// one is active. Call before overwriting a block, never after.
    pub fn log_pre_image(&mut self, block: u32) -> CoreResult<()> {
        if self.rollback.is_none() {
            return Ok(());
        }
        let buf = self.fs.cache_mut().read(0, block, self.fs.sb.blocksize as usize)?;
        let data = buf.borrow().data().to_vec();
        self.fs.cache_mut().close(buf);
        self.rollback.as_mut().unwrap().record_pre_image(block, &data)?;
        Ok(())
    }

    /// Flush the superblock and bitmap, first logging their pre-images if a
    /// rollback log is active: both are written straight to the device by
    /// `FileSystem::flush`, bypassing the cache reads `log_pre_image` relies
    /// on elsewhere.
    fn flush_with_rollback(&mut self) -> CoreResult<()> {
        if self.rollback.is_some() {
            let sb_block = (crate::superblock::SuperBlock::disk_offset(self.fs.sb.version, self.fs.sb.blocksize)
                / self.fs.sb.blocksize as u64) as u32;
            self.log_pre_image(sb_block)?;
            let spread = Bitmap::spread_layout(sb_block);
            let bmap_count = self.fs.sb.bmap_count as u32;
            let blocksize = self.fs.sb.blocksize;
            for block in 0..self.fs.sb.block_count {
                if Bitmap::is_bitmap_block(spread, blocksize, sb_block, bmap_count, block) {
                    self.log_pre_image(block)?;
                }
            }
        }
        self.fs.flush()
    }

    /// Run the pass sequence appropriate to `self.mode` and return the
    /// process exit code (spec.md §6).
    pub fn run(&mut self) -> CoreResult<i32> {
        match self.mode {
            RepairMode::Check => {
                pass0::check_superblock(self, false)?;
                pass2::check_semantics(self, false)?;
                pass3::fix_parent_links(self, false)?;
            }
            RepairMode::FixFixable => {
                pass0::check_superblock(self, true)?;
                pass2::check_semantics(self, true)?;
                pass3::fix_parent_links(self, true)?;
                self.flush_with_rollback()?;
            }
            RepairMode::RebuildTree => {
                pass0::check_superblock(self, true)?;
                pass1::rebuild_tree(self)?;
                pass2::check_semantics(self, true)?;
                pass3::fix_parent_links(self, true)?;
                pass3::relink_lost_objects(self, true)?;
                pass4::reconcile_bitmap(self, true)?;
                pass4::rebuild_objidmap(self)?;
                self.flush_with_rollback()?;
            }
            RepairMode::RebuildSb => {
                pass0::rebuild_superblock(self)?;
                self.flush_with_rollback()?;
            }
            RepairMode::CleanAttributes => {
                pass2::clean_attributes(self)?;
                self.flush_with_rollback()?;
            }
            RepairMode::RollbackFsckChanges => {
                rollback::apply_rollback(self)?;
            }
        }
        Ok(self.findings.exit_code())
    }
}
