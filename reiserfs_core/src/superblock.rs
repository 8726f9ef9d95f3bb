//! The reiserfs superblock (spec.md §3, §4.1). Three on-disk magics are
//! recognized: the legacy 3.5 format at block-2, and the two 3.6 layouts
//! that moved the superblock to a fixed 64KiB byte offset and added a
//! UUID/label and embedded journal parameters.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::block::BlockDevice;
use crate::error::{CoreError, CoreResult};
use crate::hash::HashKind;

/// Byte offset of the superblock on a "new" (3.6) layout, independent of
/// block size.
pub const NEW_SB_OFFSET: u64 = 65536;
/// Block holding the superblock on the legacy (3.5) layout, at the
/// default 4K block size; old volumes always used a 4K first block.
pub const OLD_SB_BLOCK: u32 = 16;

const MAGIC_3_5: &[u8; 10] = b"ReIsErFs\0\0";
const MAGIC_3_6: &[u8; 10] = b"ReIsEr2Fs\0";
const MAGIC_JR: &[u8; 10] = b"ReIsEr3Fs\0";

pub const SUPERBLOCK_LEN: usize = 204;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V3_5,
    V3_6,
    /// 3.6 layout with a non-standard journal (relocated or resized).
    V3_6Journaled,
}

bitflags::bitflags! {
    pub struct SbState: u16 {
        const CONSISTENT = 0b01;
        const ERROR      = 0b10;
        const FATAL      = 0b100;
    }
}

/// Journal geometry recorded in the superblock (spec.md §4.7).
#[derive(Debug, Clone, Copy)]
pub struct JournalParams {
    pub first_block: u32,
    pub dev_block_count: u32,
    pub max_trans_len: u32,
    pub magic: u32,
}

#[derive(Debug, Clone)]
pub struct SuperBlock {
    pub version: FormatVersion,
    pub block_count: u32,
    pub free_blocks: u32,
    pub root_block: u32,
    pub blocksize: u32,
    pub hash: HashKind,
    pub tree_height: u16,
    pub bmap_count: u16,
    pub state: SbState,
    pub objectid_map_cursor: u16,
    pub objectid_map_max: u16,
    pub uuid: Option<Uuid>,
    pub label: Option<String>,
    pub journal: JournalParams,
}

impl SuperBlock {
    /// Byte offset the superblock sits at for this layout.
    pub fn disk_offset(version: FormatVersion, blocksize: u32) -> u64 {
        match version {
            FormatVersion::V3_5 => (OLD_SB_BLOCK as u64) * blocksize as u64,
            FormatVersion::V3_6 | FormatVersion::V3_6Journaled => NEW_SB_OFFSET,
        }
    }

    pub fn read(dev: &BlockDevice) -> CoreResult<SuperBlock> {
        // Probe both possible offsets; a 3.6 volume's block-16 slot is
        // ordinary data, so the new offset is tried first.
        let mut buf = [0u8; SUPERBLOCK_LEN];
        if dev.pread(&mut buf, NEW_SB_OFFSET).is_ok() && magic_of(&buf).is_some() {
            return decode(&buf);
        }
        let old_off = (OLD_SB_BLOCK as u64) * dev.blocksize() as u64;
        dev.pread(&mut buf, old_off).map_err(|_| CoreError::NotAFilesystem)?;
        if magic_of(&buf).is_none() {
            return Err(CoreError::NotAFilesystem);
        }
        decode(&buf)
    }

    pub fn write(&self, dev: &BlockDevice) -> CoreResult<()> {
        let mut buf = [0u8; SUPERBLOCK_LEN];
        encode(self, &mut buf);
        let off = Self::disk_offset(self.version, self.blocksize);
        dev.pwrite(&buf, off)?;
        Ok(())
    }

    pub fn state_ok(&self) -> bool {
        self.state.contains(SbState::CONSISTENT) && !self.state.intersects(SbState::ERROR | SbState::FATAL)
    }

    pub fn mark_dirty(&mut self) {
        self.state.remove(SbState::CONSISTENT);
    }

    pub fn mark_clean(&mut self) {
        self.state.insert(SbState::CONSISTENT);
        self.state.remove(SbState::ERROR | SbState::FATAL);
    }
}

fn magic_of(buf: &[u8]) -> Option<FormatVersion> {
    // The magic string sits at a fixed offset past the block-count/free
    // fields in every layout generation.
    let m = &buf[52..62];
    if m == MAGIC_JR {
        Some(FormatVersion::V3_6Journaled)
    } else if m == MAGIC_3_6 {
        Some(FormatVersion::V3_6)
    } else if m == MAGIC_3_5 {
        Some(FormatVersion::V3_5)
    } else {
        None
    }
}

fn encode(sb: &SuperBlock, buf: &mut [u8]) {
    let mut w = &mut buf[0..4];
    w.write_u32::<LittleEndian>(sb.block_count).unwrap();
    let mut w = &mut buf[4..8];
    w.write_u32::<LittleEndian>(sb.free_blocks).unwrap();
    let mut w = &mut buf[8..12];
    w.write_u32::<LittleEndian>(sb.root_block).unwrap();
    let mut w = &mut buf[12..16];
    w.write_u32::<LittleEndian>(sb.journal.first_block).unwrap();
    let mut w = &mut buf[16..20];
    w.write_u32::<LittleEndian>(sb.journal.dev_block_count).unwrap();
    let mut w = &mut buf[20..24];
    w.write_u32::<LittleEndian>(sb.journal.max_trans_len).unwrap();
    let mut w = &mut buf[24..28];
    w.write_u32::<LittleEndian>(sb.journal.magic).unwrap();
    let mut w = &mut buf[28..30];
    w.write_u16::<LittleEndian>(sb.blocksize as u16).unwrap();
    let mut w = &mut buf[30..32];
    w.write_u16::<LittleEndian>(sb.objectid_map_cursor).unwrap();
    let mut w = &mut buf[32..34];
    w.write_u16::<LittleEndian>(sb.objectid_map_max).unwrap();
    let mut w = &mut buf[34..36];
    w.write_u16::<LittleEndian>(sb.tree_height).unwrap();
    let mut w = &mut buf[36..38];
    w.write_u16::<LittleEndian>(sb.bmap_count).unwrap();
    let mut w = &mut buf[38..40];
    w.write_u16::<LittleEndian>(hash_code(sb.hash)).unwrap();
    let mut w = &mut buf[40..42];
    w.write_u16::<LittleEndian>(sb.state.bits()).unwrap();
    buf[52..62].copy_from_slice(match sb.version {
        FormatVersion::V3_5 => MAGIC_3_5,
        FormatVersion::V3_6 => MAGIC_3_6,
        FormatVersion::V3_6Journaled => MAGIC_JR,
    });
    if sb.version != FormatVersion::V3_5 {
        if let Some(uuid) = sb.uuid {
            buf[62..78].copy_from_slice(uuid.as_bytes());
        }
        if let Some(label) = &sb.label {
            let bytes = label.as_bytes();
            let n = bytes.len().min(16);
            buf[78..78 + n].copy_from_slice(&bytes[..n]);
        }
    }
}

fn decode(buf: &[u8]) -> CoreResult<SuperBlock> {
    let version = magic_of(buf).ok_or(CoreError::NotAFilesystem)?;
    let block_count = LittleEndian::read_u32(&buf[0..4]);
    let free_blocks = LittleEndian::read_u32(&buf[4..8]);
    let root_block = LittleEndian::read_u32(&buf[8..12]);
    let journal = JournalParams {
        first_block: LittleEndian::read_u32(&buf[12..16]),
        dev_block_count: LittleEndian::read_u32(&buf[16..20]),
        max_trans_len: LittleEndian::read_u32(&buf[20..24]),
        magic: LittleEndian::read_u32(&buf[24..28]),
    };
    let blocksize = LittleEndian::read_u16(&buf[28..30]) as u32;
    let objectid_map_cursor = LittleEndian::read_u16(&buf[30..32]);
    let objectid_map_max = LittleEndian::read_u16(&buf[32..34]);
    let tree_height = LittleEndian::read_u16(&buf[34..36]);
    let bmap_count = LittleEndian::read_u16(&buf[36..38]);
    let hash = hash_from_code(LittleEndian::read_u16(&buf[38..40]))?;
    let state = SbState::from_bits_truncate(LittleEndian::read_u16(&buf[40..42]));

    let (uuid, label) = if version != FormatVersion::V3_5 {
        let uuid = Uuid::from_slice(&buf[62..78]).ok();
        let raw = &buf[78..94];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let label = if end == 0 { None } else { Some(String::from_utf8_lossy(&raw[..end]).into_owned()) };
        (uuid, label)
    } else {
        (None, None)
    };

    Ok(SuperBlock {
        version,
        block_count,
        free_blocks,
        root_block,
        blocksize,
        hash,
        tree_height,
        bmap_count,
        state,
        objectid_map_cursor,
        objectid_map_max,
        uuid,
        label,
        journal,
    })
}

fn hash_code(h: HashKind) -> u16 {
    match h {
        HashKind::Tea => 2,
        HashKind::Rupasov => 1,
        HashKind::R5 => 3,
    }
}

fn hash_from_code(code: u16) -> CoreResult<HashKind> {
    match code {
        1 => Ok(HashKind::Rupasov),
        2 => Ok(HashKind::Tea),
        3 => Ok(HashKind::R5),
        _ => Err(CoreError::BadGeometry(format!("unknown hash code {code}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SuperBlock {
        SuperBlock {
            version: FormatVersion::V3_6,
            block_count: 10000,
            free_blocks: 9000,
            root_block: 20,
            blocksize: 4096,
            hash: HashKind::R5,
            tree_height: 2,
            bmap_count: 1,
            state: SbState::CONSISTENT,
            objectid_map_cursor: 2,
            objectid_map_max: 10,
            uuid: Some(Uuid::nil()),
            label: Some("root".to_string()),
            journal: JournalParams { first_block: 18, dev_block_count: 8192, max_trans_len: 1024, magic: 0xdead },
        }
    }

    #[test]
    fn roundtrip_3_6() {
        let sb = sample();
        let mut buf = [0u8; SUPERBLOCK_LEN];
        encode(&sb, &mut buf);
        let back = decode(&buf).unwrap();
        assert_eq!(back.block_count, sb.block_count);
        assert_eq!(back.hash, sb.hash);
        assert_eq!(back.label.as_deref(), Some("root"));
        assert_eq!(back.version, FormatVersion::V3_6);
    }

    #[test]
    fn state_ok_requires_consistent_and_no_errors() {
        let mut sb = sample();
        assert!(sb.state_ok());
        sb.state.insert(SbState::ERROR);
        assert!(!sb.state_ok());
        sb.mark_clean();
        assert!(sb.state_ok());
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = [0u8; SUPERBLOCK_LEN];
        assert!(decode(&buf).is_err());
    }
}
