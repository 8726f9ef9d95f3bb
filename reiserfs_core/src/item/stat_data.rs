//! Stat-data item: per-object metadata (spec.md §3). Two on-disk sizes
//! exist; v1 is a fixed 44 bytes, v2 is at least 44 bytes (the original
//! reserves extra space for future fields, which we keep as a fixed
//! trailing pad to stay byte-compatible).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub const STAT_DATA_V1_LEN: usize = 44;
pub const STAT_DATA_V2_LEN: usize = 44;

/// POSIX file-type bits within `mode` (spec.md §3's mode field packs the
/// same `S_IFMT`-style type nibble the original on-disk format does).
pub const S_IFMT: u16 = 0o170000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFREG: u16 = 0o100000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatDataFormat {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy)]
pub struct StatData {
    pub format: StatDataFormat,
    pub mode: u16,
    pub nlink: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// v1: "first direct byte" offset marking where direct items begin
    /// (0xffffffff if the file has no direct tail); v2: generation
    /// counter. Spec.md §3 calls these out as a union by format.
    pub first_direct_byte_or_generation: u32,
    /// v1 block count is 32-bit; v2 widens it, but both are kept as u64
    /// here for a single in-memory representation.
    pub blocks: u64,
}

impl StatData {
    pub fn encoded_len(&self) -> usize {
        match self.format {
            StatDataFormat::V1 => STAT_DATA_V1_LEN,
            StatDataFormat::V2 => STAT_DATA_V2_LEN,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        match self.format {
            StatDataFormat::V1 => self.encode_v1(buf),
            StatDataFormat::V2 => self.encode_v2(buf),
        }
    }

    fn encode_v1(&self, buf: &mut [u8]) {
        let mut w = &mut buf[0..STAT_DATA_V1_LEN];
        w.write_u16::<LittleEndian>(self.mode).unwrap();
        w.write_u16::<LittleEndian>(self.nlink as u16).unwrap();
        w.write_u32::<LittleEndian>(self.size as u32).unwrap();
        w.write_u32::<LittleEndian>(self.uid).unwrap();
        w.write_u32::<LittleEndian>(self.gid).unwrap();
        w.write_u32::<LittleEndian>(self.atime).unwrap();
        w.write_u32::<LittleEndian>(self.mtime).unwrap();
        w.write_u32::<LittleEndian>(self.ctime).unwrap();
        w.write_u32::<LittleEndian>(self.blocks as u32).unwrap();
        w.write_u32::<LittleEndian>(self.first_direct_byte_or_generation).unwrap();
        // remaining bytes of the fixed 44-byte v1 record are reserved/pad.
        w.write_u32::<LittleEndian>(0).unwrap();
    }

    fn encode_v2(&self, buf: &mut [u8]) {
        let mut w = &mut buf[0..STAT_DATA_V2_LEN];
        w.write_u16::<LittleEndian>(self.mode).unwrap();
        w.write_u16::<LittleEndian>(0).unwrap(); // padding, reserved
        w.write_u32::<LittleEndian>(self.nlink).unwrap();
        w.write_u64::<LittleEndian>(self.size).unwrap();
        w.write_u32::<LittleEndian>(self.uid).unwrap();
        w.write_u32::<LittleEndian>(self.gid).unwrap();
        w.write_u32::<LittleEndian>(self.atime).unwrap();
        w.write_u32::<LittleEndian>(self.mtime).unwrap();
        w.write_u32::<LittleEndian>(self.ctime).unwrap();
        w.write_u32::<LittleEndian>(self.blocks as u32).unwrap();
        w.write_u32::<LittleEndian>(self.first_direct_byte_or_generation).unwrap();
    }

    pub fn decode(format: StatDataFormat, buf: &[u8]) -> StatData {
        match format {
            StatDataFormat::V1 => Self::decode_v1(buf),
            StatDataFormat::V2 => Self::decode_v2(buf),
        }
    }

    fn decode_v1(buf: &[u8]) -> StatData {
        let mut r = &buf[0..STAT_DATA_V1_LEN];
        let mode = r.read_u16::<LittleEndian>().unwrap();
        let nlink = r.read_u16::<LittleEndian>().unwrap() as u32;
        let size = r.read_u32::<LittleEndian>().unwrap() as u64;
        let uid = r.read_u32::<LittleEndian>().unwrap();
        let gid = r.read_u32::<LittleEndian>().unwrap();
        let atime = r.read_u32::<LittleEndian>().unwrap();
        let mtime = r.read_u32::<LittleEndian>().unwrap();
        let ctime = r.read_u32::<LittleEndian>().unwrap();
        let blocks = r.read_u32::<LittleEndian>().unwrap() as u64;
        let fdb = r.read_u32::<LittleEndian>().unwrap();
        StatData {
            format: StatDataFormat::V1,
            mode,
            nlink,
            size,
            uid,
            gid,
            atime,
            mtime,
            ctime,
            first_direct_byte_or_generation: fdb,
            blocks,
        }
    }

    fn decode_v2(buf: &[u8]) -> StatData {
        let mut r = &buf[0..STAT_DATA_V2_LEN];
        let mode = r.read_u16::<LittleEndian>().unwrap();
        let _pad = r.read_u16::<LittleEndian>().unwrap();
        let nlink = r.read_u32::<LittleEndian>().unwrap();
        let size = r.read_u64::<LittleEndian>().unwrap();
        let uid = r.read_u32::<LittleEndian>().unwrap();
        let gid = r.read_u32::<LittleEndian>().unwrap();
        let atime = r.read_u32::<LittleEndian>().unwrap();
        let mtime = r.read_u32::<LittleEndian>().unwrap();
        let ctime = r.read_u32::<LittleEndian>().unwrap();
        let blocks = r.read_u32::<LittleEndian>().unwrap() as u64;
        let generation = r.read_u32::<LittleEndian>().unwrap();
        StatData {
            format: StatDataFormat::V2,
            mode,
            nlink,
            size,
            uid,
            gid,
            atime,
            mtime,
            ctime,
            first_direct_byte_or_generation: generation,
            blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_roundtrip() {
        let sd = StatData {
            format: StatDataFormat::V2,
            mode: 0o100644,
            nlink: 1,
            size: 5,
            uid: 0,
            gid: 0,
            atime: 1000,
            mtime: 1000,
            ctime: 1000,
            first_direct_byte_or_generation: 0,
            blocks: 1,
        };
        let mut buf = [0u8; STAT_DATA_V2_LEN];
        sd.encode(&mut buf);
        let back = StatData::decode(StatDataFormat::V2, &buf);
        assert_eq!(back.mode, sd.mode);
        assert_eq!(back.size, sd.size);
        assert_eq!(back.nlink, sd.nlink);
    }

    #[test]
    fn v1_roundtrip() {
        let sd = StatData {
            format: StatDataFormat::V1,
            mode: 0o40755,
            nlink: 2,
            size: 0,
            uid: 0,
            gid: 0,
            atime: 1,
            mtime: 2,
            ctime: 3,
            first_direct_byte_or_generation: 0xffffffff,
            blocks: 0,
        };
        let mut buf = [0u8; STAT_DATA_V1_LEN];
        sd.encode(&mut buf);
        let back = StatData::decode(StatDataFormat::V1, &buf);
        assert_eq!(back.mode, sd.mode);
        assert_eq!(back.first_direct_byte_or_generation, sd.first_direct_byte_or_generation);
    }
}
