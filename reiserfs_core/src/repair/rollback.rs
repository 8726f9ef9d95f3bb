//! Rollback log (spec.md §6, fsck `-l <file>` / `--rollback-fsck-changes`):
//! before a fixing pass overwrites a block, its pre-image is appended here
//! keyed by device and block number, so a later run can play the log back
//! in reverse and undo everything a previous fsck changed.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CoreError, CoreResult};

const MAGIC: &[u8; 8] = b"RfsRbLog";

/// One pre-image: the block it came from and its contents before the pass
/// that's about to modify it touches it.
struct Record {
    block: u32,
    data: Vec<u8>,
}

pub struct RollbackLog {
    file: File,
    path: std::path::PathBuf,
}

impl RollbackLog {
    pub fn create(path: impl AsRef<Path>) -> CoreResult<RollbackLog> {
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(path.as_ref())?;
        file.write_all(MAGIC)?;
        Ok(RollbackLog { file, path: path.as_ref().to_path_buf() })
    }

    pub fn open(path: impl AsRef<Path>) -> CoreResult<RollbackLog> {
        let mut file = OpenOptions::new().read(true).append(true).open(path.as_ref())?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(CoreError::BadGeometry("not a rollback log".into()));
        }
        Ok(RollbackLog { file, path: path.as_ref().to_path_buf() })
    }

    /// Append the pre-image of `block` (its contents right now, before the
    /// caller overwrites it). Call this before, never after, the write.
    pub fn record_pre_image(&mut self, block: u32, data: &[u8]) -> CoreResult<()> {
        self.file.write_u32::<LittleEndian>(block)?;
        self.file.write_u32::<LittleEndian>(data.len() as u32)?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn read_all(path: impl AsRef<Path>) -> CoreResult<Vec<Record>> {
        let mut file = File::open(path.as_ref())?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(CoreError::BadGeometry("not a rollback log".into()));
        }
        let mut records = Vec::new();
        loop {
            let block = match file.read_u32::<LittleEndian>() {
                Ok(b) => b,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(CoreError::Io(e)),
            };
            let len = file.read_u32::<LittleEndian>()? as usize;
            let mut data = vec![0u8; len];
            file.read_exact(&mut data)?;
            records.push(Record { block, data });
        }
        Ok(records)
    }
}

/// `--rollback-fsck-changes`: replay a previously recorded log in reverse
/// order, writing each pre-image back over its block.
pub fn apply_rollback(engine: &mut super::RepairEngine) -> CoreResult<()> {
    let path = engine
        .rollback
        .as_ref()
        .ok_or_else(|| CoreError::BadGeometry("no rollback log given; pass -l <file>".into()))?
        .path
        .clone();
    let applied = replay_log(&path, engine.fs.device())?;
    log::info!("rolled back {applied} blocks from {}", path.display());
    engine.fs.invalidate_all();
    engine.findings.fixed += applied as u64;
    Ok(())
}

/// Replay a rollback log file directly against a device, independent of an
/// open `FileSystem` (used by the CLI before the volume is even mounted,
/// since a rollback target's superblock may itself be what's being undone).
pub fn replay_log(log_path: impl AsRef<Path>, device: &crate::block::BlockDevice) -> CoreResult<u32> {
    let mut records = RollbackLog::read_all(log_path)?;
    records.reverse();
    let mut applied = 0u32;
    for r in &records {
        device.write_block(r.block, &r.data)?;
        applied += 1;
    }
    device.fsync()?;
    Ok(applied)
}
