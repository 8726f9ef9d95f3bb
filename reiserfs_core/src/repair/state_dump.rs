//! Resumable pass state (spec.md §1): fsck can be interrupted between
//! passes on a volume large enough that a single run takes a while, and
//! resume without re-scanning passes that already finished. Serialized with
//! serde_json since it's a small, human-inspectable record, not a hot path.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

use super::{Findings, RepairMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletedPass {
    Pass0,
    Pass1,
    Pass2,
    Pass3,
    Pass4,
}

/// Everything needed to pick a run back up after the process that had been
/// driving it went away: which passes already committed their changes, the
/// findings accumulated so far, and the leaves pass1 recovered (so pass2
/// doesn't need to re-walk the whole device to find them again).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDump {
    pub mode: RepairModeDump,
    pub completed: Vec<CompletedPass>,
    pub findings: FindingsDump,
    pub recovered_leaves: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairModeDump {
    Check,
    FixFixable,
    RebuildTree,
    RebuildSb,
    CleanAttributes,
    RollbackFsckChanges,
}

impl From<RepairMode> for RepairModeDump {
    fn from(m: RepairMode) -> Self {
        match m {
            RepairMode::Check => RepairModeDump::Check,
            RepairMode::FixFixable => RepairModeDump::FixFixable,
            RepairMode::RebuildTree => RepairModeDump::RebuildTree,
            RepairMode::RebuildSb => RepairModeDump::RebuildSb,
            RepairMode::CleanAttributes => RepairModeDump::CleanAttributes,
            RepairMode::RollbackFsckChanges => RepairModeDump::RollbackFsckChanges,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FindingsDump {
    pub fixable: u64,
    pub fixed: u64,
    pub fatal: u64,
}

impl From<Findings> for FindingsDump {
    fn from(f: Findings) -> Self {
        FindingsDump { fixable: f.fixable, fixed: f.fixed, fatal: f.fatal }
    }
}

impl From<FindingsDump> for Findings {
    fn from(f: FindingsDump) -> Self {
        Findings { fixable: f.fixable, fixed: f.fixed, fatal: f.fatal }
    }
}

impl StateDump {
    pub fn save(path: impl AsRef<Path>, mode: RepairMode, completed: &[CompletedPass], findings: Findings, recovered_leaves: &[u32]) -> CoreResult<()> {
        let dump = StateDump {
            mode: mode.into(),
            completed: completed.to_vec(),
            findings: findings.into(),
            recovered_leaves: recovered_leaves.to_vec(),
        };
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(BufWriter::new(file), &dump)
            .map_err(|e| crate::error::CoreError::BadGeometry(format!("writing state dump: {e}")))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> CoreResult<StateDump> {
        let file = File::open(path.as_ref())?;
        serde_json::from_reader(file).map_err(|e| crate::error::CoreError::BadGeometry(format!("reading state dump: {e}")))
    }
}
