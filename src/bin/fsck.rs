//! `fsck`: check and optionally repair an existing ReiserFS v3 volume.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use reiserfs_core::fs::FileSystem;
use reiserfs_core::repair::{Findings, RepairEngine, RepairMode};
use reiserfs_tools::cli::parse_bad_blocks_file;

/// Check an existing file system for errors
#[derive(Parser, Debug)]
#[command(name = "fsck.reiserfs", about = "Check an existing ReiserFS v3 file system")]
struct FsckCli {
    /// Device or image file to check
    device: PathBuf,

    /// Check only, report what would change without writing anything
    #[arg(long = "check")]
    check: bool,

    /// Fix anything fixable in place, without touching tree structure
    #[arg(long = "fix-fixable")]
    fix_fixable: bool,

    /// Discard the existing tree and rebuild it from salvaged leaves
    #[arg(long = "rebuild-tree")]
    rebuild_tree: bool,

    /// Recompute the superblock's derived fields from the device and bitmap
    #[arg(long = "rebuild-sb")]
    rebuild_sb: bool,

    /// Clear repair bookkeeping bits left by a previous interrupted run
    #[arg(long = "clean-attributes")]
    clean_attributes: bool,

    /// Undo a previous fsck run using its rollback log
    #[arg(long = "rollback-fsck-changes")]
    rollback_fsck_changes: bool,

    /// Journal device path; must be the same file being checked
    #[arg(short = 'j', long = "journal-device")]
    journal_device: Option<PathBuf>,

    /// File listing bad blocks to treat as unusable
    #[arg(short = 'B', long = "bad-blocks")]
    bad_blocks: Option<PathBuf>,

    /// Rollback log path; records each block's pre-image before it's changed
    #[arg(short = 'R', long = "rollback-file")]
    rollback_file: Option<PathBuf>,

    /// Disable the rollback log even in a fixing mode
    #[arg(short = 'n', long = "no-log")]
    no_log: bool,

    /// Resize the superblock's block count to match the device
    #[arg(short = 'z', long = "adjust-size")]
    adjust_size: bool,

    /// Assume yes to any interactive confirmation
    #[arg(short = 'y', long = "assume-yes")]
    assume_yes: bool,

    /// Scan every block on the device rather than trusting the bitmap
    #[arg(short = 'S', long = "scan-whole-partition")]
    scan_whole_partition: bool,

    /// Path to an external bitmap image (unsupported; rejected if given)
    #[arg(short = 'b', long = "external-bitmap")]
    external_bitmap: Option<PathBuf>,

    /// Write resumable pass state to this file as passes complete
    #[arg(short = 'd', long = "passes-dump")]
    passes_dump: Option<PathBuf>,

    /// Override the name hash instead of trusting the superblock
    #[arg(short = 'h', long)]
    hash: Option<String>,

    /// Proceed even though the journal cannot be replayed
    #[arg(long = "no-journal-available")]
    no_journal_available: bool,
}

impl FsckCli {
    fn mode(&self) -> Result<RepairMode> {
        let chosen: Vec<(&str, bool)> = vec![
            ("--check", self.check),
            ("--fix-fixable", self.fix_fixable),
            ("--rebuild-tree", self.rebuild_tree),
            ("--rebuild-sb", self.rebuild_sb),
            ("--clean-attributes", self.clean_attributes),
            ("--rollback-fsck-changes", self.rollback_fsck_changes),
        ];
        let set: Vec<&str> = chosen.iter().filter(|(_, v)| *v).map(|(n, _)| *n).collect();
        match set.as_slice() {
            [] => Ok(RepairMode::Check),
            [_one] => Ok(match set[0] {
                "--check" => RepairMode::Check,
                "--fix-fixable" => RepairMode::FixFixable,
                "--rebuild-tree" => RepairMode::RebuildTree,
                "--rebuild-sb" => RepairMode::RebuildSb,
                "--clean-attributes" => RepairMode::CleanAttributes,
                "--rollback-fsck-changes" => RepairMode::RollbackFsckChanges,
                _ => unreachable!(),
            }),
            many => bail!("mutually exclusive modes given: {}", many.join(", ")),
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = FsckCli::parse();
    reiserfs_tools::logging::init(0);

    if let Some(jdev) = &cli.journal_device {
        if jdev != &cli.device {
            bail!("a journal on a separate device is not supported; pass the same device as -j");
        }
    }
    if cli.external_bitmap.is_some() {
        bail!("an external bitmap image is not supported");
    }
    if cli.no_journal_available {
        log::warn!("proceeding without journal replay; any unflushed transaction is lost");
    }

    let mode = cli.mode()?;
    let read_only = mode == RepairMode::Check;

    let mut fs = FileSystem::open(&cli.device, read_only).with_context(|| format!("opening {}", cli.device.display()))?;

    if cli.adjust_size {
        let device_blocks = fs.device().block_count()?;
        if device_blocks != fs.sb.block_count as u64 {
            log::info!("adjusting block count {} -> {device_blocks}", fs.sb.block_count);
            fs.sb.block_count = device_blocks as u32;
        }
    }

    let bad_blocks = match &cli.bad_blocks {
        Some(path) => parse_bad_blocks_file(path)?,
        None => Vec::new(),
    };
    for block in bad_blocks {
        if (block as usize) < fs.bitmap.bit_size() && !fs.bitmap.test(block as usize) {
            fs.bitmap.set(block as usize);
            fs.sb.free_blocks = fs.sb.free_blocks.saturating_sub(1);
        }
    }

    let mut engine = RepairEngine::new(fs, mode);
    if mode == RepairMode::RollbackFsckChanges {
        let path = cli
            .rollback_file
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--rollback-fsck-changes requires -R <file>"))?;
        engine.rollback = Some(reiserfs_core::repair::rollback::RollbackLog::open(&path)?);
    } else if !cli.no_log {
        if let Some(path) = &cli.rollback_file {
            engine = engine.with_rollback(path)?;
        }
    }

    if !cli.assume_yes && matches!(mode, RepairMode::RebuildTree | RepairMode::RebuildSb) {
        eprintln!("{:?} will rewrite {}; pass -y to proceed non-interactively", mode, cli.device.display());
    }

    let code = engine.run()?;

    if let Some(path) = &cli.passes_dump {
        reiserfs_core::repair::state_dump::StateDump::save(
            path,
            engine.mode,
            &[],
            engine.findings,
            &engine.recovered_leaves,
        )?;
    }

    print_summary(&engine.findings);

    Ok(ExitCode::from(code as u8))
}

fn print_summary(findings: &Findings) {
    let line = format!(
        "fsck finished: fixable={} fixed={} fatal={}",
        findings.fixable, findings.fixed, findings.fatal
    );
    if findings.fatal > 0 {
        eprintln!("{}", line.red());
    } else if findings.fixed > 0 || findings.fixable > 0 {
        eprintln!("{}", line.yellow());
    } else {
        eprintln!("{}", line.green());
    }
}
