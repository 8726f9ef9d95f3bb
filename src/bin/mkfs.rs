//! `mkfs`: format a device (or plain file) as a fresh ReiserFS v3 volume.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use reiserfs_core::format::{self, FormatOptions};
use reiserfs_core::hash::HashKind;
use reiserfs_core::superblock::FormatVersion;
use reiserfs_tools::cli::{device_size_bytes, parse_bad_blocks_file, parse_block_count, parse_format_version, parse_hash};

/// Create a new ReiserFS v3 file system
#[derive(Parser, Debug)]
#[command(name = "mkfs.reiserfs", about = "Create a new ReiserFS v3 file system")]
struct MkfsCli {
    /// Device or image file to format
    device: PathBuf,

    /// Number of blocks the volume should hold; defaults to the device's
    /// own size divided by the block size
    block_count: Option<String>,

    /// Block size in bytes (power of two, 512-8192)
    #[arg(short = 'b', long, default_value_t = 4096)]
    blocksize: u32,

    /// Journal device path; must be the same file `mkfs` is formatting,
    /// since a separate journal device is not supported
    #[arg(short = 'j', long = "journal-device")]
    journal_device: Option<PathBuf>,

    /// Journal size in blocks
    #[arg(short = 's', long = "journal-size")]
    journal_size: Option<u32>,

    /// Journal offset in blocks from the start of the device
    #[arg(short = 'o', long = "journal-offset")]
    journal_offset: Option<u32>,

    /// Maximum transaction length in blocks
    #[arg(short = 't', long = "trans-max")]
    trans_max: Option<u32>,

    /// File listing bad blocks to reserve, one block number per line
    #[arg(short = 'B', long = "bad-blocks")]
    bad_blocks: Option<PathBuf>,

    /// Name hash to use for directory entries
    #[arg(short = 'h', long, default_value = "r5")]
    hash: String,

    /// Volume UUID; random if omitted
    #[arg(short = 'u', long)]
    uuid: Option<uuid::Uuid>,

    /// Volume label
    #[arg(short = 'l', long)]
    label: Option<String>,

    /// On-disk format version
    #[arg(long = "format", default_value = "3.6")]
    format_version: String,

    /// Format even if the device already holds a recognizable file system
    #[arg(short = 'f', long)]
    force: bool,

    /// Suppress informational output
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn device_block_count(path: &std::path::Path, blocksize: u32) -> Result<u64> {
    let len = device_size_bytes(path)?;
    if len == 0 {
        bail!("cannot determine the size of {}; pass a block count explicitly", path.display());
    }
    Ok(len / blocksize as u64)
}

fn already_formatted(path: &std::path::Path) -> bool {
    reiserfs_core::fs::FileSystem::open(path, true).is_ok()
}

fn main() -> Result<()> {
    let cli = MkfsCli::parse();
    reiserfs_tools::logging::init(cli.verbose as i32 - cli.quiet as i32);

    if let Some(jdev) = &cli.journal_device {
        if jdev != &cli.device {
            bail!("a journal on a separate device is not supported; pass the same device as -j");
        }
    }

    if !cli.force && already_formatted(&cli.device) {
        bail!(
            "{} already holds a ReiserFS volume; pass -f to overwrite",
            cli.device.display()
        );
    }

    let hash: HashKind = parse_hash(&cli.hash)?;
    let version: FormatVersion = parse_format_version(&cli.format_version)?;
    let block_count = match &cli.block_count {
        Some(s) => parse_block_count(s, cli.blocksize)?,
        None => device_block_count(&cli.device, cli.blocksize)?,
    };
    let bad_blocks = match &cli.bad_blocks {
        Some(path) => parse_bad_blocks_file(path)?,
        None => Vec::new(),
    };

    let opts = FormatOptions {
        blocksize: cli.blocksize,
        block_count,
        hash,
        version,
        uuid: cli.uuid,
        label: cli.label,
        bad_blocks,
        journal_offset: cli.journal_offset,
        journal_size: cli.journal_size,
        max_trans_len: cli.trans_max,
    };

    let fs = format::format(&cli.device, opts).with_context(|| format!("formatting {}", cli.device.display()))?;
    if !cli.quiet {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        println!(
            "{}: {} blocks of {} bytes, hash={}, root block {} ({now})",
            cli.device.display(),
            fs.sb.block_count,
            fs.sb.blocksize,
            fs.sb.hash,
            fs.sb.root_block
        );
    }
    fs.close()?;
    Ok(())
}
