//! Argument types shared by `mkfs` and `fsck`: both accept a hash-function
//! name and (`mkfs`) a format-version string on the command line, and both
//! need a human size suffix parsed into a block count.

use anyhow::{bail, Context, Result};
use reiserfs_core::hash::HashKind;
use reiserfs_core::superblock::FormatVersion;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::str::FromStr;

/// Parse `--hash tea|rupasov|r5` (spec.md §9 names the three supported
/// hash families); delegates to the core crate's own `FromStr` via strum.
pub fn parse_hash(s: &str) -> Result<HashKind> {
    HashKind::from_str(&s.to_lowercase()).map_err(|_| anyhow::anyhow!("unknown hash '{s}'; expected tea, rupasov, or r5"))
}

/// Parse `--format 3.5|3.6` (mkfs's on-disk format version switch).
pub fn parse_format_version(s: &str) -> Result<FormatVersion> {
    match s {
        "3.5" => Ok(FormatVersion::V3_5),
        "3.6" => Ok(FormatVersion::V3_6),
        other => bail!("unknown format version '{other}'; expected 3.5 or 3.6"),
    }
}

/// Parse a block-count argument that may carry a `k`/`m`/`g` suffix
/// (case-insensitive) meaning KiB/MiB/GiB worth of blocks at `blocksize`.
pub fn parse_block_count(s: &str, blocksize: u32) -> Result<u64> {
    let (digits, unit) = match s.trim().strip_suffix(['k', 'K', 'm', 'M', 'g', 'G']) {
        Some(digits) => (digits, s.chars().last()),
        None => (s.trim(), None),
    };
    let value: u64 = digits.parse().with_context(|| format!("invalid block count '{s}'"))?;
    let bytes = match unit {
        None => return Ok(value),
        Some('k') | Some('K') => value * 1024,
        Some('m') | Some('M') => value * 1024 * 1024,
        Some('g') | Some('G') => value * 1024 * 1024 * 1024,
        Some(_) => unreachable!(),
    };
    Ok(bytes / blocksize as u64)
}

/// Parse a `-B <file>` bad-blocks list: one block number per line, blank
/// lines and `#`-comments ignored.
pub fn parse_bad_blocks_file(path: &std::path::Path) -> Result<Vec<u32>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading bad-blocks file {}", path.display()))?;
    let mut blocks = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        blocks.push(line.parse::<u32>().with_context(|| format!("bad block entry '{line}'"))?);
    }
    Ok(blocks)
}

/// Size of the block device at `path` in bytes. Regular files report their
/// length directly; block special files report 0 from `stat(2)`, so those
/// go through `BLKGETSIZE64` instead.
pub fn device_size_bytes(path: &std::path::Path) -> Result<u64> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let meta = file.metadata()?;
    if !meta.file_type().is_block_device() {
        return Ok(meta.len());
    }

    const BLKGETSIZE64: libc::c_ulong = 0x80081272;
    let mut size: u64 = 0;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size as *mut u64) };
    if rc != 0 {
        bail!("BLKGETSIZE64 ioctl failed on {}: {}", path.display(), errno::errno());
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_count_suffixes() {
        assert_eq!(parse_block_count("100", 4096).unwrap(), 100);
        assert_eq!(parse_block_count("4k", 4096).unwrap(), 1);
        assert_eq!(parse_block_count("8M", 4096).unwrap(), 2048);
    }

    #[test]
    fn hash_names_are_case_insensitive() {
        assert_eq!(parse_hash("R5").unwrap(), HashKind::R5);
        assert_eq!(parse_hash("tea").unwrap(), HashKind::Tea);
    }
}
