//! Error types for the core engine.
//!
//! The balancer and journal need to distinguish a handful of outcomes
//! programmatically (disk full vs. I/O failure vs. "nothing to do"), so they
//! speak [`CoreError`]/[`BalanceCode`] rather than `anyhow::Error`. Callers at
//! the command layer convert with `?` into `anyhow::Error` the way the
//! teacher's CLI layer converts `errno::Errno` at its edges.

use std::fmt;

/// Outcome of a `fix_nodes` planning pass (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceCode {
    /// Plan succeeded; `do_balance` may proceed.
    CarryOn,
    /// No free blocks available to satisfy the plan.
    NoDiskSpace,
    /// A read required to build the plan failed.
    IoError,
    /// The edit fits in the existing leaf without touching neighbors.
    NoBalancingNeeded,
}

impl fmt::Display for BalanceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BalanceCode::CarryOn => "carry on",
            BalanceCode::NoDiskSpace => "no disk space",
            BalanceCode::IoError => "I/O error",
            BalanceCode::NoBalancingNeeded => "no balancing needed",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by `reiserfs_core`.
#[derive(Debug)]
pub enum CoreError {
    Io(std::io::Error),
    /// Allocator exhaustion, propagated up through the balancer.
    NoDiskSpace,
    /// A structural invariant (spec.md §8) did not hold where it must.
    /// Inside the balancer this is always a programming error: `fix_nodes`
    /// promises a plan that `do_balance` can execute without further
    /// decisions, so failure here is fatal by construction.
    Inconsistent(String),
    /// Superblock, bitmap, or journal geometry failed a sanity check.
    BadGeometry(String),
    /// No volume found / bad magic.
    NotAFilesystem,
    /// `reiserfs_hash_correct` matched more than one hash family for a name
    /// and none was previously recorded — refuse to guess (spec.md §9).
    HashAmbiguous,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Io(e) => write!(f, "I/O error: {e}"),
            CoreError::NoDiskSpace => write!(f, "no disk space"),
            CoreError::Inconsistent(msg) => write!(f, "tree inconsistency: {msg}"),
            CoreError::BadGeometry(msg) => write!(f, "bad geometry: {msg}"),
            CoreError::NotAFilesystem => write!(f, "not a reiserfs volume"),
            CoreError::HashAmbiguous => {
                write!(f, "name hash matches more than one hash function")
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
