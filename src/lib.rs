//! Shared support for the `mkfs` and `fsck` binaries: logging setup and
//! the handful of CLI argument types both tools parse the same way.

pub mod cli;
pub mod logging;
