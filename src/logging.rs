//! `env_logger` setup shared by `mkfs` and `fsck`. Both tools print their
//! own progress via `log::info!`/`log::warn!`; this just wires that up to
//! stderr with a level controlled by `-v`/`-q` and `RUST_LOG`.

use log::LevelFilter;

/// Initialize logging. `verbosity` is the net count of `-v` minus `-q`
/// occurrences on the command line; `RUST_LOG`, if set, wins outright.
pub fn init(verbosity: i32) {
    let default_level = match verbosity {
        i32::MIN..=-1 => LevelFilter::Error,
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    builder.format_timestamp(None).format_target(false);
    let _ = builder.try_init();
}
