//! CLI subcommand implementations.

pub mod indices;
pub mod status;
pub mod sync;

/// Database used when `--db` is not given.
pub const DEFAULT_DB_PATH: &str = "asx_db.sqlite";
