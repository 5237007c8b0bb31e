//! Startup checks.
//!
//! # Responsibilities
//! - Make sure the record directory exists and is a directory
//!
//! # Design Decisions
//! - Fail fast: a missing or unusable output directory is fatal before bind

use std::fs;
use std::io;
use std::path::Path;

/// Create `dir` if needed and confirm it is a directory.
pub fn prepare_output_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    if !fs::metadata(dir)?.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", dir.display()),
        ));
    }
    tracing::info!(output_dir = %dir.display(), "Recording directory ready");
    Ok(())
}
