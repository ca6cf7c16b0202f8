//! Filesystem helpers that attach the operation and path to I/O errors.

use std::path::Path;

use crate::{Error, Result};

pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Create `path` and any missing parents.
pub fn ensure_dir_all_sync(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error("creating directory", path, e))
}

/// Create the directory a file is about to be written into.
pub fn ensure_parent_dir_sync(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) => ensure_dir_all_sync(parent),
        None => Ok(()),
    }
}
