//! Filesystem helpers shared across the crate.

pub mod archive;
pub mod fs;
pub mod glob;
