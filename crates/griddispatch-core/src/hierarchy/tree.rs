//! Directory listing primitives for the tree walk.
//!
//! The walk itself lives in the dispatcher because every directory's
//! submission is interleaved with the walk. This module only answers
//! "what is in this directory" and "is this entry a directory".

use std::io;
use std::path::{Path, PathBuf};

/// List the entries of `dir`, sorted by path.
///
/// Sorting keeps submission order reproducible across filesystems.
///
/// # Errors
///
/// Returns the underlying I/O error if the directory cannot be read.
pub async fn read_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

/// Whether `path` is a directory, following symlinks.
///
/// # Errors
///
/// Returns the underlying I/O error if metadata cannot be read.
pub async fn is_directory(path: &Path) -> io::Result<bool> {
    Ok(tokio::fs::metadata(path).await?.is_dir())
}
