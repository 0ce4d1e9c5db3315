//! Filesystem collaborator contract.
//!
//! The engine touches storage in exactly two places: pre-loading the leading
//! bytes of File values marked `loadContents`, and expanding Directory
//! listings before expression evaluation. Both go through [`FsAccess`] so
//! remote or virtual filesystems can be plugged in; [`StdFsAccess`] covers
//! the local disk.

use std::fs;
use std::io::Read;
use std::path::Path;

use serde_json::{Value, json};

use crate::error::WorkflowError;

/// Upper bound on bytes embedded by `loadContents`.
pub const CONTENT_LIMIT: usize = 64 * 1024;

/// Read-only filesystem abstraction.
pub trait FsAccess {
    /// Reads up to `limit` bytes from `location`, lossily decoded as UTF-8.
    fn read_contents(&self, location: &str, limit: usize) -> Result<String, WorkflowError>;

    /// Returns one level of directory entries as File/Directory values.
    fn listing(&self, location: &str) -> Result<Vec<Value>, WorkflowError>;
}

/// Local-disk implementation of [`FsAccess`].
///
/// Accepts plain paths and `file://` locations.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFsAccess;

fn strip_scheme(location: &str) -> &str {
    location.strip_prefix("file://").unwrap_or(location)
}

impl FsAccess for StdFsAccess {
    fn read_contents(&self, location: &str, limit: usize) -> Result<String, WorkflowError> {
        let file = fs::File::open(strip_scheme(location))?;
        let mut buffer = Vec::with_capacity(limit.min(CONTENT_LIMIT));
        file.take(limit as u64).read_to_end(&mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn listing(&self, location: &str) -> Result<Vec<Value>, WorkflowError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(strip_scheme(location))? {
            let entry = entry?;
            let path = entry.path();
            let basename = entry.file_name().to_string_lossy().into_owned();
            let class = if path.is_dir() { "Directory" } else { "File" };
            entries.push(json!({
                "class": class,
                "location": path_location(&path),
                "basename": basename,
            }));
        }
        Ok(entries)
    }
}

fn path_location(path: &Path) -> String {
    format!("file://{}", path.display())
}
