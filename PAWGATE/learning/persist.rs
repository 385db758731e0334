//! Crash-safe file replacement.
//!
//! Readers of a path written through these helpers see either the previous
//! complete file or the new complete file, never a truncated one.

use std::{
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use uuid::Uuid;

use crate::errors::LearningResult;

/// Writes `bytes` to a temporary sibling, syncs it, then renames over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> LearningResult<()> {
    let tmp = staging_path(path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}

/// Like [`write_atomic`] but never replaces an existing file. The synced
/// temporary is hard-linked into place, so exactly one of several concurrent
/// writers to the same path wins. Returns `false` when `path` already exists.
pub fn write_new(path: &Path, bytes: &[u8]) -> LearningResult<bool> {
    let tmp = staging_path(path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        match fs::hard_link(&tmp, path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err),
        }
    })();
    let _ = fs::remove_file(&tmp);
    Ok(result?)
}

/// Copies `source` to a temporary sibling of `target`, syncs it, then renames
/// it over `target`. `source` is left in place.
pub fn replace_file(source: &Path, target: &Path) -> LearningResult<()> {
    let tmp = staging_path(target);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let result = (|| {
        fs::copy(source, &tmp)?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, target)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "staged".into(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.tmp-{}", Uuid::new_v4().simple()))
}
