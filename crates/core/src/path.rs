//! Path canonicalization and comparison
//!
//! Watch roots are canonicalized once on registration; every later
//! comparison goes through [`PathKey`], which folds case on platforms whose
//! default filesystems are case-insensitive.

use crate::{Result, WatchError};
use normpath::PathExt;
use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Canonicalize a watch target, requiring an existing directory
pub fn canonicalize_dir(path: &Path) -> Result<PathBuf> {
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => WatchError::invalid_path(path, "does not exist"),
        _ => WatchError::invalid_path(path, e.to_string()),
    })?;

    if !metadata.is_dir() {
        return Err(WatchError::invalid_path(path, "not a directory"));
    }

    let normalized = path
        .normalize()
        .map_err(|e| WatchError::invalid_path(path, e.to_string()))?;
    Ok(normalized.into_path_buf())
}

/// Lexically remove `.` components and resolve `..` where possible
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `/..` is `/`
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Comparison key for paths
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey(PathBuf);

impl PathKey {
    pub fn new(path: &Path) -> Self {
        Self(fold(&clean(path)))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

#[cfg(windows)]
fn fold(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().replace('/', "\\").to_lowercase())
}

#[cfg(not(windows))]
fn fold(path: &Path) -> PathBuf {
    path.to_path_buf()
}

/// Compare two paths under the platform's conventions
pub fn paths_equal(a: &Path, b: &Path) -> bool {
    PathKey::new(a) == PathKey::new(b)
}

/// True if `path` is `root` or lies underneath it
pub fn is_within(root: &Path, path: &Path) -> bool {
    PathKey::new(path).0.starts_with(&PathKey::new(root).0)
}

/// Split a backend-relative entry path into (absolute directory, leaf name)
///
/// Returns `None` when `relative` names no entry (empty, `.` or `..`).
pub fn split_entry(dir: &Path, relative: &Path) -> Option<(PathBuf, String)> {
    let relative = clean(relative);
    let name = relative.file_name()?;
    if relative.starts_with("..") {
        return None;
    }

    let directory = match relative.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => dir.join(parent),
        _ => dir.to_path_buf(),
    };
    Some((directory, file_name_string(name)))
}

/// Lossy UTF-8 conversion for entry names
pub fn file_name_string(name: &OsStr) -> String {
    name.to_string_lossy().into_owned()
}
