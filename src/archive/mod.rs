//! Archive extraction.
//!
//! The updater only needs "unpack this archive into that directory and tell
//! me whether it worked", expressed by the [`Extractor`] trait. The real
//! implementation drives the 7-Zip binary (see [`sevenzip`]).

pub mod sevenzip;

pub use sevenzip::{find_7z_binary, SevenZip};

use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

/// Extraction failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    /// The extraction tool is not installed; detected before running anything
    #[error("extraction tool unavailable: {0}")]
    Unavailable(String),

    /// The tool ran and reported failure
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Synchronous archive extraction capability
pub trait Extractor: Send + Sync {
    /// Precondition check, run before any filesystem mutation
    fn ensure_available(&self) -> Result<(), ExtractError>;

    /// Unpack `archive` under `dest`, returning the number of files written
    fn extract(&self, archive: &Path, dest: &Path) -> Result<usize, ExtractError>;
}

/// Count regular files under `dir`
pub fn count_files(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}

/// Hoist the contents of a lone top-level folder into `dir`
///
/// Dolphin archives wrap everything in `Dolphin-x64/`. When `dir` holds
/// exactly one entry and it is a directory, its children are moved up one
/// level and the emptied folder removed. Returns whether anything moved.
pub fn flatten_single_root(dir: &Path) -> io::Result<bool> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    if entries.len() != 1 {
        return Ok(false);
    }

    let only = entries.remove(0);
    if !only.file_type()?.is_dir() {
        return Ok(false);
    }

    // Move aside first so a child sharing the wrapper's name can't collide
    let wrapper = dir.join(".flatten-wrapper");
    fs::rename(only.path(), &wrapper)?;

    for child in fs::read_dir(&wrapper)? {
        let child = child?;
        fs::rename(child.path(), dir.join(child.file_name()))?;
    }
    fs::remove_dir(&wrapper)?;

    debug!("Flattened wrapper folder {:?} in {}", only.file_name(), dir.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_flatten_single_root() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("Dolphin-x64/Sys")).unwrap();
        fs::write(root.join("Dolphin-x64/Dolphin.exe"), b"exe").unwrap();
        fs::write(root.join("Dolphin-x64/Sys/a.ini"), b"ini").unwrap();

        assert!(flatten_single_root(root).unwrap());
        assert!(root.join("Dolphin.exe").is_file());
        assert!(root.join("Sys/a.ini").is_file());
        assert!(!root.join("Dolphin-x64").exists());
        assert_eq!(count_files(root), 2);
    }

    #[test]
    fn test_flatten_child_with_wrapper_name() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("Dolphin-x64/Dolphin-x64")).unwrap();
        fs::write(root.join("Dolphin-x64/Dolphin-x64/inner.txt"), b"x").unwrap();

        assert!(flatten_single_root(root).unwrap());
        assert!(root.join("Dolphin-x64/inner.txt").is_file());
    }

    #[test]
    fn test_flatten_leaves_multi_entry_dirs() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("Sys")).unwrap();
        fs::write(root.join("Dolphin.exe"), b"exe").unwrap();

        assert!(!flatten_single_root(root).unwrap());
        assert!(root.join("Sys").is_dir());
    }

    #[test]
    fn test_flatten_leaves_single_file() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("Dolphin.exe"), b"exe").unwrap();
        assert!(!flatten_single_root(temp.path()).unwrap());
    }
}
