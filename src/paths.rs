//! Path derivation for installs and downloads
//!
//! The swap protocol needs sibling paths next to the install directory so
//! that every rename stays on a single filesystem:
//! - `<parent>/.<name>.backup`  holds the previous install during an update
//! - `<parent>/.<name>.staging` receives the freshly extracted archive

use std::path::{Path, PathBuf};

/// Marker appended to the sibling that holds the previous install
pub const BACKUP_MARKER: &str = "backup";

/// Marker appended to the sibling that receives the new extraction
pub const STAGING_MARKER: &str = "staging";

/// Application directory name under the platform data dir
pub const APP_DIR_NAME: &str = "dolphin-update";

/// Default data directory (`~/.local/share/dolphin-update` on Linux)
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join(APP_DIR_NAME))
}

/// Build a hidden sibling of `target` tagged with `marker`
///
/// `/games/Dolphin-x64` + `backup` -> `/games/.Dolphin-x64.backup`
pub fn sibling_path(target: &Path, marker: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "install".to_string());

    let sibling = format!(".{}.{}", name, marker);
    match target.parent() {
        Some(parent) => parent.join(sibling),
        None => PathBuf::from(sibling),
    }
}

pub fn backup_path(target: &Path) -> PathBuf {
    sibling_path(target, BACKUP_MARKER)
}

pub fn staging_path(target: &Path) -> PathBuf {
    sibling_path(target, STAGING_MARKER)
}

/// Last path segment of a URL, without query string or fragment
/// `https://dl.dolphin-emu.org/builds/dolphin-master-5.0-12345-x64.7z?x=1` -> `dolphin-master-5.0-12345-x64.7z`
pub fn file_name_from_url(url: &str) -> Option<&str> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment);

    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
}

/// Create parent directories for a path if they don't exist
pub fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Whether `inner` is `outer` or lives somewhere beneath it
pub fn is_within(inner: &Path, outer: &Path) -> bool {
    match (inner.canonicalize(), outer.canonicalize()) {
        (Ok(inner), Ok(outer)) => inner.starts_with(outer),
        _ => inner.starts_with(outer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sibling_paths() {
        let target = Path::new("/games/Dolphin-x64");
        assert_eq!(backup_path(target), PathBuf::from("/games/.Dolphin-x64.backup"));
        assert_eq!(staging_path(target), PathBuf::from("/games/.Dolphin-x64.staging"));
    }

    #[test]
    fn test_sibling_of_relative_name() {
        let target = Path::new("Dolphin");
        assert_eq!(backup_path(target), PathBuf::from(".Dolphin.backup"));
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://dl.dolphin-emu.org/builds/dolphin-master-5.0-12345-x64.7z"),
            Some("dolphin-master-5.0-12345-x64.7z")
        );
        assert_eq!(
            file_name_from_url("https://host/a/b.7z?token=abc#frag"),
            Some("b.7z")
        );
        assert_eq!(file_name_from_url("https://host/dir/"), Some("dir"));
        assert_eq!(file_name_from_url("https://"), None);
        assert_eq!(file_name_from_url(""), None);
    }

    #[test]
    fn test_is_within() {
        let temp = tempfile::tempdir().unwrap();
        let nested = temp.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        assert!(is_within(&nested, temp.path()));
        assert!(!is_within(temp.path(), &nested));
    }
}
