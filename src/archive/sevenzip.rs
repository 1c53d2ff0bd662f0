//! 7z binary integration for archive extraction.
//!
//! Dolphin builds ship as `.7z` archives, so extraction shells out to the
//! 7-Zip command line tool and waits for it to finish.
//!
//! # 7z Commands Reference
//!
//! - List files: `7z l -slt -ba archive.7z`
//!   - `-slt`: Technical listing (key=value format)
//!   - `-ba`: Bare output (no headers)
//!
//! - Extract all to directory: `7z x -y -aoa -o/output/dir -- archive.7z`
//!   - `-o{dir}`: Output directory
//!   - `-y`: Yes to all prompts
//!   - `-aoa`: Overwrite all existing files
//!
//! The binary is looked up as `7zz`, `7z` or `7za` on PATH, then as `bin/7zz`
//! or `bin/7za.exe` next to our own executable.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use super::{ExtractError, Extractor};

/// Binary names tried on PATH, in order
const BINARY_NAMES: &[&str] = &["7zz", "7z", "7za"];

/// Locations tried relative to the running executable
const BUNDLED_PATHS: &[&str] = &["bin/7zz", "bin/7z.exe", "bin/7za.exe", "7zz", "7za.exe"];

/// Information about a file in an archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Path within the archive
    pub path: String,
    /// Uncompressed size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Find a 7-Zip binary without an explicit override
pub fn find_7z_binary() -> Option<PathBuf> {
    for name in BINARY_NAMES {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    let exe_dir = std::env::current_exe().ok()?.parent()?.to_path_buf();
    BUNDLED_PATHS
        .iter()
        .map(|rel| exe_dir.join(rel))
        .find(|p| p.is_file())
}

/// Extraction through the 7-Zip command line tool
#[derive(Debug, Clone, Default)]
pub struct SevenZip {
    explicit: Option<PathBuf>,
}

impl SevenZip {
    /// `explicit` pins the binary; `None` searches PATH and the install dir
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self { explicit }
    }

    /// Resolve the binary to run
    pub fn binary(&self) -> Result<PathBuf, ExtractError> {
        match &self.explicit {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(ExtractError::Unavailable(format!(
                "configured 7-Zip binary {} does not exist",
                path.display()
            ))),
            None => find_7z_binary().ok_or_else(|| {
                ExtractError::Unavailable(
                    "7-Zip not found. Please install 7-Zip (p7zip) or place 7zz in the bin/ directory."
                        .to_string(),
                )
            }),
        }
    }

    /// List all files in an archive.
    pub fn list_archive(&self, archive_path: &Path) -> Result<Vec<ArchiveEntry>, ExtractError> {
        let sz_path = self.binary()?;

        let output = Command::new(&sz_path)
            .arg("l")           // List
            .arg("-slt")        // Technical listing format (key=value)
            .arg("-ba")         // Bare output (no headers)
            .arg("-scsUTF-8")   // Force UTF-8 charset for filenames
            .arg("--")
            .arg(archive_path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ExtractError::Failed(format!("could not run {}: {}", sz_path.display(), e)))?;

        if !output.status.success() {
            return Err(ExtractError::Failed(format!(
                "7z list failed for {}: {}",
                archive_path.display(),
                diagnostics(&output.stdout, &output.stderr)
            )));
        }

        Ok(parse_7z_list(&output.stdout))
    }
}

impl Extractor for SevenZip {
    fn ensure_available(&self) -> Result<(), ExtractError> {
        let path = self.binary()?;
        debug!("Using 7-Zip at {}", path.display());
        Ok(())
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<usize, ExtractError> {
        let sz_path = self.binary()?;
        let expected_files = self
            .list_archive(archive)?
            .iter()
            .filter(|e| !e.is_dir)
            .count();

        fs::create_dir_all(dest)
            .map_err(|e| ExtractError::Failed(format!("could not create {}: {}", dest.display(), e)))?;

        info!("Extracting {} -> {}", archive.display(), dest.display());
        let output = Command::new(&sz_path)
            .arg("x")            // Extract with full paths
            .arg("-y")           // Yes to all prompts
            .arg("-aoa")         // Overwrite all existing files
            .arg("-scsUTF-8")    // Force UTF-8 charset for filenames
            .arg(format!("-o{}", dest.display()))
            .arg("--")
            .arg(archive)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ExtractError::Failed(format!("could not run {}: {}", sz_path.display(), e)))?;

        if !output.status.success() {
            return Err(ExtractError::Failed(format!(
                "7z exited with {} for {}: {}",
                output.status,
                archive.display(),
                diagnostics(&output.stdout, &output.stderr)
            )));
        }

        #[cfg(unix)]
        fix_permissions_recursive(dest);

        let extracted = super::count_files(dest);
        if extracted < expected_files {
            return Err(ExtractError::Failed(format!(
                "incomplete extraction: {} of {} files written",
                extracted, expected_files
            )));
        }

        Ok(extracted)
    }
}

/// Combined, trimmed tool output for error messages
fn diagnostics(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stderr).trim().to_string();
    let out = String::from_utf8_lossy(stdout);
    let out = out.trim();
    if !out.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(out);
    }
    if text.is_empty() {
        "no output".to_string()
    } else {
        text
    }
}

/// Parse 7z technical listing output into ArchiveEntry structs.
fn parse_7z_list(output: &[u8]) -> Vec<ArchiveEntry> {
    let mut entries = Vec::new();
    let mut current: HashMap<String, String> = HashMap::new();

    let mut flush = |current: &mut HashMap<String, String>| {
        if let Some(path) = current.get("Path") {
            let is_dir = current.get("Folder").map(|v| v == "+").unwrap_or(false)
                || current
                    .get("Attributes")
                    .map(|a| a.starts_with('D'))
                    .unwrap_or(false);
            let size = current
                .get("Size")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            entries.push(ArchiveEntry {
                path: path.replace('\\', "/"),
                size,
                is_dir,
            });
        }
        current.clear();
    };

    for line in BufReader::new(output).lines().map_while(Result::ok) {
        let line = line.trim();

        if line.is_empty() {
            flush(&mut current);
            continue;
        }

        if let Some((key, value)) = line.split_once(" = ") {
            current.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    flush(&mut current);

    entries
}

/// Make extracted files readable and directories traversable.
///
/// Archives built on Windows can carry attribute bits that map to
/// unusable Unix modes.
#[cfg(unix)]
fn fix_permissions_recursive(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if let Ok(metadata) = fs::metadata(path) {
            let mut perms = metadata.permissions();
            let mode = perms.mode();

            if metadata.is_dir() {
                if mode & 0o700 != 0o700 {
                    perms.set_mode(mode | 0o755);
                    fs::set_permissions(path, perms).ok();
                }
            } else if mode & 0o600 != 0o600 {
                perms.set_mode(mode | 0o644);
                fs::set_permissions(path, perms).ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_7z_list() {
        let sample = b"\
Path = Dolphin-x64/Dolphin.exe
Folder = -
Size = 1234
Attributes = ....A

Path = Dolphin-x64\\Sys\\GC\\font.bin
Folder = -
Size = 5678
Attributes = ....A

Path = Dolphin-x64
Folder = +
Size = 0
Attributes = D....
";
        let entries = parse_7z_list(sample);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, "Dolphin-x64/Dolphin.exe");
        assert_eq!(entries[0].size, 1234);
        assert!(!entries[0].is_dir);
        assert_eq!(entries[1].path, "Dolphin-x64/Sys/GC/font.bin");
        assert!(entries[2].is_dir);
    }

    #[test]
    fn test_missing_explicit_binary_is_unavailable() {
        let temp = tempdir().unwrap();
        let sz = SevenZip::new(Some(temp.path().join("no-such-7z")));

        assert!(matches!(sz.ensure_available(), Err(ExtractError::Unavailable(_))));
        let result = sz.extract(&temp.path().join("a.7z"), &temp.path().join("out"));
        assert!(matches!(result, Err(ExtractError::Unavailable(_))));
        assert!(!temp.path().join("out").exists());
    }

    #[test]
    fn test_diagnostics_combines_streams() {
        assert_eq!(diagnostics(b"", b""), "no output");
        assert_eq!(diagnostics(b" out ", b"err\n"), "err\nout");
    }

    #[test]
    fn test_extract_round_trip_when_7z_installed() {
        let Some(binary) = find_7z_binary() else {
            eprintln!("7-Zip not installed, skipping");
            return;
        };

        let temp = tempdir().unwrap();
        let src = temp.path().join("Dolphin-x64");
        fs::create_dir_all(src.join("Sys")).unwrap();
        fs::write(src.join("Dolphin.exe"), b"binary").unwrap();
        fs::write(src.join("Sys/config.ini"), b"[Core]").unwrap();

        let archive = temp.path().join("build.7z");
        let status = Command::new(&binary)
            .current_dir(temp.path())
            .args(["a", "-y", "build.7z", "Dolphin-x64"])
            .stdout(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success());

        let sz = SevenZip::new(Some(binary));
        let out = temp.path().join("out");
        let count = sz.extract(&archive, &out).unwrap();
        assert_eq!(count, 2);
        assert_eq!(fs::read(out.join("Dolphin-x64/Sys/config.ini")).unwrap(), b"[Core]");
    }

    #[test]
    fn test_corrupt_archive_fails_when_7z_installed() {
        let Some(binary) = find_7z_binary() else {
            return;
        };

        let temp = tempdir().unwrap();
        let archive = temp.path().join("broken.7z");
        fs::write(&archive, b"definitely not an archive").unwrap();

        let result = SevenZip::new(Some(binary)).extract(&archive, &temp.path().join("out"));
        assert!(matches!(result, Err(ExtractError::Failed(_))));
    }
}
