//! Start the installed emulator after an update

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::info;

/// Executable names tried in order inside the install directory
pub const LAUNCH_CANDIDATES: &[&str] = &["Dolphin.exe", "Dolphin", "dolphin-emu"];

/// First launchable executable in `install_dir`
pub fn find_executable(install_dir: &Path) -> Option<PathBuf> {
    LAUNCH_CANDIDATES
        .iter()
        .map(|name| install_dir.join(name))
        .find(|path| path.is_file())
}

/// Spawn the emulator without waiting for it
pub fn launch(install_dir: &Path) -> Result<PathBuf> {
    let exe = find_executable(install_dir).with_context(|| {
        format!(
            "No Dolphin executable ({}) in {}",
            LAUNCH_CANDIDATES.join(", "),
            install_dir.display()
        )
    })?;

    let child = Command::new(&exe)
        .current_dir(install_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to start {}", exe.display()))?;

    info!("Launched {} (pid {})", exe.display(), child.id());
    // Detach: the emulator outlives us
    std::mem::forget(child);
    Ok(exe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_find_executable_prefers_windows_name() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("dolphin-emu"), b"").unwrap();
        fs::write(temp.path().join("Dolphin.exe"), b"").unwrap();

        assert_eq!(find_executable(temp.path()), Some(temp.path().join("Dolphin.exe")));
    }

    #[test]
    fn test_find_executable_ignores_directories() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("Dolphin")).unwrap();
        assert_eq!(find_executable(temp.path()), None);
    }

    #[test]
    fn test_launch_without_executable_fails() {
        let temp = tempdir().unwrap();
        let err = launch(temp.path()).unwrap_err();
        assert!(err.to_string().contains("No Dolphin executable"));
    }
}
