//! Persistent user state
//!
//! A tiny SQLite key-value table remembering the install directory, the
//! installed version and two preference flags across runs. One handle per
//! store file per process; every access goes through a mutex so the install
//! task and the startup path never touch the connection at the same time.
//!
//! Reads never fail: a missing or malformed record yields the key's default,
//! which is written back so the next read sees a healthy row.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Store files currently held open by this process
static OPEN_STORES: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Named settings kept in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    /// Install directory (empty = unset)
    Path,
    /// Installed version (empty = unset)
    Version,
    /// Start the application after a successful install
    AutoLaunch,
    /// Hide the changelog when showing the newest release
    HideChangelog,
    /// RFC 3339 time of the last committed install
    InstalledAt,
}

impl SettingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::Path => "path",
            SettingKey::Version => "version",
            SettingKey::AutoLaunch => "autoLaunch",
            SettingKey::HideChangelog => "hideChangelog",
            SettingKey::InstalledAt => "installedAt",
        }
    }

    fn is_flag(&self) -> bool {
        matches!(self, SettingKey::AutoLaunch | SettingKey::HideChangelog)
    }

    /// Declared default, in stored form
    pub fn default_value(&self) -> &'static str {
        if self.is_flag() {
            "false"
        } else {
            ""
        }
    }

    /// Normalise a raw column value, `None` when it is malformed for this key
    fn validate(&self, raw: Value) -> Option<String> {
        match (self.is_flag(), raw) {
            (true, Value::Text(s)) if s == "true" || s == "false" => Some(s),
            (true, Value::Integer(0)) => Some("false".to_string()),
            (true, Value::Integer(1)) => Some("true".to_string()),
            (false, Value::Text(s)) => Some(s),
            _ => None,
        }
    }
}

/// Snapshot of everything the store remembers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledState {
    pub install_path: String,
    pub installed_version: String,
    pub auto_launch: bool,
    pub hide_changelog: bool,
}

/// SQLite-backed user state
pub struct StateStore {
    conn: Mutex<Option<Connection>>,
    /// Registered file path; `None` for in-memory stores
    path: Option<PathBuf>,
}

impl StateStore {
    /// Open or create the store at `db_path`
    ///
    /// A file that is not a usable database is moved aside to
    /// `<name>.corrupt` and replaced by a fresh one.
    pub fn open(db_path: &Path) -> Result<Self> {
        crate::paths::ensure_parent_dirs(db_path)
            .with_context(|| format!("Failed to create directory for {}", db_path.display()))?;

        let key = registry_key(db_path);
        {
            let mut open = OPEN_STORES.lock().map_err(|_| anyhow::anyhow!("store registry poisoned"))?;
            if !open.insert(key.clone()) {
                bail!("State store {} is already open in this process", db_path.display());
            }
        }

        match open_or_recover(db_path) {
            Ok(conn) => {
                debug!("Opened state store {}", db_path.display());
                Ok(Self {
                    conn: Mutex::new(Some(conn)),
                    path: Some(key),
                })
            }
            Err(e) => {
                unregister(&key);
                Err(e)
            }
        }
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to create in-memory database")?;
        create_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: None,
        })
    }

    /// Read a setting, healing malformed or missing records with the default
    pub fn get(&self, key: SettingKey) -> String {
        let Ok(guard) = self.conn.lock() else {
            warn!("State store lock poisoned; using default for {}", key.as_str());
            return key.default_value().to_string();
        };
        let Some(conn) = guard.as_ref() else {
            return key.default_value().to_string();
        };

        let raw = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                [key.as_str()],
                |row| row.get::<_, Value>(0),
            )
            .optional();

        let healthy = match raw {
            Ok(Some(value)) => match key.validate(value) {
                Some(value) => return value,
                None => {
                    warn!("Setting '{}' is malformed, resetting to default", key.as_str());
                    false
                }
            },
            Ok(None) => true,
            Err(e) => {
                warn!("Failed to read setting '{}': {}", key.as_str(), e);
                false
            }
        };

        if let Err(e) = write_value(conn, key, key.default_value()) {
            warn!("Could not heal setting '{}': {}", key.as_str(), e);
        } else if healthy {
            debug!("Seeded default for setting '{}'", key.as_str());
        }

        key.default_value().to_string()
    }

    pub fn get_bool(&self, key: SettingKey) -> bool {
        self.get(key) == "true"
    }

    /// Write a setting
    pub fn set(&self, key: SettingKey, value: &str) -> Result<()> {
        if key.is_flag() && value != "true" && value != "false" {
            bail!("Setting '{}' only accepts true or false, got '{}'", key.as_str(), value);
        }
        self.with_conn(|conn| write_value(conn, key, value))
    }

    pub fn set_bool(&self, key: SettingKey, value: bool) -> Result<()> {
        self.set(key, if value { "true" } else { "false" })
    }

    pub fn install_path(&self) -> String {
        self.get(SettingKey::Path)
    }

    pub fn installed_version(&self) -> String {
        self.get(SettingKey::Version)
    }

    pub fn auto_launch(&self) -> bool {
        self.get_bool(SettingKey::AutoLaunch)
    }

    pub fn hide_changelog(&self) -> bool {
        self.get_bool(SettingKey::HideChangelog)
    }

    pub fn set_install_path(&self, path: &str) -> Result<()> {
        self.set(SettingKey::Path, path)
    }

    pub fn clear_installed_version(&self) -> Result<()> {
        self.set(SettingKey::Version, "")
    }

    /// Persist a committed install: path, version and timestamp together
    pub fn record_install(&self, path: &str, version: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            write_value(&tx, SettingKey::Path, path)?;
            write_value(&tx, SettingKey::Version, version)?;
            write_value(&tx, SettingKey::InstalledAt, &now)?;
            tx.commit().context("Failed to commit install record")?;
            Ok(())
        })?;

        info!("Recorded install of {} at {}", version, path);
        Ok(())
    }

    pub fn installed_state(&self) -> InstalledState {
        InstalledState {
            install_path: self.install_path(),
            installed_version: self.installed_version(),
            auto_launch: self.auto_launch(),
            hide_changelog: self.hide_changelog(),
        }
    }

    /// Flush and release the handle
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let conn = match self.conn.get_mut() {
            Ok(conn) => conn.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let result = match conn {
            Some(conn) => {
                if self.path.is_some() {
                    if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                        warn!("WAL checkpoint failed: {}", e);
                    }
                }
                conn.close()
                    .map_err(|(_, e)| anyhow::anyhow!("Failed to close state store: {}", e))
            }
            None => Ok(()),
        };

        if let Some(path) = self.path.take() {
            unregister(&path);
            debug!("Released state store {}", path.display());
        }
        result
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("State store lock poisoned"))?;
        let conn = guard.as_ref().context("State store is closed")?;
        f(conn)
    }

    #[cfg(test)]
    fn write_raw(&self, key: &str, value: Value) {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
        .unwrap();
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{}", e);
        }
    }
}

fn registry_key(db_path: &Path) -> PathBuf {
    let parent = db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .and_then(|p| p.canonicalize().ok());
    match (parent, db_path.file_name()) {
        (Some(parent), Some(name)) => parent.join(name),
        _ => db_path.to_path_buf(),
    }
}

fn unregister(key: &Path) {
    if let Ok(mut open) = OPEN_STORES.lock() {
        open.remove(key);
    }
}

fn write_value(conn: &Connection, key: SettingKey, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
        params![key.as_str(), value],
    )
    .with_context(|| format!("Failed to write setting '{}'", key.as_str()))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value
        );",
    )
    .context("Failed to create tables")?;
    Ok(())
}

fn try_open(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;",
    )
    .context("Failed to configure SQLite pragmas")?;

    let check: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .context("Integrity check failed")?;
    if check != "ok" {
        bail!("Integrity check reported: {}", check);
    }

    create_tables(&conn)?;
    Ok(conn)
}

fn open_or_recover(db_path: &Path) -> Result<Connection> {
    match try_open(db_path) {
        Ok(conn) => Ok(conn),
        Err(e) => {
            warn!("State store {} is unusable ({:#}), recreating", db_path.display(), e);

            let mut aside = db_path.as_os_str().to_owned();
            aside.push(".corrupt");
            fs::rename(db_path, PathBuf::from(aside))
                .with_context(|| format!("Failed to move aside {}", db_path.display()))?;
            for suffix in ["-wal", "-shm"] {
                let mut side = db_path.as_os_str().to_owned();
                side.push(suffix);
                let _ = fs::remove_file(PathBuf::from(side));
            }

            try_open(db_path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_on_fresh_store() {
        let store = StateStore::in_memory().unwrap();
        assert_eq!(store.installed_state(), InstalledState::default());
        assert!(!store.auto_launch());
        assert!(!store.hide_changelog());
    }

    #[test]
    fn test_set_and_get() {
        let store = StateStore::in_memory().unwrap();
        store.set_install_path("/games/Dolphin-x64").unwrap();
        store.set_bool(SettingKey::AutoLaunch, true).unwrap();

        assert_eq!(store.install_path(), "/games/Dolphin-x64");
        assert!(store.auto_launch());
        assert!(store.set(SettingKey::HideChangelog, "yes").is_err());
    }

    #[test]
    fn test_corrupted_flag_heals_to_default() {
        let store = StateStore::in_memory().unwrap();
        store.write_raw("hideChangelog", Value::Text("sideways".into()));

        assert!(!store.hide_changelog());
        // Healed row is now a valid default
        assert_eq!(store.get(SettingKey::HideChangelog), "false");
        assert!(!store.hide_changelog());
    }

    #[test]
    fn test_corrupted_string_heals_to_default() {
        let store = StateStore::in_memory().unwrap();
        store.write_raw("version", Value::Blob(vec![0xff, 0xfe, 0x00]));

        assert_eq!(store.installed_version(), "");
        assert_eq!(store.installed_version(), "");
        store.with_conn(|conn| {
            let stored: Value = conn.query_row(
                "SELECT value FROM settings WHERE key = 'version'",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(stored, Value::Text(String::new()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_record_install() {
        let store = StateStore::in_memory().unwrap();
        store.record_install("/games/Dolphin", "5.0-12345").unwrap();

        assert_eq!(store.installed_version(), "5.0-12345");
        assert_eq!(store.install_path(), "/games/Dolphin");
        assert!(!store.get(SettingKey::InstalledAt).is_empty());

        store.clear_installed_version().unwrap();
        assert_eq!(store.installed_version(), "");
        assert_eq!(store.install_path(), "/games/Dolphin");
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp = tempdir().unwrap();
        let db = temp.path().join("user.db");

        let store = StateStore::open(&db).unwrap();
        store.record_install("/games/Dolphin", "5.0-1").unwrap();
        store.close().unwrap();

        let store = StateStore::open(&db).unwrap();
        assert_eq!(store.installed_version(), "5.0-1");
    }

    #[test]
    fn test_second_open_of_same_file_is_refused() {
        let temp = tempdir().unwrap();
        let db = temp.path().join("user.db");

        let first = StateStore::open(&db).unwrap();
        assert!(StateStore::open(&db).is_err());

        drop(first);
        assert!(StateStore::open(&db).is_ok());
    }

    #[test]
    fn test_corrupt_file_is_recreated() {
        let temp = tempdir().unwrap();
        let db = temp.path().join("user.db");
        fs::write(&db, vec![b'#'; 4096]).unwrap();

        let store = StateStore::open(&db).unwrap();
        assert_eq!(store.installed_version(), "");
        assert!(temp.path().join("user.db.corrupt").exists());

        store.set_install_path("/x").unwrap();
        assert_eq!(store.install_path(), "/x");
    }

    #[test]
    fn test_reads_after_close_return_defaults() {
        let temp = tempdir().unwrap();
        let mut store = StateStore::open(&temp.path().join("user.db")).unwrap();
        store.set_bool(SettingKey::AutoLaunch, true).unwrap();
        store.release().unwrap();

        assert!(!store.auto_launch());
        assert!(store.set_install_path("/y").is_err());
    }
}
