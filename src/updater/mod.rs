//! Update orchestration
//!
//! Drives one install job through:
//! 1. Precondition checks (up to date, target exists, extractor present)
//! 2. Re-resolving the newest release
//! 3. Downloading the archive to the scratch directory
//! 4. Moving the live install aside and extracting into staging
//! 5. Swapping the new tree in and recording the version
//!
//! Any failure once step 4 has begun rolls the previous install back before
//! it is reported. Progress goes out as [`Notification`]s on a broadcast channel.

pub mod error;
pub mod swap;

pub use error::{Conflict, ErrorKind, UpdateError};
pub use swap::{carry_over, recover, Recovery, SwapPaths, SwapTransaction};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::archive::{flatten_single_root, Extractor, SevenZip};
use crate::catalog::{CatalogClient, ReleaseSource, RemoteRelease};
use crate::config::AppConfig;
use crate::downloaders::{ArchiveFetcher, HttpClient, HttpFetcher, ProgressCallback};
use crate::paths;
use crate::store::StateStore;

/// Notifications buffered per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 256;

/// Where the install job currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdatePhase {
    Idle,
    CheckingVersion,
    Downloading,
    Extracting,
    Swapping,
    RollingBack,
    Committed,
    Failed,
}

impl UpdatePhase {
    pub fn name(&self) -> &'static str {
        match self {
            UpdatePhase::Idle => "Idle",
            UpdatePhase::CheckingVersion => "Checking version",
            UpdatePhase::Downloading => "Downloading",
            UpdatePhase::Extracting => "Extracting",
            UpdatePhase::Swapping => "Swapping",
            UpdatePhase::RollingBack => "Rolling back",
            UpdatePhase::Committed => "Committed",
            UpdatePhase::Failed => "Failed",
        }
    }
}

/// Which background task a terminal notification belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskKind {
    Refresh,
    Install,
}

/// Events delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Notification {
    Phase(UpdatePhase),
    /// Human-readable progress line ("Downloading...", "Extracting...")
    Status(String),
    Progress { downloaded: u64, total: u64 },
    /// A refresh resolved the newest release
    ReleaseKnown(RemoteRelease),
    Finished {
        task: TaskKind,
        version: Option<String>,
    },
    Failed {
        task: TaskKind,
        message: String,
        severe: bool,
    },
}

/// One install request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateJob {
    pub target_path: PathBuf,
    /// Version the caller believed was newest when asking
    pub known_version: String,
}

/// Result of a committed install
#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    pub release: RemoteRelease,
    pub version: String,
    pub target: PathBuf,
    pub files: usize,
}

/// Clears the install slot however the job ends
struct SlotGuard<'a>(&'a AtomicBool);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Downloaded archive, deleted when the job ends
struct ScratchFile(PathBuf);

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.0) {
            Ok(()) => debug!("Removed scratch archive {}", self.0.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove scratch archive {}: {}", self.0.display(), e),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The update engine
pub struct Updater {
    source: Arc<dyn ReleaseSource>,
    fetcher: Arc<dyn ArchiveFetcher>,
    extractor: Arc<dyn Extractor>,
    store: Arc<StateStore>,
    downloads_dir: PathBuf,
    known: Mutex<Option<RemoteRelease>>,
    phase: Mutex<UpdatePhase>,
    installing: AtomicBool,
    events: broadcast::Sender<Notification>,
}

impl Updater {
    pub fn new(
        source: Arc<dyn ReleaseSource>,
        fetcher: Arc<dyn ArchiveFetcher>,
        extractor: Arc<dyn Extractor>,
        store: Arc<StateStore>,
        downloads_dir: PathBuf,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            source,
            fetcher,
            extractor,
            store,
            downloads_dir,
            known: Mutex::new(None),
            phase: Mutex::new(UpdatePhase::Idle),
            installing: AtomicBool::new(false),
            events,
        }
    }

    /// Wire up the live page client, HTTP downloader and 7-Zip
    pub fn from_config(config: &AppConfig, store: Arc<StateStore>) -> anyhow::Result<Self> {
        let catalog = CatalogClient::new(config)?;
        let fetcher = HttpFetcher::new(HttpClient::new(&config.user_agent)?, config.max_retries);
        let extractor = SevenZip::new(config.seven_zip.clone());

        Ok(Self::new(
            Arc::new(catalog),
            Arc::new(fetcher),
            Arc::new(extractor),
            store,
            config.downloads_dir(),
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn phase(&self) -> UpdatePhase {
        *lock(&self.phase)
    }

    pub fn is_installing(&self) -> bool {
        self.installing.load(Ordering::Acquire)
    }

    /// Newest release seen by the last successful refresh or install
    pub fn known_release(&self) -> Option<RemoteRelease> {
        lock(&self.known).clone()
    }

    pub fn current_known_version(&self) -> Option<String> {
        lock(&self.known).as_ref().map(RemoteRelease::version)
    }

    pub fn installed_version(&self) -> String {
        self.store.installed_version()
    }

    /// Forget the installed version so the next install is not refused as up to date
    pub fn clear_installed_version(&self) -> anyhow::Result<()> {
        self.store.clear_installed_version()
    }

    /// Remember the install directory; it must already exist
    pub fn set_install_path(&self, path: &Path) -> Result<(), UpdateError> {
        if !path.is_dir() {
            return Err(UpdateError::filesystem(
                format!("{} is not a directory", path.display()),
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        self.store
            .set_install_path(&path.to_string_lossy())
            .map_err(|e| UpdateError::filesystem("Failed to save install path", io::Error::other(format!("{:#}", e))))
    }

    fn report(&self, notification: Notification) {
        // No subscribers is fine
        let _ = self.events.send(notification);
    }

    fn report_status(&self, message: &str) {
        info!("{}", message);
        self.report(Notification::Status(message.to_string()));
    }

    fn set_phase(&self, phase: UpdatePhase) {
        *lock(&self.phase) = phase;
        debug!("Phase: {}", phase.name());
        self.report(Notification::Phase(phase));
    }

    /// Resolve the newest release and remember it
    ///
    /// On failure the previously known release is kept.
    pub async fn refresh(&self) -> Result<RemoteRelease, UpdateError> {
        let entered = {
            let mut phase = lock(&self.phase);
            if *phase == UpdatePhase::Idle {
                *phase = UpdatePhase::CheckingVersion;
                true
            } else {
                false
            }
        };
        if entered {
            self.report(Notification::Phase(UpdatePhase::CheckingVersion));
        }
        self.report_status("Getting newest version...");

        let result = self.source.fetch_release().await.map_err(UpdateError::from);

        if entered {
            let mut phase = lock(&self.phase);
            if *phase == UpdatePhase::CheckingVersion {
                *phase = UpdatePhase::Idle;
                drop(phase);
                self.report(Notification::Phase(UpdatePhase::Idle));
            }
        }

        match result {
            Ok(release) => {
                info!("Newest version: {} ({})", release.version(), release.file_name);
                *lock(&self.known) = Some(release.clone());
                self.report(Notification::ReleaseKnown(release.clone()));
                self.report(Notification::Finished {
                    task: TaskKind::Refresh,
                    version: Some(release.version()),
                });
                Ok(release)
            }
            Err(e) => {
                warn!("Version check failed: {}", e);
                self.report(Notification::Failed {
                    task: TaskKind::Refresh,
                    message: e.user_message(),
                    severe: false,
                });
                Err(e)
            }
        }
    }

    /// Checks that reject a request before anything is touched
    pub fn precheck(&self, job: &UpdateJob) -> Result<(), UpdateError> {
        let installed = self.store.installed_version();
        if !job.known_version.is_empty() && job.known_version == installed {
            return Err(UpdateError::Conflict(Conflict::UpToDate(installed)));
        }

        // A missing target with a backup beside it is an interrupted swap
        if !job.target_path.is_dir() && !paths::backup_path(&job.target_path).is_dir() {
            return Err(UpdateError::filesystem(
                format!("{} is not a directory", job.target_path.display()),
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }

        if paths::is_within(&self.downloads_dir, &job.target_path) {
            return Err(UpdateError::filesystem(
                format!(
                    "Download directory {} is inside the install directory",
                    self.downloads_dir.display()
                ),
                io::Error::from(io::ErrorKind::InvalidInput),
            ));
        }

        Ok(())
    }

    /// Run one install job to a terminal state
    ///
    /// Refused with [`Conflict::InstallActive`] while another job runs; the
    /// running job is not affected.
    pub async fn install(&self, job: UpdateJob) -> Result<InstallOutcome, UpdateError> {
        if self
            .installing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(UpdateError::Conflict(Conflict::InstallActive));
        }
        let _slot = SlotGuard(&self.installing);

        info!("Installing into {}", job.target_path.display());
        let result = self.run_install(&job).await;

        match &result {
            Ok(outcome) => {
                self.set_phase(UpdatePhase::Committed);
                self.report_status("Done");
                self.report(Notification::Finished {
                    task: TaskKind::Install,
                    version: Some(outcome.version.clone()),
                });
            }
            Err(e) => {
                if e.is_severe() {
                    error!("Install failed: {}", e);
                } else {
                    warn!("Install failed: {}", e);
                }
                self.set_phase(UpdatePhase::Failed);
                self.report(Notification::Failed {
                    task: TaskKind::Install,
                    message: e.user_message(),
                    severe: e.is_severe(),
                });
            }
        }

        self.set_phase(UpdatePhase::Idle);
        result
    }

    async fn run_install(&self, job: &UpdateJob) -> Result<InstallOutcome, UpdateError> {
        self.precheck(job)?;

        let swap_paths = SwapPaths::for_target(&job.target_path);
        let recovery = recover(&swap_paths)?;
        if recovery.restored_backup {
            self.report_status("Restored the installation left aside by an interrupted update");
        }
        if recovery.removed_stale_backup {
            self.report_status("Removed a stale backup from an earlier update");
        }

        self.extractor.ensure_available()?;

        self.set_phase(UpdatePhase::Downloading);
        self.report_status("Getting newest version...");
        let release = self.source.fetch_release().await?;
        *lock(&self.known) = Some(release.clone());
        self.report(Notification::ReleaseKnown(release.clone()));

        let version = release.version();
        let installed = self.store.installed_version();
        if version == installed {
            return Err(UpdateError::Conflict(Conflict::UpToDate(installed)));
        }

        fs::create_dir_all(&self.downloads_dir).map_err(|e| {
            UpdateError::filesystem(format!("Failed to create {}", self.downloads_dir.display()), e)
        })?;
        let scratch = ScratchFile(self.downloads_dir.join(&release.file_name));

        self.report_status("Downloading...");
        let events = self.events.clone();
        let progress: ProgressCallback = Box::new(move |downloaded, total| {
            let _ = events.send(Notification::Progress { downloaded, total });
        });
        let bytes = self
            .fetcher
            .fetch(&release.download_url, &scratch.0, Some(&progress))
            .await
            .map_err(|e| UpdateError::Network(format!("{:#}", e)))?;
        debug!("Downloaded {} bytes to {}", bytes, scratch.0.display());

        self.set_phase(UpdatePhase::Extracting);
        self.report_status("Downloaded. Extracting...");
        let mut txn = SwapTransaction::begin(swap_paths)?;

        let extractor = Arc::clone(&self.extractor);
        let archive = scratch.0.clone();
        let staging = txn.staging().to_path_buf();
        let backup = txn.paths().backup.clone();
        let extracted = tokio::task::spawn_blocking(move || -> Result<usize, UpdateError> {
            let files = extractor.extract(&archive, &staging)?;
            flatten_single_root(&staging)
                .map_err(|e| UpdateError::filesystem("Failed to unwrap extracted build", e))?;
            let kept = carry_over(&backup, &staging).map_err(|e| {
                UpdateError::filesystem("Failed to carry user files into the new build", e)
            })?;
            debug!("Kept {} files from the previous install", kept);
            Ok(files)
        })
        .await
        .map_err(|e| UpdateError::Extraction(format!("extraction task did not finish: {}", e)))
        .and_then(|r| r);

        let files = match extracted {
            Ok(files) => files,
            Err(e) => return Err(self.roll_back(txn, e)),
        };

        self.set_phase(UpdatePhase::Swapping);
        self.report_status("Installing...");
        if let Err(e) = txn.swap_in() {
            return Err(self.roll_back(txn, e));
        }

        let target = job.target_path.to_string_lossy();
        if let Err(e) = self.store.record_install(&target, &version) {
            let cause = UpdateError::filesystem(
                "Failed to record the installed version",
                io::Error::other(format!("{:#}", e)),
            );
            return Err(self.roll_back(txn, cause));
        }

        txn.commit();
        info!("Installed {} ({} files) at {}", version, files, job.target_path.display());

        Ok(InstallOutcome {
            release,
            version,
            target: job.target_path.clone(),
            files,
        })
    }

    fn roll_back(&self, txn: SwapTransaction, cause: UpdateError) -> UpdateError {
        warn!("Rolling back after: {}", cause);
        self.set_phase(UpdatePhase::RollingBack);
        self.report_status("Restoring previous installation...");

        let swap_paths = txn.paths().clone();
        match txn.rollback() {
            Ok(()) => UpdateError::RolledBack(Box::new(cause)),
            Err(reason) => {
                error!("Rollback failed: {}", reason);
                UpdateError::RollbackFailed {
                    target: swap_paths.target,
                    backup: swap_paths.backup,
                    reason,
                    cause: Box::new(cause),
                }
            }
        }
    }
}
