//! Background task runner
//!
//! Two slots, one for the version check and one for the install. Each runs
//! at most one task; callers learn how a task went through
//! [`Notification`]s rather than return values. This is the whole surface a
//! presentation layer needs.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::launch;
use crate::updater::{Conflict, Notification, UpdateError, UpdateJob, Updater};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn is_running(slot: &Option<JoinHandle<()>>) -> bool {
    slot.as_ref().is_some_and(|handle| !handle.is_finished())
}

pub struct TaskRunner {
    updater: Arc<Updater>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    install_task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new(updater: Arc<Updater>) -> Self {
        Self {
            updater,
            refresh_task: Mutex::new(None),
            install_task: Mutex::new(None),
        }
    }

    pub fn updater(&self) -> &Arc<Updater> {
        &self.updater
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.updater.subscribe()
    }

    pub fn current_known_version(&self) -> Option<String> {
        self.updater.current_known_version()
    }

    pub fn installed_version(&self) -> String {
        self.updater.installed_version()
    }

    pub fn clear_installed_version(&self) -> anyhow::Result<()> {
        self.updater.clear_installed_version()
    }

    pub fn is_refreshing(&self) -> bool {
        is_running(&lock(&self.refresh_task))
    }

    pub fn is_installing(&self) -> bool {
        is_running(&lock(&self.install_task)) || self.updater.is_installing()
    }

    /// Whether quitting now would interrupt something
    pub fn is_busy(&self) -> bool {
        self.is_refreshing() || self.is_installing()
    }

    /// Start a version check; returns false when one is already running
    pub fn request_refresh(&self) -> bool {
        let mut slot = lock(&self.refresh_task);
        if is_running(&slot) {
            debug!("Version check already running");
            return false;
        }

        let updater = Arc::clone(&self.updater);
        *slot = Some(tokio::spawn(async move {
            // Outcome is delivered as a notification
            let _ = updater.refresh().await;
        }));
        true
    }

    /// Start installing the newest build into `target`
    ///
    /// Rejected up front when an install is running, the cached newest
    /// version is already installed, or `target` is not a directory. The
    /// cached version is only used for that check; the install itself
    /// resolves the newest release again.
    pub fn request_install(&self, target: PathBuf) -> Result<(), UpdateError> {
        let mut slot = lock(&self.install_task);
        if is_running(&slot) || self.updater.is_installing() {
            return Err(UpdateError::Conflict(Conflict::InstallActive));
        }

        let job = UpdateJob {
            target_path: target,
            known_version: self.updater.current_known_version().unwrap_or_default(),
        };
        self.updater.precheck(&job)?;

        let updater = Arc::clone(&self.updater);
        *slot = Some(tokio::spawn(async move {
            match updater.install(job).await {
                Ok(outcome) => {
                    if updater.store().auto_launch() {
                        if let Err(e) = launch::launch(&outcome.target) {
                            warn!("Auto-launch failed: {:#}", e);
                        }
                    }
                }
                Err(e) => debug!("Install task ended with: {}", e),
            }
        }));
        Ok(())
    }

    /// Wait for the running version check, if any
    pub async fn wait_for_refresh(&self) {
        let handle = lock(&self.refresh_task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Version check task ended abnormally: {}", e);
            }
        }
    }

    /// Wait for the running install, if any
    pub async fn wait_for_install(&self) {
        let handle = lock(&self.install_task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Install task ended abnormally: {}", e);
            }
        }
    }

    /// Stop background work before exit
    ///
    /// A version check is abandoned. An install is never interrupted: this
    /// waits until it has committed or rolled back.
    pub async fn shutdown(&self) {
        let refresh = lock(&self.refresh_task).take();
        if let Some(handle) = refresh {
            handle.abort();
            let _ = handle.await;
        }

        if self.is_installing() {
            info!("Waiting for the running update to finish");
        }
        self.wait_for_install().await;
    }
}
