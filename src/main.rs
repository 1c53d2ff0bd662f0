//! dolphin-update - keeps a Dolphin emulator development build current

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dolphin_update::catalog::RemoteRelease;
use dolphin_update::config::AppConfig;
use dolphin_update::runner::TaskRunner;
use dolphin_update::store::{SettingKey, StateStore};
use dolphin_update::updater::{Notification, TaskKind, Updater};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dolphin-update")]
#[command(version)]
#[command(about = "Installs the newest Dolphin development build without ever breaking the current one")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to dolphin-update.log in the data directory
    #[arg(long, global = true)]
    log_file: bool,

    /// Directory for the state database, downloads and logs
    #[arg(long, global = true, env = "DOLPHIN_UPDATE_HOME")]
    data_dir: Option<PathBuf>,

    /// Download page to check for new builds
    #[arg(long, global = true, env = "DOLPHIN_UPDATE_URL")]
    page_url: Option<String>,

    /// Path to the 7-Zip binary (searched on PATH when omitted)
    #[arg(long = "7z", global = true, env = "DOLPHIN_UPDATE_7Z")]
    seven_zip: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the installed build and check for a newer one (default)
    Status,

    /// Show the stored install folder and version without going online
    Info {
        #[arg(long)]
        json: bool,
    },

    /// Show the newest build and its changelog
    Check {
        #[arg(long)]
        json: bool,
    },

    /// Remember the Dolphin install folder
    SetFolder {
        /// Existing folder holding Dolphin
        dir: PathBuf,
    },

    /// Forget the installed version so the newest build is installed again
    Clear {
        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Download and install the newest build
    Install {
        /// Install folder (defaults to the stored one, and is stored)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Change a preference
    Set {
        #[command(subcommand)]
        setting: Setting,
    },
}

#[derive(Subcommand)]
enum Setting {
    /// Start Dolphin after a successful update
    AutoLaunch { value: Toggle },
    /// Leave the changelog out of `check` output
    HideChangelog { value: Toggle },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl From<Toggle> for bool {
    fn from(t: Toggle) -> bool {
        matches!(t, Toggle::On)
    }
}

/// Set up stderr or file logging; the guard must outlive `main`
fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    if let Some(path) = log_file {
        let dir = path.parent().context("Log path has no parent directory")?;
        let name = path.file_name().context("Log path has no file name")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(if verbose { "dolphin_update=debug".parse()? } else { "dolphin_update=info".parse()? }),
            )
            .with_writer(writer)
            .with_ansi(false)
            .init();
        return Ok(Some(guard));
    }

    // Only initialize logging if verbose or RUST_LOG is set
    if verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(if verbose { "dolphin_update=debug".parse()? } else { "dolphin_update=warn".parse()? }),
            )
            .with_writer(io::stderr)
            .init();
    }
    Ok(None)
}

/// Ask a yes/no question on the terminal; anything but yes is no
async fn confirm(question: String) -> bool {
    tokio::task::spawn_blocking(move || {
        eprint!("{} [y/N] ", question);
        let _ = io::stderr().flush();
        let mut answer = String::new();
        io::stdin().read_line(&mut answer).is_ok()
            && matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    })
    .await
    .unwrap_or(false)
}

/// Run a version check through the runner and wait for its outcome
async fn refresh(runner: &TaskRunner) -> std::result::Result<RemoteRelease, String> {
    let mut events = runner.subscribe();
    runner.request_refresh();
    runner.wait_for_refresh().await;

    while let Ok(event) = events.try_recv() {
        match event {
            Notification::ReleaseKnown(release) => return Ok(release),
            Notification::Failed {
                task: TaskKind::Refresh,
                message,
                ..
            } => return Err(message),
            _ => {}
        }
    }
    Err("The version check did not finish.".to_string())
}

fn print_installed(store: &StateStore) {
    let state = store.installed_state();
    let folder = if state.install_path.is_empty() { "(not set)" } else { &state.install_path };
    let version = if state.installed_version.is_empty() { "(unknown)" } else { &state.installed_version };
    println!("Install folder:    {}", folder);
    println!("Installed version: {}", version);
}

/// Print install notifications until the job ends; returns whether it committed
async fn follow_install(runner: &TaskRunner, mut events: tokio::sync::broadcast::Receiver<Notification>) -> Result<bool> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} | {msg}")?
            .progress_chars("=>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message("Starting...");

    let mut quitting = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(Notification::Status(message)) => pb.set_message(message),
                Ok(Notification::Progress { downloaded, total }) => {
                    if total > 0 {
                        pb.set_length(total);
                    }
                    pb.set_position(downloaded);
                }
                Ok(Notification::Phase(phase)) => debug!("Phase: {}", phase.name()),
                Ok(Notification::Finished { task: TaskKind::Install, version }) => {
                    pb.finish_with_message(format!(
                        "Installed {}",
                        version.unwrap_or_else(|| "newest build".to_string())
                    ));
                    return Ok(true);
                }
                Ok(Notification::Failed { task: TaskKind::Install, message, severe }) => {
                    pb.abandon();
                    if severe {
                        eprintln!("\nSEVERE: {}", message);
                    } else {
                        eprintln!("\n{}", message);
                    }
                    return Ok(false);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} notifications", skipped),
                Err(RecvError::Closed) => {
                    pb.abandon();
                    return Ok(false);
                }
            },
            _ = tokio::signal::ctrl_c(), if !quitting => {
                pb.disable_steady_tick();
                let stop = confirm(
                    "An update is running and will finish before exiting. Quit when it is done?".to_string(),
                )
                .await;
                pb.enable_steady_tick(Duration::from_millis(100));
                if stop {
                    quitting = true;
                    pb.set_message("Finishing the update before exiting...");
                    runner.shutdown().await;
                }
            }
        }
    }
}

async fn run(command: Commands, runner: &TaskRunner, store: &StateStore) -> Result<()> {
    match command {
        Commands::Status => {
            print_installed(store);
            match refresh(runner).await {
                Ok(release) => {
                    let newest = release.version();
                    println!("Newest version:    {}", newest);
                    if newest == store.installed_version() {
                        println!("\nYou already have the most recent version.");
                    } else {
                        println!("\nAn update is available. Run `dolphin-update install`.");
                    }
                }
                Err(message) => println!("\n{}", message),
            }
        }

        Commands::Info { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&store.installed_state())?);
            } else {
                print_installed(store);
                println!("Auto-launch:       {}", if store.auto_launch() { "on" } else { "off" });
            }
        }

        Commands::Check { json } => {
            let release = refresh(runner).await.map_err(|message| anyhow!(message))?;
            let installed = store.installed_version();
            if json {
                let out = serde_json::json!({
                    "version": release.version(),
                    "release": release,
                    "installed_version": installed,
                    "up_to_date": release.version() == installed,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Newest version: {} ({})", release.version(), release.file_name);
                if !store.hide_changelog() && !release.changelog.is_empty() {
                    println!("\n{}", release.changelog.trim_end());
                }
            }
        }

        Commands::SetFolder { dir } => {
            let dir = dir
                .canonicalize()
                .with_context(|| format!("{} does not exist", dir.display()))?;
            runner
                .updater()
                .set_install_path(&dir)
                .map_err(|e| anyhow!(e.user_message()))?;
            println!("Install folder set to {}", dir.display());
        }

        Commands::Clear { yes } => {
            if !yes && !confirm("Forget the installed version?".to_string()).await {
                println!("Nothing changed.");
                return Ok(());
            }
            runner.clear_installed_version()?;
            println!("Installed version cleared.");
        }

        Commands::Install { path } => {
            let target = match path {
                Some(path) => {
                    let path = path
                        .canonicalize()
                        .with_context(|| format!("{} does not exist", path.display()))?;
                    runner
                        .updater()
                        .set_install_path(&path)
                        .map_err(|e| anyhow!(e.user_message()))?;
                    path
                }
                None => {
                    let stored = store.install_path();
                    if stored.is_empty() {
                        bail!("No install folder set. Pass --path or run `dolphin-update set-folder <DIR>` first.");
                    }
                    PathBuf::from(stored)
                }
            };

            // Fills the cached version for the up-to-date check; failures surface from the install
            if let Err(message) = refresh(runner).await {
                debug!("Version check before install failed: {}", message);
            }

            let events = runner.subscribe();
            runner
                .request_install(target)
                .map_err(|e| anyhow!(e.user_message()))?;
            if !follow_install(runner, events).await? {
                bail!("Update failed");
            }
        }

        Commands::Set { setting } => {
            let (key, value) = match setting {
                Setting::AutoLaunch { value } => (SettingKey::AutoLaunch, bool::from(value)),
                Setting::HideChangelog { value } => (SettingKey::HideChangelog, bool::from(value)),
            };
            store.set_bool(key, value)?;
            println!("{} = {}", key.as_str(), value);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::default();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(url) = cli.page_url {
        config.page_url = url;
    }
    config.seven_zip = cli.seven_zip;
    config.validate()?;

    let log_path = config.log_path();
    let _log_guard = init_logging(cli.verbose, cli.log_file.then_some(log_path.as_path()))?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;

    let store = Arc::new(StateStore::open(&config.db_path())?);
    let updater = Updater::from_config(&config, Arc::clone(&store))?;
    let runner = TaskRunner::new(Arc::new(updater));

    let result = run(cli.command.unwrap_or(Commands::Status), &runner, &store).await;

    runner.shutdown().await;
    drop(runner);
    match Arc::try_unwrap(store) {
        Ok(store) => store.close()?,
        Err(_) => debug!("State store still shared at exit, released on drop"),
    }

    result
}
