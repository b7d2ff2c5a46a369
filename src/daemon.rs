//! Daemon Infrastructure - background service running the monitor loop
//!
//! Wires configuration into a [`Monitor`], manages the PID file and turns
//! SIGTERM / Ctrl+C into a graceful shutdown of the loop.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::EtagCache;
use crate::config::Config;
use crate::credentials::{CredentialStore, StoredCredentials};
use crate::digest::DigestSchedule;
use crate::enrich::{Enricher, GeminiEnricher, NoopEnricher};
use crate::fanout::FanOut;
use crate::github::StarFetcher;
use crate::monitor::{command_channel, Monitor, MonitorDeps, MonitorSettings};
use crate::state::StateDb;
use crate::telegram::{DisabledGateway, MessagingGateway, TelegramGateway};

/// Whether the caller can live without a Telegram bot token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    Required,
    Optional,
}

/// Telegram gateway from config, or a disabled one for offline commands
pub fn messaging_gateway(config: &Config, mode: GatewayMode) -> Result<Arc<dyn MessagingGateway>> {
    match (config.bot_token(), mode) {
        (Some(token), _) => Ok(Arc::new(TelegramGateway::new(&config.telegram, token)?)),
        (None, GatewayMode::Optional) => Ok(Arc::new(DisabledGateway)),
        (None, GatewayMode::Required) => Err(anyhow!(
            "Telegram bot token is not configured. Set telegram.bot_token in the config \
             or the BOT_TOKEN environment variable"
        )),
    }
}

/// Assemble the monitor loop and its collaborators from configuration and
/// persisted state
pub fn build_monitor(config: &Config, gateway: Arc<dyn MessagingGateway>) -> Result<Monitor> {
    let db = Arc::new(
        StateDb::open_at(PathBuf::from(&config.state.db_path))
            .context("Failed to open state database")?,
    );
    let persisted = db.load_snapshot().context("Failed to load persisted state")?;

    let credentials: Arc<dyn CredentialStore> =
        Arc::new(StoredCredentials::new(db.clone()).with_environment_fallback());
    let cache = Arc::new(EtagCache::from_entries(persisted.cache_entries.clone()));
    let source = Arc::new(StarFetcher::new(&config.github, cache, credentials.clone())?);

    let enricher: Arc<dyn Enricher> =
        if config.enrichment.enabled || config.enrichment.media_selection {
            Arc::new(GeminiEnricher::new(config, credentials.clone())?)
        } else {
            Arc::new(NoopEnricher)
        };

    // README fetch plus summary, each bounded by the HTTP client timeout
    let enrich_timeout = Duration::from_secs(config.enrichment.timeout.saturating_mul(2));
    let fanout = FanOut::new(
        enricher,
        gateway,
        config.enrichment_concurrency(),
        enrich_timeout,
    )
    .with_message_delay(Duration::from_millis(config.telegram.message_delay_ms));

    let settings = MonitorSettings {
        owner: config.owner_destination()?,
        interval_secs: config.interval_secs()?,
        min_interval_secs: config.min_interval_secs(),
        max_backoff_multiplier: config.monitor.max_backoff_multiplier,
        default_mode: config.default_mode()?,
        schedule: DigestSchedule::from_config(&config.digest)?,
        tick: Duration::from_secs(config.monitor.tick.max(1)),
    };

    Monitor::restore(
        MonitorDeps {
            db,
            source,
            fanout,
            credentials,
        },
        settings,
        persisted,
        Utc::now(),
    )
}

/// Daemon state and control
pub struct Daemon {
    config: Arc<Config>,
    shutdown_sender: broadcast::Sender<()>,
    is_running: Arc<AtomicBool>,
    pid_file_path: Option<PathBuf>,
}

/// Whether a daemon process is alive, per the PID file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub is_running: bool,
    pub pid: Option<u32>,
    pub pid_file: Option<PathBuf>,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self> {
        let (shutdown_sender, _) = broadcast::channel(1);
        let pid_file_path = pid_file_path(&config)?;

        Ok(Self {
            config: Arc::new(config),
            shutdown_sender,
            is_running: Arc::new(AtomicBool::new(false)),
            pid_file_path,
        })
    }

    /// Run the monitor loop in the foreground until a shutdown signal
    pub async fn run(&self) -> Result<()> {
        info!("Starting starwatch daemon v{}", env!("CARGO_PKG_VERSION"));

        let gateway = messaging_gateway(&self.config, GatewayMode::Required)?;
        let monitor = build_monitor(&self.config, gateway).context("Failed to build monitor")?;

        self.write_pid_file().context("Failed to write PID file")?;
        self.is_running.store(true, Ordering::SeqCst);

        let shutdown_sender = self.shutdown_sender.clone();
        let is_running = self.is_running.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            is_running.store(false, Ordering::SeqCst);
            let _ = shutdown_sender.send(());
        });

        // The owner-chat dispatch layer would hold this handle
        let (_handle, commands) = command_channel(16);
        let result = monitor
            .run(commands, self.shutdown_sender.subscribe())
            .await;

        self.cleanup().context("Failed to cleanup daemon")?;
        result
    }

    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;
            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Daemon cleanup completed");
        Ok(())
    }
}

/// Detach from the terminal. Must run before the async runtime starts.
#[cfg(unix)]
pub fn daemonize(config: &Config) -> Result<()> {
    use daemonize::Daemonize;

    let mut daemonize = Daemonize::new().working_directory("/");

    if !config.daemon.log_file.is_empty() {
        let path = Path::new(&config.daemon.log_file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context("Failed to open log file")?;
        daemonize = daemonize.stdout(log_file.try_clone()?).stderr(log_file);
    }

    daemonize.start().context("Failed to daemonize process")?;
    Ok(())
}

/// Ask a running daemon to stop by sending SIGTERM
pub fn stop_daemon(config: &Config) -> Result<bool> {
    let Some(pid_file) = pid_file_path(config)? else {
        warn!("No PID file configured, cannot stop daemon");
        return Ok(false);
    };

    let Some(pid) = read_pid(&pid_file)? else {
        warn!("PID file not found, daemon may not be running");
        return Ok(false);
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .context("Failed to send SIGTERM to daemon process")?;
        info!("Shutdown signal sent to daemon process {}", pid);
        Ok(true)
    }

    #[cfg(not(unix))]
    {
        warn!("Daemon stop not implemented for this platform (PID {})", pid);
        Ok(false)
    }
}

/// Check if daemon is currently running by checking PID file
pub fn is_daemon_running(config: &Config) -> Result<bool> {
    Ok(daemon_status(config)?.is_running)
}

pub fn daemon_status(config: &Config) -> Result<DaemonStatus> {
    let pid_file = pid_file_path(config)?;
    let pid = match &pid_file {
        Some(path) => read_pid(path)?,
        None => None,
    };

    let is_running = match (pid, &pid_file) {
        (Some(pid), Some(path)) => process_alive(pid, path),
        _ => false,
    };

    Ok(DaemonStatus {
        is_running,
        pid: pid.filter(|_| is_running),
        pid_file,
    })
}

fn pid_file_path(config: &Config) -> Result<Option<PathBuf>> {
    if config.daemon.pid_file.is_empty() {
        return Ok(None);
    }

    let expanded =
        shellexpand::full(&config.daemon.pid_file).context("Failed to expand PID file path")?;
    Ok(Some(PathBuf::from(expanded.as_ref())))
}

fn read_pid(pid_file: &Path) -> Result<Option<u32>> {
    if !pid_file.exists() {
        return Ok(None);
    }

    let pid_str = fs::read_to_string(pid_file).context("Failed to read PID file")?;
    let pid = pid_str.trim().parse().context("Invalid PID in PID file")?;
    Ok(Some(pid))
}

#[cfg(unix)]
fn process_alive(pid: u32, pid_file: &Path) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(Errno::ESRCH) => {
            debug!("Removing stale PID file {}", pid_file.display());
            let _ = fs::remove_file(pid_file);
            false
        }
        // Exists but belongs to someone else
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32, _pid_file: &Path) -> bool {
    true
}

/// Wait for SIGTERM or Ctrl+C
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                    _ = terminate.recv() => debug!("SIGTERM received"),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        debug!("Ctrl+C received");
    }
}
