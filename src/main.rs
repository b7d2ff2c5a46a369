use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use starwatch::config::{parse_duration, LoggingConfig};
use starwatch::credentials::{CredentialStore, StoredCredentials};
use starwatch::daemon::{
    build_monitor, daemon_status, is_daemon_running, messaging_gateway, stop_daemon, GatewayMode,
};
use starwatch::github::validate_token;
use starwatch::{Command, CommandReply, Config, Daemon, Destination, DigestMode, MonitorStatus, StateDb};

#[derive(Parser)]
#[command(name = "starwatch")]
#[command(about = "GitHub star monitoring daemon with Telegram notifications")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the configuration file and create the state database
    Init {
        /// Telegram chat id of the owner's private chat
        #[arg(long)]
        owner_chat: Option<String>,
    },

    /// Manage the GitHub token
    Auth {
        #[command(subcommand)]
        auth_command: AuthCommands,
    },

    /// Stop polling GitHub (digests still go out on schedule)
    Pause,

    /// Resume polling GitHub
    Resume,

    /// Set the poll interval ("90s", "5m", "1h" or seconds)
    Interval { interval: String },

    /// Set the digest mode: instant, daily, weekly (or "off" for instant)
    Digest { mode: String },

    /// Manage notification destinations
    Dest {
        #[command(subcommand)]
        dest_command: DestCommands,
    },

    /// Show monitor status
    Status {
        /// Print status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one poll cycle now
    Check,

    /// Run as daemon
    Daemon {
        #[command(subcommand)]
        daemon_command: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Validate and store a GitHub token
    Set { token: String },

    /// Remove the stored token
    Remove,

    /// Show which GitHub user the token belongs to
    Status,
}

#[derive(Subcommand)]
enum DestCommands {
    /// Add a chat, channel or forum topic (omit the id for your private chat)
    Add { id: Option<String> },

    /// Remove a destination
    Remove { id: String },

    /// List destinations
    List,
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop running daemon
    Stop,

    /// Show daemon status
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    // Forking has to happen before the runtime spawns its threads
    if let Commands::Daemon {
        daemon_command: DaemonCommands::Start { foreground },
    } = &cli.command
    {
        if is_daemon_running(&config)? {
            println!("⚠️  Daemon is already running!");
            println!("   Use 'starwatch daemon stop' to stop it first");
            return Ok(());
        }
        if !foreground {
            start_background(&config)?;
        }
    }

    init_logging(cli.verbose, &config.logging)?;
    info!("Starting starwatch v{}", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(run(cli.command, cli.config, config))
}

async fn run(command: Commands, config_path: Option<PathBuf>, config: Config) -> Result<()> {
    match command {
        Commands::Init { owner_chat } => cmd_init(owner_chat, config_path, &config),
        Commands::Auth { auth_command } => cmd_auth(auth_command, &config).await,
        Commands::Pause => cmd_apply(&config, Command::Pause).await,
        Commands::Resume => cmd_apply(&config, Command::Resume).await,
        Commands::Interval { interval } => {
            let secs = parse_duration(&interval)?;
            cmd_apply(&config, Command::SetInterval(secs)).await
        }
        Commands::Digest { mode } => {
            let mode = DigestMode::parse(&mode)
                .ok_or_else(|| anyhow!("Unknown digest mode '{}', use instant, daily or weekly", mode))?;
            cmd_apply(&config, Command::SetDigestMode(mode)).await
        }
        Commands::Dest { dest_command } => cmd_dest(dest_command, &config).await,
        Commands::Status { json } => cmd_status(json, &config).await,
        Commands::Check => cmd_check(&config).await,
        Commands::Daemon { daemon_command } => cmd_daemon(daemon_command, &config).await,
    }
}

/// Initialize logging based on verbosity level and config
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs go to stderr so command output stays parseable
    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "compact" {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) if path.exists() => Config::load(path),
        Some(_) => {
            let mut config = Config::default();
            config.expand_paths()?;
            Ok(config)
        }
        None => Config::load_or_default(),
    }
}

#[cfg(unix)]
fn start_background(config: &Config) -> Result<()> {
    println!("🚀 Starting starwatch daemon in background...");
    println!("   PID file: {}", config.daemon.pid_file);
    println!("   Log file: {}", config.daemon.log_file);
    starwatch::daemon::daemonize(config)
}

#[cfg(not(unix))]
fn start_background(_config: &Config) -> Result<()> {
    bail!("Background daemon mode not supported on this platform, use --foreground")
}

fn cmd_init(owner_chat: Option<String>, config_path: Option<PathBuf>, config: &Config) -> Result<()> {
    let config_path = match config_path {
        Some(path) => path,
        None => Config::default_config_path()?,
    };

    let mut new_config = config.clone();
    if let Some(owner_chat) = owner_chat {
        let destination = Destination::parse(&owner_chat)?;
        new_config.telegram.owner_chat_id = Some(destination.as_str().to_string());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    new_config.save(&config_path)?;
    StateDb::open_at(PathBuf::from(&new_config.state.db_path))?;

    println!("✅ starwatch initialized successfully!");
    println!("   Config: {:?}", config_path);
    println!("   State: {}", new_config.state.db_path);

    if new_config.owner_destination().is_err() {
        println!("   Next: set telegram.owner_chat_id (or OWNER_USER_ID)");
    }
    if new_config.bot_token().is_none() {
        println!("   Next: set telegram.bot_token (or BOT_TOKEN)");
    }
    println!("   Next: run 'starwatch auth set <token>' and 'starwatch daemon start'");

    Ok(())
}

async fn cmd_auth(auth_command: AuthCommands, config: &Config) -> Result<()> {
    match auth_command {
        AuthCommands::Set { token } => {
            let login = validate_token(token.trim(), &config.github.api_base)
                .await
                .context("GitHub did not accept the token")?;
            println!("🔑 Token belongs to {}", login);
            cmd_apply(config, Command::SetToken(token)).await
        }
        AuthCommands::Remove => cmd_apply(config, Command::RemoveToken).await,
        AuthCommands::Status => {
            let db = Arc::new(StateDb::open_at(PathBuf::from(&config.state.db_path))?);
            let credentials = StoredCredentials::new(db).with_environment_fallback();

            match credentials.get_token()? {
                None => println!("❌ No GitHub token configured"),
                Some(token) => match validate_token(&token, &config.github.api_base).await {
                    Ok(login) => {
                        println!("✅ Authentication successful");
                        println!("   Username: {}", login);
                    }
                    Err(e) => println!("❌ Authentication failed: {:#}", e),
                },
            }
            Ok(())
        }
    }
}

async fn cmd_dest(dest_command: DestCommands, config: &Config) -> Result<()> {
    let command = match dest_command {
        DestCommands::Add { id } => {
            Command::AddDestination(id.as_deref().map(Destination::parse).transpose()?)
        }
        DestCommands::Remove { id } => Command::RemoveDestination(Destination::parse(&id)?),
        DestCommands::List => Command::ListDestinations,
    };
    cmd_apply(config, command).await
}

/// Apply a command to persisted state. Refuses while a daemon owns the state.
async fn cmd_apply(config: &Config, command: Command) -> Result<()> {
    let read_only = matches!(command, Command::ListDestinations | Command::Status);
    if !read_only && is_daemon_running(config)? {
        println!("⚠️  The daemon is running and owns the monitor state");
        println!("   Stop it with 'starwatch daemon stop', apply the change, then start it again");
        return Ok(());
    }

    let gateway_mode = match command {
        Command::SetDigestMode(_) => GatewayMode::Required,
        _ => GatewayMode::Optional,
    };
    let gateway = messaging_gateway(config, gateway_mode)?;
    let mut monitor = build_monitor(config, gateway)?;

    print_reply(monitor.apply_command(command, Utc::now()).await)
}

fn print_reply(reply: CommandReply) -> Result<()> {
    match reply {
        CommandReply::Done(message) => println!("✅ {}", message),
        CommandReply::Rejected(message) => bail!(message),
        CommandReply::Destinations(destinations) => {
            println!("Destinations ({}):", destinations.len());
            for destination in destinations {
                println!("  📨 {}", destination);
            }
        }
        CommandReply::Status(status) => print_status(&status),
    }
    Ok(())
}

async fn cmd_status(json: bool, config: &Config) -> Result<()> {
    let gateway = messaging_gateway(config, GatewayMode::Optional)?;
    let monitor = build_monitor(config, gateway)?;
    let status = monitor.status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
        if is_daemon_running(config)? {
            println!("   ℹ️  Daemon is running; values reflect the last persisted state");
        }
    }
    Ok(())
}

fn print_status(status: &MonitorStatus) {
    println!("📊 starwatch status");
    println!(
        "   {} Monitoring: {}",
        if status.paused { "⏸️ " } else { "🟢" },
        if status.paused { "Paused" } else { "Active" }
    );
    println!("   🔄 Poll interval: {}s", status.interval_secs);
    println!("   📬 Digest mode: {}", status.mode);
    if let Some(next_flush) = status.next_flush_at {
        println!("   ⏰ Next digest: {}", next_flush.format("%Y-%m-%d %H:%M UTC"));
    }
    println!("   📥 Pending: {}", status.pending);
    println!("   📨 Destinations: {}", status.destination_count);
    println!("   ⭐ Known stars: {}", status.known_stars);

    match status.rate_limit {
        Some(rate_limit) => println!("   🚦 Rate limit remaining: {}", rate_limit.remaining),
        None => println!("   🚦 Rate limit remaining: unknown"),
    }
    if status.backoff_multiplier > 1 {
        println!("   🐢 Backoff multiplier: x{}", status.backoff_multiplier);
    }
    if let starwatch::monitor::LoopState::Backoff { until } = status.state {
        println!("   ⏳ Rate limited until {}", until.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(error) = &status.last_error {
        println!("   ❌ Last error: {}", error);
    }
}

async fn cmd_check(config: &Config) -> Result<()> {
    if is_daemon_running(config)? {
        println!("⚠️  The daemon is running, it polls on its own schedule");
        return Ok(());
    }

    let gateway = messaging_gateway(config, GatewayMode::Required)?;
    let mut monitor = build_monitor(config, gateway)?;

    let now = Utc::now();
    monitor.startup(now).await;
    let report = monitor.check_now(now).await;
    let status = monitor.status();

    if !report.polled {
        println!("⏭️  No poll performed (monitoring paused or rate limited)");
    }
    println!("📨 Repositories delivered: {}", report.delivered);
    if let Some(error) = &status.last_error {
        println!("❌ {}", error);
    }
    print_status(&status);
    Ok(())
}

async fn cmd_daemon(daemon_command: DaemonCommands, config: &Config) -> Result<()> {
    match daemon_command {
        DaemonCommands::Start { foreground } => {
            if foreground {
                println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
            }
            Daemon::new(config.clone())?.run().await?;
        }

        DaemonCommands::Stop => {
            println!("🛑 Stopping starwatch daemon...");

            if !is_daemon_running(config)? {
                println!("⚠️  No daemon appears to be running");
                return Ok(());
            }

            if stop_daemon(config)? {
                println!("✅ Daemon stop signal sent");
            }
        }

        DaemonCommands::Status => {
            println!("📊 starwatch Daemon Status");
            let status = daemon_status(config)?;

            if status.is_running {
                println!("   🟢 Status: Running");
                if let Some(pid) = status.pid {
                    println!("   🆔 PID: {}", pid);
                }
                if !config.daemon.log_file.is_empty() {
                    println!("   📄 Log file: {}", config.daemon.log_file);
                }
            } else {
                println!("   🔴 Status: Not running");
                println!("   💡 Use 'starwatch daemon start' to start the daemon");
            }
        }
    }

    Ok(())
}
