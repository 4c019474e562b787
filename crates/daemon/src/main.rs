//! TermRelay Daemon
//!
//! Headless service brokering interactive shells over WebSocket channels.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{get_daemon_pid, get_pid_file_path, remove_pid_file, write_pid_file, IpcClient, IpcResponse};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::session::SessionInfo;
use protocol::crypto::unix_now;
use protocol::InitDataValidator;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// TermRelay Daemon - brokers interactive shells over WebSocket channels.
#[derive(Parser, Debug)]
#[command(name = "termrelay-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage live sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Print a signed credential for manual testing
    Credential {
        /// Principal the credential names
        #[arg(long)]
        user_id: i64,
    },
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Close a principal's session and terminate its shell
    Close {
        /// Principal whose session should be closed
        principal: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    let overrides = config.apply_env_overrides();
    config.validate()?;

    let _log_guard = init_tracing(&config, cli.verbose, matches!(cli.command, Commands::Start))?;
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }
    for applied in &overrides {
        tracing::info!("Overriding {} from environment", applied);
    }

    let socket_path = config
        .daemon
        .socket_path
        .clone()
        .unwrap_or_else(daemon::ipc::get_socket_path);
    let pid_path = get_pid_file_path(&config.daemon.data_dir);

    match cli.command {
        Commands::Start => {
            if let Some(pid) = get_daemon_pid(&pid_path) {
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  termrelay-daemon stop");
                std::process::exit(1);
            }

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            write_pid_file(&pid_path)
                .with_context(|| format!("Failed to write PID file {}", pid_path.display()))?;
            let result = run_headless(&mut orchestrator).await;
            remove_pid_file(&pid_path);
            result?;
        }
        Commands::Stop { force, timeout } => {
            let result = if force {
                force_stop_daemon(&pid_path, &socket_path)
            } else {
                graceful_stop_daemon(&socket_path, &pid_path, timeout).await
            };
            match result {
                Ok(()) => println!("Daemon stopped successfully"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: termrelay-daemon stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match query_daemon_status(&socket_path).await {
            Ok(response) => print_status(&response),
            Err(e) => {
                eprintln!("Daemon is not running: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(SessionsCommands::List { json }) => {
            match query_sessions_list(&socket_path).await {
                Ok(sessions) if json => println!("{}", serde_json::to_string_pretty(&sessions)?),
                Ok(sessions) => print_sessions_table(&sessions),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Sessions(SessionsCommands::Close { principal }) => {
            match close_session(&socket_path, principal).await {
                Ok(true) => println!("Session for {} closed", principal),
                Ok(false) => println!("No session for {}", principal),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Credential { user_id } => {
            println!("{}", mint_credential(&config, user_id)?);
        }
    }

    Ok(())
}

/// Installs the global subscriber. The config level applies unless `RUST_LOG`
/// is set; `-v` forces debug. A configured log file only applies to `start`.
fn init_tracing(config: &Config, verbose: bool, daemon_mode: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level))
    };

    match config.daemon.log_file.as_deref().filter(|_| daemon_mode) {
        Some(log_file) => {
            let (dir, name) = split_log_path(log_file)?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

fn split_log_path(path: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    let name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, PathBuf::from(name)))
}

/// Signs a credential for `user_id` with the configured bot token.
fn mint_credential(config: &Config, user_id: i64) -> anyhow::Result<String> {
    if config.security.bot_token.is_empty() {
        anyhow::bail!("No bot token configured (set security.bot_token or BOT_TOKEN)");
    }
    let validator = InitDataValidator::new(&config.security.bot_token)
        .context("Configured bot token is unusable")?;
    if !config.security.owner_ids.contains(&user_id) {
        eprintln!("Warning: {} is not an owner; the daemon will refuse this credential", user_id);
    }
    Ok(validator.sign_for_user(user_id, unix_now()))
}

async fn connect(socket_path: &Path) -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(socket_path, Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Query the daemon status via IPC.
async fn query_daemon_status(socket_path: &Path) -> anyhow::Result<IpcResponse> {
    let response = connect(socket_path)
        .await?
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query status: {}", e))?;

    match response {
        status @ IpcResponse::Status { .. } => Ok(status),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

fn print_status(response: &IpcResponse) {
    if let IpcResponse::Status {
        running,
        uptime_secs,
        session_count,
        channel_count,
        listen_addr,
    } = response
    {
        println!("Daemon Status: {}", if *running { "running" } else { "stopped" });
        println!("  Listening: {}", listen_addr);
        println!("  Uptime:    {}", format_duration(*uptime_secs));
        println!("  Sessions:  {}", session_count);
        println!("  Channels:  {}", channel_count);
    }
}

/// Query the list of live sessions from the daemon.
async fn query_sessions_list(socket_path: &Path) -> anyhow::Result<Vec<SessionInfo>> {
    let response = connect(socket_path)
        .await?
        .list_sessions()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query sessions: {}", e))?;

    match response {
        IpcResponse::Sessions { sessions } => Ok(sessions),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

/// Close a principal's session via IPC. Returns whether one existed.
async fn close_session(socket_path: &Path, principal: i64) -> anyhow::Result<bool> {
    let response = connect(socket_path)
        .await?
        .close_session(principal)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to send close request: {}", e))?;

    match response {
        IpcResponse::SessionClosed { principal: closed, existed } if closed == principal => Ok(existed),
        IpcResponse::Error { message } => anyhow::bail!("{}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionInfo]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    println!(
        "{:<14}  {:>8}  {:<12}  {:>9}  {:>10}  {:>6}  DIRECTORY",
        "PRINCIPAL", "PID", "STATUS", "SIZE", "STARTED", "IDLE"
    );
    println!("{}", "-".repeat(80));

    for session in sessions {
        println!(
            "{:<14}  {:>8}  {:<12}  {:>9}  {:>10}  {:>6}  {}",
            session.principal,
            session.pid,
            format!("{:?}", session.status),
            format!("{}x{}", session.rows, session.cols),
            format_relative_time(session.created_at),
            format_duration(session.idle_secs),
            truncate_str(&session.working_directory.display().to_string(), 40),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let elapsed = unix_now().saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to at most `max_len` characters, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Gracefully stop the daemon via IPC and wait for it to exit.
async fn graceful_stop_daemon(socket_path: &Path, pid_path: &Path, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = connect(socket_path).await?;

    println!("Sending shutdown request...");
    client.set_timeout(Duration::from_secs(timeout_secs));
    match client
        .stop()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to send stop request: {}", e))?
    {
        IpcResponse::Stopping => println!("Shutdown acknowledged, waiting for daemon to exit..."),
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        _ => anyhow::bail!("Unexpected response from daemon"),
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() && get_daemon_pid(pid_path).is_none() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Force stop the daemon using SIGKILL on the PID from the PID file.
///
/// Shells the daemon started are left to the kernel's SIGHUP on their
/// terminals closing.
fn force_stop_daemon(pid_path: &Path, socket_path: &Path) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = get_daemon_pid(pid_path)
        .context("Daemon PID file not found - is the daemon running?")?;
    let raw = i32::try_from(pid).context("Invalid PID in file")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;
    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(pid_path);
    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

/// Run the daemon until a signal or a stop request arrives.
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::debug!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ChannelOpened { principal, peer } => {
                    tracing::debug!(principal = %principal, peer = %peer, "Channel opened");
                }
                OrchestratorEvent::ChannelClosed { principal, peer, reason } => {
                    tracing::debug!(principal = %principal, peer = %peer, reason, "Channel closed");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = orchestrator.stop_requested() => tracing::info!("Received stop request"),
    }

    orchestrator.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}
