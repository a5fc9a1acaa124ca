//! termhost daemon
//!
//! Keeps terminal sessions alive between UI restarts.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use termhost_daemon::config::Config;
use termhost_daemon::host::{HostExit, HostOptions, TerminalHost};
use termhost_daemon::ipc::{read_daemon_pid, remove_pid_file, write_pid_file, IpcClient, IpcServer};
use termhost_daemon::protocol::{Command, SessionSummary};
use termhost_daemon::pty::{FakePtySpawner, NativePtySpawner, PtySpawner};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// How long a stopping host gets to kill its sessions.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// termhost daemon - terminal sessions that outlive their window.
#[derive(Parser, Debug)]
#[command(name = "termhost-daemon")]
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
    /// Run the daemon in the foreground
    Serve {
        /// Socket path (defaults to a per-installation path)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,

        /// Loop input back instead of spawning real shells
        #[arg(long)]
        fake_pty: bool,

        /// Exit after this many milliseconds without sessions or clients
        #[arg(long, value_name = "N")]
        idle_timeout_ms: Option<u64>,

        /// Write logs to this file
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,
    },

    /// Check that the daemon answers
    Ping,

    /// Print the effective configuration as TOML
    Config,

    /// Manage live sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,

        /// Only sessions of this workspace
        #[arg(long, value_name = "PATH")]
        workspace: Option<String>,
    },

    /// Kill a session and notify its clients
    Dispose {
        /// Session ID to dispose
        session_id: String,

        /// Reason passed on to clients
        #[arg(long, short)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let env_overrides = config.apply_env_overrides();

    if let Commands::Serve {
        socket,
        fake_pty,
        idle_timeout_ms,
        log_file,
    } = &cli.command
    {
        if let Some(socket) = socket {
            config.daemon.socket_path = Some(socket.clone());
        }
        if *fake_pty {
            config.session.fake_pty = true;
        }
        if let Some(ms) = idle_timeout_ms {
            config.daemon.idle_timeout_ms = *ms;
        }
        if let Some(path) = log_file {
            config.daemon.log_file = Some(path.clone());
        }
    }

    let _log_guard = init_tracing(&config, cli.verbose)?;
    for found in &env_overrides {
        if found.applied {
            tracing::info!(variable = found.variable, value = %found.value, "Configuration overridden from environment");
        } else {
            tracing::warn!(variable = found.variable, value = %found.value, "Ignoring invalid environment override");
        }
    }

    match cli.command {
        Commands::Serve { .. } => {
            config.validate()?;
            serve(config).await
        }
        Commands::Ping => ping(&config.socket_path()).await,
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sessions(SessionsCommands::List { json, workspace }) => {
            list_sessions(&config.socket_path(), json, workspace).await
        }
        Commands::Sessions(SessionsCommands::Dispose { session_id, reason }) => {
            dispose_session(&config.socket_path(), &session_id, reason).await
        }
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over the configured level. With a log file the returned
/// guard must stay alive until exit so buffered lines are flushed.
fn init_tracing(
    config: &Config,
    verbose: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.daemon.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .context("log_file must name a file")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
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

/// Runs the daemon until idle shutdown, a signal, or a transport failure.
async fn serve(config: Config) -> anyhow::Result<ExitCode> {
    let socket_path = config.socket_path();

    if let Ok(mut client) =
        IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(500)).await
    {
        if client.ping().await.unwrap_or(false) {
            let pid = read_daemon_pid(&socket_path).unwrap_or(0);
            eprintln!("Error: daemon already running on {} (PID: {})", socket_path.display(), pid);
            return Ok(ExitCode::FAILURE);
        }
    }

    let server = match IpcServer::bind(&socket_path).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(path = %socket_path.display(), error = %e, "Failed to listen");
            return Ok(ExitCode::FAILURE);
        }
    };

    if let Err(e) = write_pid_file(&socket_path) {
        tracing::warn!(error = %e, "Failed to write PID file");
    }

    let spawner: Arc<dyn PtySpawner> = if config.session.fake_pty {
        tracing::info!("Using fake PTY");
        Arc::new(FakePtySpawner::new())
    } else {
        Arc::new(NativePtySpawner)
    };

    let options = HostOptions::from(&config);
    tracing::info!(
        path = %socket_path.display(),
        pid = std::process::id(),
        idle_timeout_ms = options.idle_timeout.as_millis() as u64,
        "termhost daemon started"
    );

    let (host, handle) = TerminalHost::new(options, spawner);
    let shutdown = CancellationToken::new();
    let mut host_task = tokio::spawn(host.run());
    let mut server_task = tokio::spawn(server.serve(handle.clone(), shutdown.clone()));

    let mut host_done = false;
    let mut server_done = false;
    let code = tokio::select! {
        exit = &mut host_task => {
            host_done = true;
            match exit {
                Ok(HostExit::Idle) => {
                    tracing::info!("No sessions or clients left, shutting down");
                    ExitCode::SUCCESS
                }
                Ok(HostExit::Shutdown) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "Host task failed");
                    ExitCode::FAILURE
                }
            }
        }
        served = &mut server_task => {
            server_done = true;
            match served {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "IPC server failed");
                    ExitCode::FAILURE
                }
                Err(e) => {
                    tracing::error!(error = %e, "IPC server task failed");
                    ExitCode::FAILURE
                }
            }
        }
        signal = wait_for_shutdown_signal() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "Failed to register signal handlers");
            }
            ExitCode::SUCCESS
        }
    };

    shutdown.cancel();
    handle.shutdown();
    if !host_done && tokio::time::timeout(SHUTDOWN_GRACE, &mut host_task).await.is_err() {
        tracing::warn!("Host did not stop in time");
    }
    if !server_done {
        let _ = server_task.await;
    }
    remove_pid_file(&socket_path);

    tracing::info!("termhost daemon stopped");
    Ok(code)
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Connects to the daemon or reports that it is not running.
async fn connect_or_report(socket_path: &Path) -> Option<IpcClient> {
    match IpcClient::connect(socket_path).await {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::debug!(error = %e, "Connect failed");
            eprintln!("Daemon is not running ({})", socket_path.display());
            None
        }
    }
}

async fn ping(socket_path: &Path) -> anyhow::Result<ExitCode> {
    let Some(mut client) = connect_or_report(socket_path).await else {
        return Ok(ExitCode::FAILURE);
    };

    if client.ping().await? {
        match read_daemon_pid(socket_path) {
            Some(pid) => println!("pong (PID: {})", pid),
            None => println!("pong"),
        }
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("Unexpected ping response");
        Ok(ExitCode::FAILURE)
    }
}

async fn list_sessions(
    socket_path: &Path,
    as_json: bool,
    workspace: Option<String>,
) -> anyhow::Result<ExitCode> {
    let Some(mut client) = connect_or_report(socket_path).await else {
        return Ok(ExitCode::FAILURE);
    };

    let result = client.request(Command::ListSessions, Value::Null).await?;
    let mut sessions: Vec<SessionSummary> = serde_json::from_value(
        result.get("sessions").cloned().unwrap_or(Value::Array(Vec::new())),
    )
    .context("Unexpected listSessions response")?;

    if let Some(workspace) = workspace {
        let wanted = termhost_daemon::protocol::normalize_workspace_path(&workspace);
        sessions.retain(|s| s.workspace_path == wanted);
    }

    if as_json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else {
        print_sessions_table(&sessions);
    }
    Ok(ExitCode::SUCCESS)
}

async fn dispose_session(
    socket_path: &Path,
    session_id: &str,
    reason: Option<String>,
) -> anyhow::Result<ExitCode> {
    let Some(mut client) = connect_or_report(socket_path).await else {
        return Ok(ExitCode::FAILURE);
    };

    client
        .request(
            Command::DisposeSession,
            json!({ "sessionId": session_id, "reason": reason }),
        )
        .await?;
    println!("Disposed session {}", session_id);
    Ok(ExitCode::SUCCESS)
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.session_id.len())
        .max()
        .unwrap_or(2)
        .max(2);
    let workspace_width = sessions
        .iter()
        .map(|s| s.workspace_path.len())
        .max()
        .unwrap_or(9)
        .clamp(9, 48);
    let slot_width = sessions
        .iter()
        .map(|s| s.slot.len())
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:<id_width$}  {:<workspace_width$}  {:<slot_width$}  {:<8}  COMMAND",
        "ID", "WORKSPACE", "SLOT", "ATTACHED",
    );
    println!(
        "{}",
        "-".repeat(id_width + workspace_width + slot_width + 25)
    );

    for session in sessions {
        println!(
            "{:<id_width$}  {:<workspace_width$}  {:<slot_width$}  {:<8}  {}",
            session.session_id,
            truncate_str(&session.workspace_path, workspace_width),
            session.slot,
            if session.attached { "yes" } else { "no" },
            session.command,
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Keep the tail of `s`, prefixed with "...", when it is longer than `max_len`.
fn truncate_str(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let tail: String = s.chars().skip(count - keep).collect();
    format!("...{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["termhost-daemon", "serve"]).unwrap();
        match cli.command {
            Commands::Serve {
                socket,
                fake_pty,
                idle_timeout_ms,
                log_file,
            } => {
                assert!(socket.is_none());
                assert!(!fake_pty);
                assert!(idle_timeout_ms.is_none());
                assert!(log_file.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_with_options() {
        let cli = Cli::try_parse_from([
            "termhost-daemon",
            "serve",
            "--socket",
            "/tmp/t.sock",
            "--fake-pty",
            "--idle-timeout-ms",
            "250",
            "--log-file",
            "/tmp/t.log",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve {
                socket,
                fake_pty,
                idle_timeout_ms,
                log_file,
            } => {
                assert_eq!(socket, Some(PathBuf::from("/tmp/t.sock")));
                assert!(fake_pty);
                assert_eq!(idle_timeout_ms, Some(250));
                assert_eq!(log_file, Some(PathBuf::from("/tmp/t.log")));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_idle_timeout_must_be_numeric() {
        let result =
            Cli::try_parse_from(["termhost-daemon", "serve", "--idle-timeout-ms", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_ping_command() {
        let cli = Cli::try_parse_from(["termhost-daemon", "ping"]).unwrap();
        assert!(matches!(cli.command, Commands::Ping));
    }

    #[test]
    fn test_config_command() {
        let cli = Cli::try_parse_from(["termhost-daemon", "--config", "/tmp/d.toml", "config"]).unwrap();
        assert!(matches!(cli.command, Commands::Config));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/d.toml")));
    }

    #[test]
    fn test_sessions_list() {
        let cli = Cli::try_parse_from([
            "termhost-daemon",
            "sessions",
            "list",
            "--json",
            "--workspace",
            "/repo",
        ])
        .unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json, workspace }) => {
                assert!(json);
                assert_eq!(workspace.as_deref(), Some("/repo"));
            }
            _ => panic!("Expected Sessions List command"),
        }
    }

    #[test]
    fn test_sessions_dispose() {
        let cli = Cli::try_parse_from([
            "termhost-daemon",
            "sessions",
            "dispose",
            "abc-123",
            "--reason",
            "closed",
        ])
        .unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Dispose { session_id, reason }) => {
                assert_eq!(session_id, "abc-123");
                assert_eq!(reason.as_deref(), Some("closed"));
            }
            _ => panic!("Expected Sessions Dispose command"),
        }
    }

    #[test]
    fn test_sessions_dispose_requires_id() {
        let result = Cli::try_parse_from(["termhost-daemon", "sessions", "dispose"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "termhost-daemon",
            "ping",
            "--verbose",
            "--config",
            "/etc/termhost.toml",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/termhost.toml")));
    }

    #[test]
    fn test_no_subcommand_is_error() {
        assert!(Cli::try_parse_from(["termhost-daemon"]).is_err());
    }

    #[test]
    fn test_truncate_str_keeps_tail() {
        assert_eq!(truncate_str("/short", 10), "/short");
        assert_eq!(truncate_str("/home/me/projects/app", 10), "...cts/app");
    }
}
