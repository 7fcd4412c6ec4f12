//! termrelay daemon
//!
//! Serves browser terminals attached to persistent tmux sessions.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::{RelayServer, Session, SessionRegistry, TmuxRegistry};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// termrelay - browser terminals for persistent tmux sessions.
#[derive(Parser, Debug)]
#[command(name = "termrelay")]
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

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the relay server
    Serve {
        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides config)
        #[arg(long, short)]
        port: Option<u16>,

        /// Directory of static client assets to serve (overrides config)
        #[arg(long, value_name = "DIR")]
        static_dir: Option<PathBuf>,
    },

    /// Manage tmux sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List managed sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Destroy a session
    Kill {
        /// Session name (with or without prefix)
        name: String,
    },

    /// Rename a session
    Rename {
        /// Current session name
        old: String,
        /// New session name
        new: String,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    if cli.verbose {
        config.daemon.log_level = "debug".to_string();
    }

    let _log_guard = init_tracing(&config.daemon.log_level, config.daemon.log_dir.as_deref());
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Serve {
            host,
            port,
            static_dir,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(dir) = static_dir {
                config.server.static_dir = Some(dir);
            }
            config.validate()?;

            tracing::info!("termrelay starting...");
            run_server(config).await?;
        }
        Commands::Sessions(cmd) => {
            config.validate()?;
            let registry = TmuxRegistry::from_config(&config.session)?;

            match cmd {
                SessionsCommands::List { json } => {
                    let sessions = registry.list().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                }
                SessionsCommands::Kill { name } => {
                    registry.destroy(&name).await?;
                    println!("Session {} destroyed", name);
                }
                SessionsCommands::Rename { old, new } => {
                    let session = registry.rename(&old, &new).await?;
                    println!("Session {} renamed to {}", old, session.display_name);
                }
            }
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => {
                print!("{}", config.to_toml()?);
            }
            ConfigCommands::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "Config file already exists at {} (use --force to overwrite)",
                        config_path.display()
                    );
                }
                Config::default().save(&config_path)?;
                println!("Wrote default configuration to {}", config_path.display());
            }
        },
    }

    Ok(())
}

/// Initializes logging. With a log directory, logs go to a daily rolling file
/// and the returned guard must be kept alive to flush it.
fn init_tracing(level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "termrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

/// Runs the relay server until SIGINT or SIGTERM.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let server = RelayServer::from_config(config)?;
    let listener = server.bind().await?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Received shutdown signal");
        shutdown.cancel();
    });

    server.serve(listener).await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to register SIGTERM handler, waiting for Ctrl-C only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => tracing::info!("Received SIGINT"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
            }
        }
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[Session]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let name_width = sessions
        .iter()
        .map(|s| s.display_name.len())
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:<name_width$}  {:>10}  DIRECTORY",
        "NAME",
        "CREATED",
        name_width = name_width
    );
    println!("{}", "-".repeat(name_width + 24));

    for session in sessions {
        println!(
            "{:<name_width$}  {:>10}  {}",
            session.display_name,
            format_relative_time(session.created_at / 1000),
            session.working_directory.display(),
            name_width = name_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp (seconds) as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);

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
