//! Fleetwatch CLI: summary server and operator commands for an agent fleet.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Fleetwatch: know what every agent in your fleet is doing
#[derive(Parser, Debug)]
#[command(name = "fleetwatch", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (reads .fleetwatch/config.toml from here)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand (defaults to `serve`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway and the background refresh sweep
    Serve {
        /// Host to bind (overrides gateway.host)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (overrides gateway.port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Generate a summary for one agent now and print it
    Summarize {
        agent_id: String,
        /// Project key (mangled directory name or working-directory path)
        #[arg(long)]
        project_key: Option<String>,
        /// Session id (defaults to the agent's current or newest session)
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Show persisted summary history, newest first
    History {
        agent_id: String,
        /// Number of entries
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the bounded transcript tail the model would see
    Transcript {
        project_key: String,
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Manage the agent registry
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum AgentAction {
    /// Register or update an agent
    Register {
        id: String,
        #[arg(long)]
        project_key: String,
        #[arg(long)]
        session_id: Option<String>,
        /// Display name (defaults to the id)
        #[arg(long)]
        name: Option<String>,
    },
    /// Mark an agent active now so the background sweep keeps refreshing it
    Touch {
        id: String,
        /// Switch the agent's current session
        #[arg(long)]
        session_id: Option<String>,
    },
    /// List registered agents
    List,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default .fleetwatch/config.toml into the workspace
    Init,
    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = fleetwatch_core::config::project_dirs()
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "fleetwatch.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = fleetwatch_core::load_validated_config(Some(&workspace), cli.config.as_deref())?;

    let command = cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    });
    commands::handle_command(command, config, &workspace).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_command_is_serve() {
        let cli = Cli::try_parse_from(["fleetwatch"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::try_parse_from(["fleetwatch", "-vv", "serve", "--port", "9000"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Commands::Serve { host, port }) => {
                assert_eq!(host, None);
                assert_eq!(port, Some(9000));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_agent_register() {
        let cli = Cli::try_parse_from([
            "fleetwatch",
            "agent",
            "register",
            "builder-1",
            "--project-key",
            "/home/dev/app",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Agent {
                action:
                    AgentAction::Register {
                        id,
                        project_key,
                        session_id,
                        name,
                    },
            }) => {
                assert_eq!(id, "builder-1");
                assert_eq!(project_key, "/home/dev/app");
                assert!(session_id.is_none());
                assert!(name.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_agent_touch() {
        let cli =
            Cli::try_parse_from(["fleetwatch", "agent", "touch", "a1", "--session-id", "s2"])
                .unwrap();
        match cli.command {
            Some(Commands::Agent {
                action: AgentAction::Touch { id, session_id },
            }) => {
                assert_eq!(id, "a1");
                assert_eq!(session_id.as_deref(), Some("s2"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_history_limit_default() {
        let cli = Cli::try_parse_from(["fleetwatch", "history", "a1"]).unwrap();
        match cli.command {
            Some(Commands::History { limit, .. }) => assert_eq!(limit, 20),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
