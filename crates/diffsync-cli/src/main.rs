//! diffsync CLI
//!
//! Command-line interface for diffsync: run a sync server, or join a room as
//! a short-lived client to read and edit its document.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use diffsync_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "diffsync")]
#[command(about = "Differential synchronization of JSON documents")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Sync server URL (overrides server_url)
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync server
    Serve {
        /// Address to listen on (overrides bind_addr)
        #[arg(long)]
        bind: Option<String>,
        /// Keep rooms in memory instead of the data directory
        #[arg(long)]
        memory: bool,
    },
    /// Print a room's document
    Show {
        /// Room id
        room: String,
    },
    /// Set a value in a room's document
    Set {
        /// Room id
        room: String,
        /// JSON pointer to the value, e.g. /todos/0/done
        pointer: String,
        /// New value as JSON, e.g. '"text"' or '{"a": 1}'
        value: String,
    },
    /// Remove a value from a room's document
    #[command(alias = "rm")]
    Remove {
        /// Room id
        room: String,
        /// JSON pointer to the value
        pointer: String,
    },
    /// Print a room's document whenever it changes
    Watch {
        /// Room id
        room: String,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, bind_addr, server_url, evict_empty_rooms)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    let config_path = cli.config.clone().unwrap_or_else(Config::config_file_path);

    if let Commands::Config { command } = &cli.command {
        return match command {
            Some(ConfigCommands::Show) | None => commands::config::show(&config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, &config_path, &output)
            }
        };
    }

    let config = Config::load_from_path(&config_path).context("Failed to load configuration")?;
    let url = server_url(cli.server.as_deref(), &config);

    match cli.command {
        Commands::Serve { bind, memory } => {
            commands::serve::run(&config, bind, memory, &output).await
        }
        Commands::Show { room } => commands::doc::show(&url, &room, &output).await,
        Commands::Set {
            room,
            pointer,
            value,
        } => commands::doc::set(&url, &room, &pointer, &value, &output).await,
        Commands::Remove { room, pointer } => {
            commands::doc::remove(&url, &room, &pointer, &output).await
        }
        Commands::Watch { room } => commands::doc::watch(&url, &room, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

/// Server to connect to: flag, then config, then the local bind address
fn server_url(flag: Option<&str>, config: &Config) -> String {
    flag.map(str::to_string)
        .or_else(|| config.server_url.clone())
        .unwrap_or_else(|| format!("ws://{}", config.bind_addr))
}

/// Log to stderr so stdout stays parseable
fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("diffsync_core={},diffsync={}", level, level)));

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_set() {
        let cli = Cli::try_parse_from([
            "diffsync", "--json", "set", "notes", "/title", r#""hello""#,
        ])
        .unwrap();

        assert!(cli.json);
        match cli.command {
            Commands::Set {
                room,
                pointer,
                value,
            } => {
                assert_eq!(room, "notes");
                assert_eq!(pointer, "/title");
                assert_eq!(value, r#""hello""#);
            }
            _ => panic!("Expected set command"),
        }
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["diffsync", "show", "notes", "--server", "ws://h:1", "-q"])
            .unwrap();
        assert!(cli.quiet);
        assert_eq!(cli.server.as_deref(), Some("ws://h:1"));
    }

    #[test]
    fn test_server_url_precedence() {
        let mut config = Config::default();
        assert_eq!(server_url(None, &config), "ws://127.0.0.1:9000");

        config.server_url = Some("ws://configured:9000".to_string());
        assert_eq!(server_url(None, &config), "ws://configured:9000");
        assert_eq!(server_url(Some("ws://flag:1"), &config), "ws://flag:1");
    }
}
