//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

use std::error::Error;
use std::fs::OpenOptions;
use std::io::{BufRead, IsTerminal, Write};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::core::config::Config;
use crate::core::token_store::KeyringTokenStore;
use crate::mcp::{ClientStatus, SearchClient, SearchError, SearchOptions};

/// Environment variable holding the tracing filter directive.
pub const LOG_FILTER_ENV: &str = "MCP_SEARCH_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Parser)]
#[command(name = "mcp-search")]
#[command(version)]
#[command(about = "Search over a persistent MCP event-stream connection")]
#[command(
    long_about = "mcp-search opens one MCP event-stream session to a search backend, \
performs the protocol handshake, and runs search tool calls over it.\n\n\
Setup:\n\
  mcp-search set base-url https://mcp.example.com/sse\n\
  mcp-search auth             (reads the API token from stdin)\n\n\
Environment Variables:\n\
  MCP_SEARCH_LOG    tracing filter, e.g. 'mcp_search=debug' (default: warn)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Write logs to the specified file instead of stderr
    #[arg(short = 'l', long, global = true)]
    pub log: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one search and print the result
    Search {
        /// Search query (multiple words are joined with spaces)
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        /// Maximum number of results the backend should return
        #[arg(short = 'n', long)]
        max_results: Option<u32>,
    },
    /// Show client name, version, credential and connection state
    Status {
        /// Connect before reporting
        #[arg(long)]
        connect: bool,
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Store the API token (read from stdin) in the system keyring
    Auth,
    /// Remove the stored API token
    Deauth,
    /// Show the current configuration
    Config,
    /// Set a configuration value
    Set {
        /// Configuration key to set
        key: String,
        /// Value to set (multiple words are joined with spaces)
        #[arg(required = true, num_args = 1..)]
        value: Vec<String>,
    },
    /// Clear a configuration value
    Unset {
        /// Configuration key to clear
        key: String,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.log.as_deref())?;
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn init_logging(log_file: Option<&str>) -> Result<(), Box<dyn Error>> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_target(false);

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| format!("Failed to open log file {path}: {err}"))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|err| -> Box<dyn Error> { err })
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = Config::load()?;

    match args.command {
        Commands::Search { query, max_results } => {
            let query = join_words(&query).ok_or("Search query must not be empty")?;
            run_search(&config, &query, max_results).await
        }
        Commands::Status { connect, json } => run_status(&config, connect, json).await,
        Commands::Auth => run_auth(&config),
        Commands::Deauth => {
            let server = config.server_name();
            let removed = KeyringTokenStore::new()
                .remove_token(server)
                .map_err(|err| -> Box<dyn Error> { err })?;
            if removed {
                println!("✅ Removed stored token for {server}");
            } else {
                println!("No stored token for {server}");
            }
            Ok(())
        }
        Commands::Config => {
            config.print_all();
            Ok(())
        }
        Commands::Set { key, value } => {
            let value = join_words(&value).ok_or_else(|| format!("{key} needs a value"))?;
            let message = config.set_value(&key, &value)?;
            config.save()?;
            println!("{message}");
            Ok(())
        }
        Commands::Unset { key } => {
            let message = config.unset_value(&key)?;
            config.save()?;
            println!("{message}");
            Ok(())
        }
    }
}

fn build_client(config: &Config) -> Result<SearchClient, Box<dyn Error>> {
    let client_config = config.client_config()?;
    let client =
        SearchClient::with_http_transport(client_config, Arc::new(KeyringTokenStore::new()))?;
    Ok(client)
}

async fn run_search(
    config: &Config,
    query: &str,
    max_results: Option<u32>,
) -> Result<(), Box<dyn Error>> {
    let client = build_client(config)?;
    if !client.is_enabled() {
        eprintln!(
            "⚠️  No API token stored for {}; run 'mcp-search auth' if the server requires one.",
            config.server_name()
        );
    }

    let options = SearchOptions {
        max_results,
        ..SearchOptions::default()
    };
    let result = client.search(query, options).await;
    client.disconnect().await;

    match result {
        Ok(text) => {
            println!("{text}");
            Ok(())
        }
        Err(err) => {
            if let SearchError::Permission { .. } = err {
                eprintln!("💡 Check the stored token with 'mcp-search auth'.");
            }
            Err(err.into())
        }
    }
}

async fn run_status(config: &Config, connect: bool, json: bool) -> Result<(), Box<dyn Error>> {
    let client = build_client(config)?;
    if connect {
        if let Err(err) = client.connect().await {
            eprintln!("❌ Connection failed: {err}");
        }
    }

    let status = client.get_status();
    client.disconnect().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for line in format_status(&status) {
            println!("{line}");
        }
    }
    Ok(())
}

fn run_auth(config: &Config) -> Result<(), Box<dyn Error>> {
    let server = config.server_name();
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        eprint!("Enter API token for {server}: ");
        std::io::stderr().flush()?;
    }

    let mut token = String::new();
    stdin.lock().read_line(&mut token)?;
    let token = token.trim();
    if token.is_empty() {
        return Err("No token provided".into());
    }

    KeyringTokenStore::new()
        .set_token(server, token)
        .map_err(|err| -> Box<dyn Error> { err })?;
    println!("✅ Stored token for {server}");
    Ok(())
}

fn join_words(words: &[String]) -> Option<String> {
    let joined = words
        .iter()
        .map(|word| word.trim())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

pub fn format_status(status: &ClientStatus) -> Vec<String> {
    vec![
        format!("name: {}", status.name),
        format!("version: {}", status.version),
        format!("enabled: {}", if status.enabled { "yes" } else { "no" }),
        format!("connection: {}", status.connection_state),
    ]
}
