use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use std::path::PathBuf;

use crate::session::Session;

/// Tenant Gateway - authenticated client for the platform API
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Platform API base URL
    #[arg(
        short = 'u',
        long,
        env = "API_BASE_URL",
        default_value = "http://localhost:8000/api/v1"
    )]
    pub base_url: String,

    /// Path to the session database
    #[arg(short = 's', long, env = "SESSION_DB_FILE")]
    pub session_db: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "20000")]
    pub request_timeout_ms: u64,

    /// Token refresh timeout in milliseconds
    #[arg(long, env = "REFRESH_TIMEOUT_MS", default_value = "20000")]
    pub refresh_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Send an authenticated request and print the response payload
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,

        /// Path below the base URL, e.g. /campaigns
        path: String,

        /// JSON request body
        #[arg(short = 'd', long)]
        data: Option<String>,

        /// Extra header as "Name: value" (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Override the per-request timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Inspect or change the stored session
    #[command(subcommand)]
    Session(SessionCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Print the stored session with tokens shortened
    Show,

    /// Store tokens issued by the login flow (prompts for missing values)
    Import {
        #[arg(long, env = "ACCESS_TOKEN")]
        access_token: Option<String>,

        #[arg(long, env = "REFRESH_TOKEN")]
        refresh_token: Option<String>,

        #[arg(long)]
        tenant_id: Option<String>,
    },

    /// Remove the stored session (log out)
    Clear,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Platform API
    pub api_base_url: String,

    // Session persistence
    pub session_db_file: PathBuf,

    // Timeouts
    pub request_timeout_ms: u64,
    pub refresh_timeout_ms: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: CliArgs) -> Result<(Self, Command)> {
        let session_db_file = match args.session_db {
            Some(path) => expand_tilde(&path),
            None => default_session_db()
                .context("Cannot determine a data directory; set SESSION_DB_FILE")?,
        };

        let config = Config {
            api_base_url: args.base_url.trim_end_matches('/').to_string(),
            session_db_file,

            request_timeout_ms: args.request_timeout_ms,
            refresh_timeout_ms: args.refresh_timeout_ms,

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            log_level: args.log_level,
        };

        Ok((config, args.command))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            anyhow::bail!(
                "API_BASE_URL must start with http:// or https://: {}",
                self.api_base_url
            );
        }

        if self.request_timeout_ms == 0 {
            anyhow::bail!("REQUEST_TIMEOUT_MS must be greater than zero");
        }

        if self.refresh_timeout_ms == 0 {
            anyhow::bail!("REFRESH_TIMEOUT_MS must be greater than zero");
        }

        Ok(())
    }
}

/// Default session database location in the user's data directory
fn default_session_db() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("tenant-gateway").join("session.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse a "Name: value" header argument
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("Header must look like \"Name: value\": {}", raw))?;

    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Header name is empty: {}", raw);
    }

    Ok((name.to_string(), value.trim().to_string()))
}

// === Interactive Session Import ===

/// Collect session fields, prompting for any not given on the command line
pub fn prompt_session(
    access_token: Option<String>,
    refresh_token: Option<String>,
    tenant_id: Option<String>,
) -> Result<Session> {
    let access_token = match access_token {
        Some(token) => token,
        None => Password::new()
            .with_prompt("Access token")
            .interact()
            .context("Failed to read access token")?,
    };

    if access_token.trim().is_empty() {
        anyhow::bail!("Access token cannot be empty");
    }

    let refresh_token = match refresh_token {
        Some(token) => token,
        None => Password::new()
            .with_prompt("Refresh token (leave empty if none)")
            .allow_empty_password(true)
            .interact()
            .context("Failed to read refresh token")?,
    };

    let tenant_id = match tenant_id {
        Some(id) => id,
        None => Input::<String>::new()
            .with_prompt("Tenant id (leave empty if unknown)")
            .allow_empty(true)
            .interact_text()
            .context("Failed to read tenant id")?,
    };

    Ok(Session {
        access_token: access_token.trim().to_string(),
        refresh_token: non_empty(refresh_token),
        tenant_id: non_empty(tenant_id),
    })
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
