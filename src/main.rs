use anyhow::{Context, Result};
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;

use tenant_gateway::config::{self, Command, Config, SessionCommand};
use tenant_gateway::{Gateway, RequestDescriptor, SessionEvent, SqliteSessionStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level; stdout is reserved for payloads
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(
        base_url = %config.api_base_url,
        session_db = %config.session_db_file.display(),
        "Configuration loaded"
    );

    let store = Arc::new(SqliteSessionStore::open(&config.session_db_file)?);
    let gateway = Gateway::from_config(&config, store.clone())?;

    match command {
        Command::Request {
            method,
            path,
            data,
            headers,
            timeout_ms,
        } => {
            let descriptor = build_descriptor(
                &method,
                path,
                data.as_deref(),
                &headers,
                timeout_ms.unwrap_or(config.request_timeout_ms),
            )?;
            run_request(&gateway, descriptor).await
        }
        Command::Session(session_command) => run_session(&gateway, &store, session_command),
    }
}

/// Turn command-line arguments into a request descriptor
fn build_descriptor(
    method: &str,
    path: String,
    data: Option<&str>,
    headers: &[String],
    timeout_ms: u64,
) -> Result<RequestDescriptor> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;

    let mut descriptor =
        RequestDescriptor::new(method, path).timeout(Duration::from_millis(timeout_ms));

    if let Some(data) = data {
        let body = serde_json::from_str(data).context("Request body must be valid JSON")?;
        descriptor = descriptor.json(body);
    }

    for raw in headers {
        let (name, value) = config::parse_header(raw)?;
        descriptor = descriptor.header(name, value);
    }

    Ok(descriptor)
}

async fn run_request(gateway: &Gateway, descriptor: RequestDescriptor) -> Result<()> {
    let mut events = gateway.subscribe();

    let result = gateway.request_json(descriptor).await;

    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Expired { reason } => {
                tracing::warn!(reason = %reason, "Session invalidated");
            }
            SessionEvent::SignedOut => {}
        }
    }

    match result {
        Ok(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        Err(e) if e.requires_login() => {
            eprintln!("{}", e);
            eprintln!("Log in again, then run: tenant-gateway session import");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_session(
    gateway: &Gateway,
    store: &SqliteSessionStore,
    command: SessionCommand,
) -> Result<()> {
    match command {
        SessionCommand::Show => match gateway.session()? {
            Some(session) => {
                println!("{:#?}", session);
                if let Some(updated) = store.last_updated()? {
                    println!("Last updated: {}", updated.to_rfc3339());
                }
            }
            None => println!("No session stored. Login first."),
        },
        SessionCommand::Import {
            access_token,
            refresh_token,
            tenant_id,
        } => {
            let session = config::prompt_session(access_token, refresh_token, tenant_id)?;
            gateway.sign_in(session)?;
            println!("✅ Session stored");
        }
        SessionCommand::Clear => {
            if gateway.sign_out()? {
                println!("👋 Logged out");
            } else {
                println!("No session stored.");
            }
        }
    }

    Ok(())
}
