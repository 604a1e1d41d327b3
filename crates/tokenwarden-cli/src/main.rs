//! tokenwarden - command-line front-end for the dashboard session.
//!
//! Signs in, inspects and renews the stored session, and makes authorized
//! API calls with it.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tokenwarden_core::{ApiError, Config, Credentials, HttpAuthBackend, SessionManager, SystemClock};

type Manager = SessionManager<HttpAuthBackend>;

const USAGE: &str = "\
Usage: tokenwarden <command>

Commands:
  login [email]            Sign in with email and password
  oauth <provider> <code>  Complete an OAuth sign-in with an authorization code
  status                   Show the stored session
  refresh                  Renew the access token now
  get <path>               GET an API path with the session's token
  watch                    Keep the session renewed until it ends or Ctrl-C
  logout                   End the session";

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes buffered log lines when dropped.
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };

    let mut config = Config::load().context("Failed to load configuration")?;
    let manager = open_manager(&config)?;
    info!(command = command, api = %config.api_base_url, "tokenwarden starting");

    match (command, &args[1..]) {
        ("login", rest) => login(&manager, &mut config, rest.first().cloned()).await,
        ("oauth", [provider, code]) => oauth(&manager, provider, code).await,
        ("status", []) => {
            status(&manager);
            Ok(())
        }
        ("refresh", []) => refresh(&manager).await,
        ("get", [path]) => get(&manager, &config, path).await,
        ("watch", []) => watch(&manager).await,
        ("logout", []) => {
            manager.logout().await;
            println!("Signed out.");
            Ok(())
        }
        _ => {
            eprintln!("{}", USAGE);
            anyhow::bail!("Unrecognized command: {}", args.join(" "))
        }
    }
}

fn open_manager(config: &Config) -> Result<Manager> {
    let backend = HttpAuthBackend::new(&config.api_base_url, config.request_timeout())
        .context("Failed to create HTTP client")?;
    let storage = config.open_storage()?;
    Ok(SessionManager::open(
        backend,
        storage,
        Arc::new(SystemClock),
        config.session_config(),
    ))
}

// ============================================================================
// Commands
// ============================================================================

async fn login(manager: &Manager, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    manager
        .login(&Credentials {
            email: email.clone(),
            password,
        })
        .await?;

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to remember email");
    }

    print_signed_in(manager);
    Ok(())
}

async fn oauth(manager: &Manager, provider: &str, code: &str) -> Result<()> {
    let grant = manager
        .backend()
        .exchange_oauth_code(provider, code)
        .await
        .with_context(|| format!("OAuth sign-in with {} failed", provider))?;
    manager.complete_login(grant);
    print_signed_in(manager);
    Ok(())
}

fn status(manager: &Manager) {
    let state = manager.state();
    let session = state.read();
    if session.is_empty() {
        println!("Not signed in.");
        return;
    }

    if let Some(user) = session.user() {
        println!("User:            {} <{}>", user.display_name(), user.email);
    }
    println!("Authenticated:   {}", state.is_authenticated());
    println!("Access token:    {}", describe_expiry(session.expires_at(), state.is_token_expired()));
    let refresh = if session.refresh_token().is_none() {
        "none".to_string()
    } else {
        describe_expiry(session.refresh_expires_at(), state.is_refresh_expired())
    };
    println!("Refresh token:   {}", refresh);
}

async fn refresh(manager: &Manager) -> Result<()> {
    manager
        .coordinator()
        .refresh()
        .await
        .context("Refresh failed, session cleared")?;
    println!("Access token renewed.");
    status(manager);
    Ok(())
}

async fn get(manager: &Manager, config: &Config, path: &str) -> Result<()> {
    let client = manager.authorized_client(&config.api_base_url, config.request_timeout())?;
    let body: serde_json::Value = match client.get_json(path).await {
        Ok(body) => body,
        Err(e) if e.downcast_ref::<ApiError>().is_some_and(ApiError::is_auth_failure) => {
            anyhow::bail!("{:#}\nRun `tokenwarden login` to sign in again.", e)
        }
        Err(e) => return Err(e),
    };
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// Run the refresh timer and the guard until the session ends or Ctrl-C
async fn watch(manager: &Manager) -> Result<()> {
    // A rehydrated session may hold an expired access token with a live refresh token
    if manager.coordinator().access_token().await.is_none() {
        tracing::debug!("No usable access token before watching");
    }

    let mut guard = manager.guard();
    if guard.evaluate().redirect {
        anyhow::bail!("Not signed in. Run `tokenwarden login` first.");
    }

    let scheduler = manager.start_scheduler();
    println!("Watching session (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                println!("Stopped.");
                break;
            }
            decision = guard.next_decision() => match decision {
                Some(decision) if decision.redirect => {
                    println!("Session ended. Run `tokenwarden login` to sign in again.");
                    break;
                }
                Some(_) => {
                    if let Some(at) = manager.state().read().expires_at() {
                        println!("Session active, access token valid until {}", local_time(at));
                    }
                }
                None => break,
            }
        }
    }

    scheduler.shutdown().await;
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read input")?;
    let line = line.trim().to_string();
    if line.is_empty() {
        anyhow::bail!("No input provided");
    }
    Ok(line)
}

fn print_signed_in(manager: &Manager) {
    let session = manager.state().read();
    match session.user() {
        Some(user) => println!("Signed in as {}.", user.display_name()),
        None => println!("Signed in."),
    }
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn describe_expiry(at: Option<DateTime<Utc>>, expired: bool) -> String {
    match (at, expired) {
        (Some(at), true) => format!("expired at {}", local_time(at)),
        (Some(at), false) => format!("valid until {}", local_time(at)),
        (None, _) => "no expiry".to_string(),
    }
}
