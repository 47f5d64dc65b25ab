//! Recollector CLI - log in to the recollector backend and call its API from
//! the terminal.
//!
//! The session survives between runs in the configured store, and an expired
//! token is renewed transparently before the next request.

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use recollector_core::{ApiClient, ApiError, Config};

const USAGE: &str = "\
Usage: recollector <command>

Commands:
  login [email]        Log in (prompts for the password)
  logout               End the session
  status               Show who is logged in and when the token expires
  get <path>           GET an API path, e.g. /v1/categories
  post <path> <json>   POST a JSON body to an API path";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

enum Command {
    Login(Option<String>),
    Logout,
    Status,
    Get(String),
    Post(String, String),
}

fn parse_args(args: &[String]) -> Result<Command> {
    let rest = args.get(2..).unwrap_or_default();
    let command = match (args.get(1).map(String::as_str), rest) {
        (Some("login"), []) => Command::Login(None),
        (Some("login"), [email]) => Command::Login(Some(email.clone())),
        (Some("logout"), []) => Command::Logout,
        (Some("status"), []) => Command::Status,
        (Some("get"), [path]) => Command::Get(path.clone()),
        (Some("post"), [path, body]) => Command::Post(path.clone(), body.clone()),
        _ => bail!("{}", USAGE),
    };
    Ok(command)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            if needs_login(&e) {
                eprintln!("Run `recollector login` to sign in again.");
            }
            ExitCode::FAILURE
        }
    }
}

fn needs_login(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ApiError>()
        .map(ApiError::requires_login)
        .unwrap_or(false)
}

async fn run(args: &[String]) -> Result<()> {
    let command = parse_args(args)?;
    let mut config = Config::load()?;
    let client = ApiClient::connect(&config)?;
    info!(base_url = %config.base_url, "recollector starting");

    match command {
        Command::Login(email) => {
            let email = match email.or_else(|| config.last_email.clone()) {
                Some(email) => email,
                None => prompt("Email: ")?,
            };
            let password = rpassword::prompt_password("Password: ")?;
            let credential = client.login(&email, &password).await?;

            config.last_email = Some(email);
            config.save().context("Failed to save config")?;
            println!(
                "Logged in as {} (token valid until {})",
                credential.subject(),
                credential.expires_at().format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        Command::Logout => {
            // Local session is gone even if the backend call failed
            if let Err(e) = client.logout().await {
                eprintln!("Warning: backend logout failed: {}", e);
            }
            println!("Logged out");
        }
        Command::Status => print_status(&client).await,
        Command::Get(path) => {
            let data: Value = client.get(&path).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Command::Post(path, body) => {
            let body: Value = serde_json::from_str(&body).context("Body is not valid JSON")?;
            let data: Value = client.post(&path, &body).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
    }
    Ok(())
}

async fn print_status(client: &ApiClient) {
    let status = client.session().status().await;
    match status.subject.as_deref() {
        Some(subject) if status.authenticated => {
            println!("Logged in as {}", subject);
            println!("Token expires in {} minutes", status.minutes_until_expiry());
        }
        Some(subject) => {
            println!("Session for {} has expired; it will be renewed on the next request", subject);
        }
        None => {
            println!("Not logged in");
            if let Some(ref error) = status.last_error {
                println!("Last error: {}", error);
            }
        }
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("{} is required", label.trim_end_matches([':', ' ']));
    }
    Ok(value)
}
