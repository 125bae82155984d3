mod auth;
mod backup;
mod config;
mod database;
mod error;
mod log;
mod upload;

use auth::{CredentialStore, GoogleAuth};
use backup::BackupCycle;
use console::style;
use error::Result;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const USAGE: &str = "usage: pg-drive-backup [run|schedule|authorize]";

#[tokio::main]
async fn main() -> ExitCode {
    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            log::init(None);
            error!("{}", e);
            eprintln!("{} {}", style("Error:").red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    log::init(config.log_file.as_deref());

    let choice = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    info!("pg-drive-backup starting ({})", choice);

    let result = match choice.trim() {
        "run" => run_once(&config).await,
        "schedule" => run_scheduled(&config).await,
        "authorize" => authorize(&config).await,
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(true)
        }
        other => {
            eprintln!("Unknown command '{}'\n{}", other, USAGE);
            Ok(false)
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            eprintln!("{} [{}] {}", style("Error:").red().bold(), e.kind(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run_once(config: &config::AppConfig) -> Result<bool> {
    let mut cycle = BackupCycle::from_config(config)?;
    let outcome = cycle.run().await;
    if outcome.is_success() {
        println!("{}", style(&outcome).green());
    } else {
        println!("{}", style(&outcome).red());
    }
    Ok(outcome.is_success())
}

async fn run_scheduled(config: &config::AppConfig) -> Result<bool> {
    let shutdown = Arc::new(AtomicUsize::new(0));
    let handler_count = shutdown.clone();

    ctrlc::set_handler(move || {
        let count = handler_count.fetch_add(1, Ordering::SeqCst);
        if count == 0 {
            println!("\n\nShutdown signal received. The running backup will finish; press Ctrl+C again to force exit...");
        } else {
            println!("\nForce exiting...");
            std::process::exit(130);
        }
    })
    .expect("Error setting Ctrl-C handler");

    let mut cycle = BackupCycle::from_config(config)?;
    let interval = Duration::from_secs(config.schedule.as_seconds());
    info!("Schedule: {}", config.schedule);

    backup::run_scheduler(&mut cycle, interval, shutdown).await;
    Ok(true)
}

async fn authorize(config: &config::AppConfig) -> Result<bool> {
    let endpoint = Arc::new(GoogleAuth::new(config.drive.redirect_port)?);
    let mut store = CredentialStore::open(&config.drive, endpoint, true)?;
    info!("Credential state before authorization: {:?}", store.state());

    store.authorize().await?;
    println!(
        "{} token saved to {}",
        style("Authorized:").green().bold(),
        store.token_path().display()
    );
    Ok(true)
}
