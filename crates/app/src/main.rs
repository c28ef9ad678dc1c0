//! Tourgate - admission server for guided tour events
//!
//! `tourgate [CONFIG]` serves the event described by CONFIG until ctrl-c.
//! `tourgate hash-password <PASSWORD>` prints an argon2 hash for an
//! `[[accounts]]` entry.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tourgate_core::{hash_password, Accounts, AdmissionEngine, ConfigError, EventConfig};
use tourgate_net::{Server, ServerConfig};

mod config;

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Core(#[from] tourgate_core::Error),
    #[error(transparent)]
    Net(#[from] tourgate_net::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let first = args.next();

    if first.as_deref() == Some("hash-password") {
        return match args.next() {
            Some(password) => match hash_password(&password) {
                Ok(hash) => {
                    println!("{}", hash);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "Failed to hash password");
                    ExitCode::FAILURE
                }
            },
            None => {
                eprintln!("usage: tourgate hash-password <PASSWORD>");
                ExitCode::FAILURE
            }
        };
    }

    let Some(path) = config::discover(first, std::env::var(config::CONFIG_ENV).ok()) else {
        error!("Could not determine config directory");
        return ExitCode::FAILURE;
    };
    let event = match config::load(&path) {
        Ok(event) => event,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(event)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve(event: EventConfig) -> Result<(), AppError> {
    let engine = Arc::new(AdmissionEngine::from_config(&event)?);
    let accounts = Accounts::from_config(&event.accounts)?;
    let server = Server::start(ServerConfig::from_event(&event), engine, accounts).await?;

    info!(addr = %server.addr(), event = %event.event.name, "Accepting guides");
    tokio::signal::ctrl_c().await?;

    server.shutdown();
    Ok(())
}
