//! MailRecv: a fake SMTP receiver.
//!
//! Walks SMTP clients through the RFC 5321 dialogue far enough to
//! convince them their mail was accepted, while optionally persisting
//! each envelope and body for offline inspection. Meant as the sink node
//! of an MX-sandwich (nolisting) setup and as a test double for
//! applications that emit mail. Nothing is ever relayed or delivered.

pub mod config;
pub mod dnsxl;
pub mod sessionlog;
pub mod smtp;
pub mod store;

use std::sync::Arc;

use anyhow::Result;
use log::{error, info};

/// Runs the receiver until shutdown and returns its process exit code.
///
/// Loads the configuration snapshot, builds the server and its
/// collaborators, and wires Ctrl-C to a graceful stop: the listener
/// closes, sessions already accepted run to their natural end.
///
/// # Errors
///
/// Returns an `Err` when configuration loading or collaborator setup
/// (store directory, session log file) fails; listener failures are
/// reported through the exit code instead.
pub async fn run() -> Result<i32> {
    info!(
        "Starting {} v{} fake SMTP receiver",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load configuration: {err:#}");
            return Err(err);
        }
    };

    let server = Arc::new(smtp::Server::new(config).await?);

    // First Ctrl-C asks the acceptor to stop; in-flight sessions drain.
    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping listener");
            stopper.stop();
        }
    });

    Ok(server.start().await)
}
