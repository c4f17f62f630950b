#![deny(warnings)]
#![deny(clippy::unwrap_used)]

//! Minimal collaborator harness around the transfer engine.
//!
//! Reads paste requests from stdin, one per line, as
//! `<terminal_pid> <image_path>`. The resolved destination path is printed
//! immediately; completion events follow asynchronously as JSON lines.

use std::path::PathBuf;
use std::sync::Arc;

use dotenv::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use smartpaste::paste::client::RusshTransportFactory;
use smartpaste::paste::config::EngineConfig;
use smartpaste::paste::coordinator::TransferCoordinator;
use smartpaste::paste::dedup::DedupCache;
use smartpaste::paste::payload::ImagePayload;
use smartpaste::paste::pool::ConnectionPool;
use smartpaste::paste::process::ProcfsSnapshot;
use smartpaste::paste::resolver::{ContextResolver, os_username};
use smartpaste::paste::ssh_config::SshConfigFile;

fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("SMARTPASTE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".smartpaste").join("config.json"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = EngineConfig::load(config_path().as_deref())?;

    let snapshot = Arc::new(ProcfsSnapshot::new());
    let ssh_config = Arc::new(SshConfigFile::load_default());
    let resolver = Arc::new(ContextResolver::new(
        snapshot,
        ssh_config,
        os_username(),
        config.resolve_cache_ttl(),
    ));
    let dedup = Arc::new(DedupCache::new(config.dedup_capacity));
    let factory = Arc::new(RusshTransportFactory::new(&config));
    let pool = Arc::new(ConnectionPool::new(factory, &config));
    let coordinator = Arc::new(TransferCoordinator::new(config, resolver, dedup, pool));

    coordinator.start().await;

    // Completion feed for the notification collaborator.
    let mut events = coordinator.subscribe();
    let event_printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("{}", json),
                Err(err) => error!("Failed to encode completion event: {}", err),
            }
        }
    });

    info!("Reading paste requests from stdin: <terminal_pid> <image_path>");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((pid_text, image_path)) = line.split_once(char::is_whitespace) else {
            warn!("Ignoring malformed request: {}", line);
            continue;
        };
        let Ok(pid) = pid_text.parse::<u32>() else {
            warn!("Ignoring request with invalid pid: {}", pid_text);
            continue;
        };

        let image_path = image_path.trim();
        let bytes = match tokio::fs::read(image_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("Cannot read {}: {}", image_path, err);
                continue;
            }
        };

        match coordinator.submit(ImagePayload::new(bytes), pid) {
            Ok(destination) => println!("{}", destination),
            Err(err) => warn!("Submission rejected: {}", err),
        }
    }

    coordinator.shutdown().await;
    event_printer.abort();
    Ok(())
}
