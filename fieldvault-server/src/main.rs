//! FieldVault Server - Versioned field encryption KMS
//!
//! Operator-facing process exposing the key rotation pipeline over a thin
//! newline-delimited JSON protocol.

mod server;

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fieldvault_core::{
    FileStateStore, KeyProvider, KmsConfig, MemoryRecordStore, Orchestrator, SecretSource,
};

use crate::server::KmsServer;

#[derive(Parser, Debug)]
#[command(name = "fieldvault-server")]
#[command(about = "FieldVault - versioned field encryption KMS")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// TCP server bind address
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// TCP server port
    #[arg(short = 'p', long, default_value = "7542")]
    port: u16,

    /// Data directory for rotation state and demo records
    #[arg(short = 'D', long, default_value = "./fieldvault_data")]
    data_dir: PathBuf,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::new(format!(
        "fieldvault_server={},fieldvault_core={}",
        log_level, log_level
    ));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!("FieldVault Server starting");

    let config = match &args.config {
        Some(path) => KmsConfig::load(path)?,
        None => KmsConfig::default(),
    };

    info!("Configuration:");
    info!("  • Listen Address: {}:{}", args.host, args.port);
    info!("  • Data Directory: {}", args.data_dir.display());
    info!("  • Secret Base Name: {}", config.secrets.base_name);
    info!("  • Tables In Scope: {}", config.tables.len());

    std::fs::create_dir_all(&args.data_dir)?;

    let provider = Arc::new(KeyProvider::new(SecretSource::env_with_base(
        config.secrets.base_name.clone(),
    )));

    // The record store behind the rotation scan is an external system in
    // production; the bundled file-backed store keeps the server runnable
    // on its own for evaluation and drills.
    let records = Arc::new(MemoryRecordStore::with_backing_file(
        args.data_dir.join("records.json"),
    )?);

    let state = Arc::new(FileStateStore::open(
        args.data_dir.join("rotation_state.json"),
    )?);

    let orchestrator = Arc::new(Orchestrator::new(
        provider,
        records,
        state,
        config.tables.clone(),
        config.rotation.clone(),
    )?);

    let bind_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let server = KmsServer::new(orchestrator);

    info!("FieldVault Server is ready to accept connections");
    info!("Press Ctrl+C to shutdown");

    let server_handle = tokio::spawn(async move { server.serve(bind_addr).await });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, stopping server...");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server completed normally"),
                Ok(Err(e)) => info!("Server error: {:?}", e),
                Err(e) => info!("Server task error: {}", e),
            }
        }
    }

    info!("FieldVault Server shutdown complete");
    Ok(())
}
