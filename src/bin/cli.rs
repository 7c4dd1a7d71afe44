//! Secure OTA CLI - Main entry point for the `ota-cli` binary
//!
//! Runs the device-side update server and the peer-side push tool.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::OsRng;
use rand::RngCore;
use secure_ota::engine::{
    cli::formatter::CliFormatter,
    cli::{Cli, Commands, OutputFormat},
    client::{header_for, push_firmware},
    config::Config,
    storage::{BootPartitionState, PartitionStore},
    updater::{check_rollback, RollbackDecision},
    Authenticator, DeviceServer, SessionCoordinator,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const SECRET_LEN: usize = 32;

fn main() {
    let cli = Cli::parse();
    let device_dir = cli.get_device_dir();

    let filter = match cli.command {
        Commands::Serve { .. } => Config::load(&device_dir)
            .map(|config| config.device.log_filter)
            .unwrap_or_else(|_| "info".to_string()),
        _ => "warn".to_string(),
    };
    secure_ota::init_tracing(&filter);

    if let Err(e) = run_cli(cli, &device_dir) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli, device_dir: &Path) -> Result<()> {
    let json_output = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Init { name, force } => cmd_init(device_dir, &name, force, json_output),
        Commands::Serve { port, host } => cmd_serve(device_dir, host, port),
        Commands::Push {
            image,
            addr,
            secret,
            chunk_len,
            timeout,
        } => cmd_push(device_dir, &image, &addr, secret, chunk_len, timeout, json_output),
        Commands::Header { image } => cmd_header(&image, json_output),
        Commands::Status => cmd_status(device_dir, json_output),
        Commands::Confirm { reject } => cmd_confirm(device_dir, reject, json_output),
    }
}

fn open_store(device_dir: &Path, config: &Config) -> Result<PartitionStore> {
    let store = PartitionStore::new(device_dir.to_path_buf(), config.storage.slot_capacity);
    store
        .init()
        .with_context(|| format!("Could not prepare slots in {}", device_dir.display()))?;
    Ok(store)
}

fn cmd_init(device_dir: &Path, name: &str, force: bool, json: bool) -> Result<()> {
    if Config::path(device_dir).exists() && !force {
        bail!(
            "Device already initialized: {} (use --force to overwrite)",
            device_dir.display()
        );
    }
    std::fs::create_dir_all(device_dir)?;

    let mut secret = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut secret);

    let config = Config::default_for_device(name, &secret);
    config.save(device_dir)?;
    open_store(device_dir, &config)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "success": true,
                "device_dir": device_dir.display().to_string(),
                "name": name,
                "secret_hex": hex::encode(secret),
            })
        );
    } else {
        CliFormatter::success(&format!("Initialized device: {}", name));
        CliFormatter::kv("Directory", &device_dir.display().to_string());
        CliFormatter::kv("Secret", &hex::encode(secret));
        CliFormatter::info("Share the secret with the update peer, then run `ota-cli serve`");
    }
    Ok(())
}

#[tokio::main]
async fn cmd_serve(device_dir: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = Config::load(device_dir)?;
    if let Some(host) = host {
        config.transport.host = host;
    }
    if let Some(port) = port {
        config.transport.port = port;
    }

    let store = open_store(device_dir, &config)?;
    let record = store.record()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        device = %config.device.name,
        active = %record.active,
        state = ?record.state,
        "whoami"
    );

    let auth = Authenticator::new();
    auth.set_secret(&config.auth.secret()?)?;

    let server = DeviceServer::new(
        &config.transport,
        Arc::new(SessionCoordinator::new(store)),
        Arc::new(auth),
    );

    let addr = config.transport.bind_addr();
    CliFormatter::header("Secure OTA Device");
    CliFormatter::kv("Device", &config.device.name);
    CliFormatter::kv("Listening", &addr);
    CliFormatter::info("Press Ctrl+C to stop");

    tokio::select! {
        result = server.serve(&addr) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

#[tokio::main]
async fn cmd_push(
    device_dir: &Path,
    image_path: &Path,
    addr: &str,
    secret: Option<String>,
    chunk_len: usize,
    timeout_secs: u64,
    json: bool,
) -> Result<()> {
    let secret = match secret {
        Some(encoded) => hex::decode(encoded.trim()).context("Secret is not valid hex")?,
        None => Config::load(device_dir)?.auth.secret()?,
    };
    let image = std::fs::read(image_path)
        .with_context(|| format!("Could not read {}", image_path.display()))?;

    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .with_context(|| format!("Could not connect to {}", addr))?;
    stream.set_nodelay(true)?;

    let ack = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        push_firmware(&mut stream, &secret, &image, chunk_len),
    )
    .await
    .context("Device did not finish the update in time")??;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "success": ack.is_success(),
                "bytes_written": ack.bytes_written,
                "status_code": ack.status.code(),
            })
        );
    } else {
        CliFormatter::ota_ack(&ack);
    }

    if !ack.is_success() {
        bail!("Update rejected by device");
    }
    Ok(())
}

fn cmd_header(image_path: &Path, json: bool) -> Result<()> {
    let image = std::fs::read(image_path)
        .with_context(|| format!("Could not read {}", image_path.display()))?;
    let header = header_for(&image)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "size": header.firmware_size,
                "sha256": hex::encode(header.expected_digest),
                "frame": hex::encode(header.to_bytes()),
            })
        );
    } else {
        CliFormatter::update_header(&header);
    }
    Ok(())
}

fn cmd_status(device_dir: &Path, json: bool) -> Result<()> {
    let config = Config::load(device_dir)?;
    let store = PartitionStore::new(device_dir.to_path_buf(), config.storage.slot_capacity);
    let record = store.record()?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "device": config.device.name,
                "port": config.transport.port,
                "boot": record,
            })
        );
    } else {
        CliFormatter::kv("Device", &config.device.name);
        CliFormatter::boot_record(&record);
    }
    Ok(())
}

fn cmd_confirm(device_dir: &Path, reject: bool, json: bool) -> Result<()> {
    let config = Config::load(device_dir)?;
    let mut store = open_store(device_dir, &config)?;

    if store.record()?.state != BootPartitionState::PendingVerify {
        if json {
            println!("{}", serde_json::json!({ "pending": false }));
        } else {
            CliFormatter::info("No image awaiting confirmation");
        }
        return Ok(());
    }

    if reject {
        CliFormatter::warning("Rejecting pending image, rolling back");
    }
    // A rejection marks the slot invalid and exits with the reboot status
    let decision = check_rollback(&mut store, !reject)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "pending": true, "confirmed": decision == RollbackDecision::Confirmed })
        );
    } else {
        CliFormatter::success("Image confirmed, rollback cancelled");
    }
    Ok(())
}
