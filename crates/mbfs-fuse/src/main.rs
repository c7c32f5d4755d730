//! mbmount - Mount mobile device backup archives as FUSE filesystems.
//!
//! Usage: mbmount <ARCHIVE> <MOUNTPOINT>

use anyhow::{Context, Result};
use clap::Parser;
use mbfs_core::MountBackend;
use mbfs_fuse::{FuseBackend, MountConfig};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mbmount")]
#[command(about = "Mount mobile device backup archives as FUSE filesystems")]
#[command(version)]
struct Cli {
    /// Archive directory containing Manifest.mbdb
    archive: PathBuf,

    /// Mountpoint for the filesystem
    mount: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Mount as read-only (default: read-write)
    #[arg(long)]
    read_only: bool,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Kernel attribute cache TTL in milliseconds
    #[arg(long, default_value_t = 1000, env = "MBMOUNT_ATTR_TTL_MS")]
    attr_ttl_ms: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    if !cli.archive.is_dir() {
        anyhow::bail!("Archive path does not exist: {}", cli.archive.display());
    }
    if !cli.mount.exists() {
        anyhow::bail!("Mountpoint does not exist: {}", cli.mount.display());
    }

    let config = MountConfig::default()
        .read_only(cli.read_only)
        .allow_other(cli.allow_other)
        .attr_ttl(Duration::from_millis(cli.attr_ttl_ms));
    let backend = FuseBackend::new(config);
    if let Some(reason) = backend.unavailable_reason() {
        anyhow::bail!("{} backend unavailable: {reason}", backend.name());
    }

    info!(archive = %cli.archive.display(), mount = %cli.mount.display(), "Mounting archive");
    let session = backend
        .mount(&cli.archive, &cli.mount)
        .context("Failed to mount archive")?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set Ctrl-C handler")?;

    info!("Mounted. Press Ctrl-C to unmount.");
    if rx.recv().is_err() {
        error!("Signal channel closed unexpectedly");
    }

    info!(mountpoint = %session.mountpoint().display(), "Unmounting");
    session.unmount().context("Failed to unmount")?;
    info!("Unmounted cleanly");
    Ok(())
}
