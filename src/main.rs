//! Mount a caching overlay over a possibly-offline backend directory.
use std::path::PathBuf;

use clap::Parser;
use fuser::MountOption;
use tracing::{error, info};

use stashfs::app_config::Config;
use stashfs::backend::local::LocalBackend;
use stashfs::cache::Cache;
use stashfs::fs::fuser::FuseDriver;
use stashfs::fs::Filesystem;

#[derive(Parser)]
#[command(version, about = "Caching overlay filesystem.")]
struct Args {
    /// Path to a stashfs config TOML.
    #[arg(short, long, value_parser)]
    config_path: PathBuf,

    /// Override the configured mount point.
    #[arg(short, long, value_parser)]
    mount_point: Option<PathBuf>,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Load config first — errors use eprintln since tracing isn't initialized yet.
    let mut config = match Config::load(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Some(mount_point) = args.mount_point {
        config.mount_point = mount_point;
    }
    if let Err(problems) = config.validate() {
        eprintln!("Configuration is invalid.");
        for problem in &problems {
            eprintln!(" - {problem}");
        }
        std::process::exit(1);
    }

    if let Err(e) = stashfs::trc::init() {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(config) {
        error!("Mount failed: {e}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let cache = Cache::open(&config.cache_dir)?;
    let backend = LocalBackend::new(config.backend.root.clone());
    let fs = Filesystem::new(cache, backend);
    let driver = FuseDriver::new(fs, runtime.handle().clone());

    std::fs::create_dir_all(&config.mount_point)?;
    let options = [
        MountOption::RO,
        MountOption::FSName("stashfs".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ];
    let session = fuser::spawn_mount2(driver, &config.mount_point, &options)?;
    info!(
        mount_point = %config.mount_point.display(),
        backend = %config.backend.root.display(),
        "mounted"
    );

    runtime.block_on(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupted, unmounting"),
            _ = sigterm.recv() => info!("terminated, unmounting"),
        }
        Ok::<_, std::io::Error>(())
    })?;

    drop(session);
    Ok(())
}
