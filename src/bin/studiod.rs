//! studiod - Detection Studio web app
//!
//! This daemon:
//! 1. Loads the studio config (STUDIO_CONFIG file, then STUDIO_* env)
//! 2. Registers the configured detector plus the CPU fallbacks
//! 3. Serves the studio page and its controls over HTTP
//! 4. Runs one annotation run at a time on a worker thread

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use detection_studio::api::ApiServer;
use detection_studio::{Studio, StudioConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Listen address; overrides the config file and STUDIO_API_ADDR.
    #[arg(long)]
    addr: Option<String>,
    /// Preselect a local video (or stub:// clip) as the source.
    #[arg(long, value_name = "PATH")]
    select: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = StudioConfig::load()?;
    if let Some(addr) = args.addr {
        config.api.addr = addr;
    }
    log::info!(
        "studiod: output {} ({} @ default {} fps), uploads in {}",
        config.output.path.display(),
        config.output.codec,
        config.output.default_fps,
        config.api.upload_dir.display()
    );

    let studio = Arc::new(Studio::new(config)?);
    log::info!(
        "studiod: detectors {:?}, default {}",
        studio.registry().list(),
        studio.registry().default_name().unwrap_or("none")
    );
    if let Some(path) = args.select {
        studio.select_file(&path)?;
        log::info!("studiod: preselected {}", path.display());
    }

    let api_handle = ApiServer::new(Arc::clone(&studio)).spawn()?;
    log::info!("studiod: open http://{}/", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("studiod waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping active run and API server...");
    studio.shutdown()?;
    api_handle.stop()?;

    Ok(())
}
