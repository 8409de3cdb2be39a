//! Headless bridge daemon: load the slot config, start every assigned
//! slot, run until stdin closes. The HTTP control surface runs elsewhere;
//! this binary only hosts the core.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use ndi_aes67_bridge::source::ndi::NdiSourceSystem;
use ndi_aes67_bridge::{BridgeOptions, SlotManager, SourceSystem};

#[derive(Parser, Debug)]
#[command(name = "aes67-bridged", about = "NDI to AES67 bridge daemon")]
struct Args {
    /// Path of the persisted slot configuration.
    #[arg(long, default_value = "slots.json")]
    config: PathBuf,

    /// List discoverable NDI sources and exit.
    #[arg(long)]
    list_sources: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let system = Arc::new(NdiSourceSystem::new()?);

    if args.list_sources {
        for name in system.refresh_sources() {
            println!("{name}");
        }
        return Ok(());
    }

    let manager = SlotManager::new(&args.config, system, BridgeOptions::default())?;
    let status = manager.start_all();
    info!(running = status.running, message = %status.message, "bridge started");

    // Run until stdin closes (interactive exit or supervisor teardown),
    // then stop cleanly so SAP sessions are withdrawn.
    let mut sink = Vec::new();
    let _ = std::io::stdin().read_to_end(&mut sink);

    info!("shutting down");
    manager.stop_all();
    Ok(())
}
