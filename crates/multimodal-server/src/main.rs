// multimodal-server/src/main.rs

#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use multimodal_server::{config::Config, run_server};
#[cfg(feature = "cli")]
use std::path::PathBuf;

/// Command-line overrides; anything left unset comes from the environment.
#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "multimodal-server", version, about)]
struct Args {
    /// Address to bind (API_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Device preference: cpu, cuda or mps (DEVICE)
    #[arg(long)]
    device: Option<String>,

    /// Pretrained model cache directory (CACHE_DIR)
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut cfg = Config::from_env()?;
    if let Some(host) = args.host {
        cfg.api_host = host;
    }
    if let Some(port) = args.port {
        cfg.api_port = port;
    }
    if let Some(device) = args.device {
        cfg.device = device;
    }
    if let Some(cache_dir) = args.cache_dir {
        cfg.cache_dir = cache_dir;
    }

    println!("🚀 Starting multimodal inference server");
    run_server(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
