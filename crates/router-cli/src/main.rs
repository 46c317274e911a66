mod raw_socket;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use router_core::RouterConfig;
use router_net::Router;

/// Software NAT router daemon.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the router's TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config: RouterConfig = router_core::load_from_file(&args.config)?;

    run(config)
}

#[cfg(target_os = "linux")]
fn run(config: RouterConfig) -> anyhow::Result<()> {
    let io = raw_socket::RawSocketFrameIo::new(&config.interfaces)?;
    let router = Arc::new(Router::new(config));

    tracing::info!("router started");
    let mut handle = router.run(io);
    if let Some(dispatcher) = handle.take_dispatcher() {
        let _ = dispatcher.join();
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_config: RouterConfig) -> anyhow::Result<()> {
    anyhow::bail!("raw socket frame transport is only implemented for Linux");
}
