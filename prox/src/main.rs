use clap::Parser;
use prox_core::Selector;

mod cli;
mod relay;

use cli::Args;
use relay::Relay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cli::initialize_logging(&args)?;
    tracing::info!("prox v{}", env!("CARGO_PKG_VERSION"));

    let relay = Relay::start(&args, Selector::current())?;
    if let Some(addr) = relay.tcp().local_addr() {
        println!("TCP relay listening on {addr}");
    }
    if let Some(addr) = relay.udp().local_addr() {
        println!("UDP relay listening on {addr}");
    }

    relay
        .run(args.sweep_interval(), async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await
}
