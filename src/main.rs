// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use ethers::signers::{LocalWallet, Signer};
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use arka_bundler::config::Args;
use arka_bundler::rpc::{RelayRpcImpl, RelayRpcServer};
use arka_bundler::{EthEntryPoint, Relayer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Parse command line arguments
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.relayer_config()?;
    let server_addr = args.server_addr()?;

    let wallet = args.private_key.parse::<LocalWallet>()?.with_chain_id(args.chain_id);
    let chain = Arc::new(EthEntryPoint::new(&args.eth_rpc_url, args.entry_point)?);
    let relayer = Arc::new(Relayer::new(chain, wallet, config));

    match relayer.verify_request_ids().await {
        Ok(true) => info!("Request id derivation matches entry point"),
        Ok(false) => warn!("Request ids reported to clients will not match the entry point"),
        Err(e) => warn!("Could not check request ids against entry point: {}", e),
    }

    info!("Starting ERC-4337 bundler RPC server on {}", server_addr);
    let server_handle = start_server(server_addr, RelayRpcImpl::new(relayer)).await?;

    // Keep the server running until Ctrl+C is pressed
    tokio::signal::ctrl_c().await?;
    server_handle.stop()?;
    info!("Server stopped");

    Ok(())
}

async fn start_server(
    server_addr: SocketAddr,
    relay_rpc: RelayRpcImpl<EthEntryPoint>,
) -> anyhow::Result<ServerHandle> {
    let server = ServerBuilder::default().build(server_addr).await?;
    let server_handle = server.start(relay_rpc.into_rpc());

    Ok(server_handle)
}
