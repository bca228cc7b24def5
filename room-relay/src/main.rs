use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use room_relay::{
    cli::{Cli, Command, ServeArgs},
    client,
    config::RelayConfig,
    server::Server,
};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = RelayConfig::from(&args);
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let server = Server::new(listener, config);

    // tests/e2e.rs reads the bound address from the end of this line.
    info!("relay listening on {}", server.local_addr()?);
    server
        .run_until_ctrl_c()
        .await
        .inspect_err(|err| warn!("relay exited with error: {err:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Client(args) => client::run(args).await,
    }
}
