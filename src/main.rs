//! Filament overlay router daemon.

mod cli;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use filament_config::Store;
use filament_frame::{FrameBuilder, FramePool};
use filament_peering::Peering;
use filament_router::{PingPongHandler, Router};
use filament_types::PeeringUrl;

use cli::{Cli, Commands};

/// How often unhealthy `router.connect` targets are redialed.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { config } => run_daemon(&config),
        Commands::Genconfig { output } => generate_config(output),
    }
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let store = Store::generate();
    match output {
        Some(path) => {
            store
                .save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "configuration written");
        }
        None => println!("{}", serde_json::to_string_pretty(&store)?),
    }
    Ok(())
}

fn run_daemon(config_path: &Path) -> Result<()> {
    let store = Store::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
    runtime.block_on(daemon(store))
}

async fn daemon(store: Store) -> Result<()> {
    let identity = store.private_key().context("reading identity")?;

    let builder = FrameBuilder::new(FramePool::new());
    let (frames_tx, frames_rx) = mpsc::channel(1024);
    let peering = Peering::new(identity.clone(), builder, frames_tx);

    let friends = store.friend_addrs().context("reading friends")?;
    let router = Router::new(&identity, peering.clone(), store.router.isolate, friends);
    let ping_pong = PingPongHandler::new(&router);
    router.register_ping_handler(ping_pong);

    info!(
        address = %router.address(),
        key = %identity.public_key(),
        "router identity ready"
    );

    for url in store.listen_urls().context("reading listen URLs")? {
        peering
            .listen(&url)
            .await
            .with_context(|| format!("listening on {url}"))?;
    }

    for url in store.bootstrap_urls().context("reading bootstrap URLs")? {
        if let Err(err) = peering.connect(&url).await {
            warn!(url = %url, err = %err, "bootstrap dial failed");
        }
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let connect_urls = store.connect_urls().context("reading connect URLs")?;
    if !connect_urls.is_empty() {
        tokio::spawn(maintain_connections(
            peering.clone(),
            connect_urls,
            shutdown_tx.subscribe(),
        ));
    }

    let router_task = tokio::spawn(router.clone().run(frames_rx, shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    let _ = shutdown_tx.send(());
    peering.shutdown();
    let _ = router_task.await;
    Ok(())
}

/// Keep an outbound link to every configured `router.connect` target.
async fn maintain_connections(
    peering: Arc<Peering>,
    urls: Vec<PeeringUrl>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(RECONNECT_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => return,
        }

        for url in &urls {
            let connected = peering
                .links()
                .iter()
                .any(|link| link.outgoing() && link.peering_url() == url);
            if connected {
                continue;
            }
            match peering.connect(url).await {
                Ok(link) => info!(url = %url, peer = %link.peer(), "outbound link established"),
                Err(err) => warn!(url = %url, err = %err, "outbound dial failed"),
            }
        }
    }
}
