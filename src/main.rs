//! kv-swarm daemon.
//!
//! Hosts one node: the block pool and coordinators, the shard registry,
//! the background compression/balancing/prefetch cycles and the admin API.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use kv_swarm::config::{Cli, Config};
use kv_swarm::node::SwarmNode;
use kv_swarm::server::admin_api::build_router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "kv_swarm=debug,tower_http=debug"
    } else {
        "kv_swarm=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-swarm v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    info!(
        num_blocks = config.pool.num_blocks,
        block_size = config.pool.block_size,
        groups = config.cache_groups().len(),
        strategy = ?config.allocation.strategy,
        "Block pool configured"
    );
    info!(
        shard_size = config.sharding.shard_size,
        redundancy = config.sharding.redundancy,
        ranks = ?config.sharding.ranks,
        "Sharding configured"
    );

    let listen_addr = config.server.listen.clone();
    let node = Arc::new(SwarmNode::new(config)?);

    // Background cycles report into the metrics registry.
    let (report_tx, mut report_rx) = mpsc::channel(64);
    let tasks = node.spawn_background(report_tx);
    let reporter = {
        let node = node.clone();
        tokio::spawn(async move {
            while let Some(report) = report_rx.recv().await {
                debug!(?report, "Cycle finished");
                node.metrics.observe_cycle(&report);
            }
        })
    };

    let app = build_router(node.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    let shutdown = tasks.cancellation_token();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            _ = shutdown.cancelled() => {}
        }
    });
    if let Err(e) = serve.await {
        error!(error = %e, "HTTP server error");
    }

    tasks.shutdown().await;
    reporter.abort();
    info!("kv-swarm stopped");
    Ok(())
}
