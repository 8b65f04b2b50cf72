//! meshgate - main entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::sync::{mpsc, watch, RwLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use meshgate::{
    config::Config,
    forwarder::Forwarder,
    health::HealthProber,
    oracle::{Discovery, OracleClient, TopologyCache},
    registry::{NodeRegistry, NodeSeed},
    relay::WorkerRelay,
    router::RetryCoordinator,
    selector::CandidateSelector,
    server::{auth::ClientAuth, build_router, AppState},
    usage::UsageTracker,
};

#[derive(Parser, Debug)]
#[command(name = "meshgate")]
#[command(about = "Inference gateway routing OpenAI-compatible requests across a worker mesh")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080", env = "MESHGATE_LISTEN")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("meshgate=debug,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    tracing::info!(model = %config.default_model, "Starting meshgate");

    let registry = Arc::new(NodeRegistry::new(config.allow_private_ips));
    let relay = Arc::new(WorkerRelay::new(&config.timeouts));
    let topology: TopologyCache = Arc::new(RwLock::new(None));

    let selector = Arc::new(CandidateSelector::new(
        Arc::clone(&registry),
        Arc::clone(&relay),
        Arc::clone(&topology),
    ));
    let forwarder = Arc::new(Forwarder::new(
        Arc::clone(&relay),
        Arc::clone(&registry),
        &config.timeouts,
    ));
    let usage = Arc::new(UsageTracker::new(config.timeouts.stale_aggregate));
    let coordinator = Arc::new(RetryCoordinator::new(
        selector,
        forwarder,
        Arc::clone(&registry),
        Arc::clone(&usage),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (probe_tx, probe_rx) = mpsc::channel::<String>(64);

    // Seed static nodes and queue their first probe.
    for url in &config.static_node_urls {
        match registry.upsert(url, NodeSeed::default()).await {
            Ok(_) => {
                let _ = probe_tx.send(url.clone()).await;
            }
            Err(e) => tracing::warn!(url = %url, "Skipping static node: {e}"),
        }
    }

    let prober = HealthProber::new(Arc::clone(&registry), config.timeouts.health_probe);
    tokio::spawn(prober.run(
        config.timeouts.health_interval,
        probe_rx,
        shutdown_rx.clone(),
    ));

    if let Some(oracle_url) = &config.oracle_url {
        let oracle = Arc::new(OracleClient::new(oracle_url));
        tracing::info!(oracle = %oracle_url, "Oracle discovery enabled");

        let discovery = Discovery::new(
            Arc::clone(&oracle),
            Arc::clone(&registry),
            Arc::clone(&topology),
            config.default_model.clone(),
            probe_tx.clone(),
        );
        tokio::spawn(discovery.run(config.timeouts.discovery_interval, shutdown_rx.clone()));

        tokio::spawn(Arc::clone(&usage).run(
            oracle,
            config.timeouts.usage_report,
            shutdown_rx.clone(),
        ));
    }

    tokio::spawn(Arc::clone(&relay).run_ping_loop(config.timeouts.worker_ping, shutdown_rx));

    if config.free_api_tokens.is_empty() && config.pro_api_tokens.is_empty() {
        tracing::warn!("No API tokens configured, running open (all callers pro tier)");
    }
    let state = Arc::new(AppState {
        auth: ClientAuth::new(&config),
        config,
        registry,
        relay: Arc::clone(&relay),
        coordinator,
        started_at: Instant::now(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!(addr = %args.listen, "Gateway listening");

    // The relay's sockets are long-lived; they must be closed inside the
    // shutdown future or graceful shutdown never completes.
    let relay_for_shutdown = Arc::clone(&relay);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            relay_for_shutdown.shutdown().await;
        })
        .await?;

    tracing::info!("Goodbye");
    Ok(())
}
