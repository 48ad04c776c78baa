use anyhow::Context;
use clap::Parser;
use relaymesh::api::{create_api_server, ApiState};
use relaymesh::config::EngineConfig;
use relaymesh::coordinator::MessageCoordinator;
use relaymesh::metrics::start_metrics_server;
use relaymesh::scheduler::{Maintenance, Scheduler};
use relaymesh::store::Store;
use relaymesh::transport::WsPeerHub;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Relay selection and message lifecycle server
#[derive(Parser, Debug)]
#[command(name = "relaymesh-server", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "RELAYMESH_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address, overrides `api.bind`
    #[arg(long, env = "RELAYMESH_BIND")]
    bind: Option<SocketAddr>,

    /// sqlx database url, overrides `store.database_url`
    #[arg(long, env = "RELAYMESH_DATABASE_URL")]
    database_url: Option<String>,

    /// This instance's node id on the mesh, overrides `peer.local_peer`
    #[arg(long, env = "RELAYMESH_LOCAL_PEER")]
    local_peer: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "relaymesh=info,tower_http=info")]
    log_level: String,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default().validated()?,
    };
    if let Some(bind) = args.bind {
        config.api.bind = bind;
    }
    if let Some(url) = args.database_url {
        config.store.database_url = url;
    }
    if let Some(peer) = args.local_peer {
        config.peer.local_peer = peer;
    }
    let config = config.validated()?;

    if args.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    if config.metrics.enabled {
        start_metrics_server(&config.metrics).context("Failed to start metrics exporter")?;
    }

    let store = Store::connect(&config.store)
        .await
        .with_context(|| format!("Failed to open store at {}", config.store.database_url))?;
    info!(database_url = %config.store.database_url, "store ready");

    let hub = WsPeerHub::new();
    let coordinator = MessageCoordinator::new(config.clone(), store.clone(), Arc::new(hub.clone()));
    info!(local_peer = coordinator.local_peer(), "peer identity set");

    let scheduler = config
        .scheduler
        .enabled
        .then(|| Scheduler::spawn(Maintenance::new(coordinator.clone()), &config.scheduler));

    let state = ApiState::new(coordinator, hub, &config.api);
    let app = create_api_server(state);

    let listener = tokio::net::TcpListener::bind(config.api.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.api.bind))?;

    println!("\n╔══════════════════════════════════════════════════════════════════╗");
    println!("║                 relaymesh - relay engine server                  ║");
    println!("╚══════════════════════════════════════════════════════════════════╝\n");
    println!("  Server Address:  http://{}", config.api.bind);
    println!("  Health Check:    http://{}/health", config.api.bind);
    println!("  REST API:        http://{}/api/v1", config.api.bind);
    println!("  Peer WebSocket:  ws://{}/ws/:peer_id", config.api.bind);
    match config.metrics.listen_addr {
        Some(addr) if config.metrics.enabled => println!("  Metrics:         http://{addr}/metrics"),
        _ => println!("  Metrics:         http://{}/metrics", config.api.bind),
    }
    println!("\n  Press Ctrl+C to stop the server\n");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    store.close().await;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
