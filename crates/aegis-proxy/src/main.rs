//! Aegis Proxy
//!
//! Transparent policy enforcement between MCP clients and their tool
//! servers. Every request is intercepted, enriched, judged against the
//! active policies, and enforced before anything reaches an upstream.

use aegis_proxy::{build_state, http, stdio, AegisConfig};
use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "aegis-proxy")]
#[command(about = "MCP policy enforcement proxy", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "aegis.yaml")]
    config: String,

    /// Listen address
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    listen: String,

    /// Listen port (overrides config and PORT)
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Policy store directory (overrides config)
    #[arg(long)]
    policies: Option<String>,

    /// Upstream config file (overrides config)
    #[arg(short, long)]
    upstreams: Option<String>,

    /// Also serve MCP over stdin/stdout
    #[arg(long)]
    stdio: bool,

    /// Agent identity for the stdio client
    #[arg(long, default_value = "stdio-client")]
    stdio_agent: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!("Starting Aegis proxy");

    let mut config = AegisConfig::load(std::path::Path::new(&cli.config))?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(policies) = &cli.policies {
        config.policy_store_path = policies.into();
    }
    if let Some(upstreams) = &cli.upstreams {
        config.upstream_config = Some(upstreams.into());
    }
    info!(
        policies = %config.policy_store_path.display(),
        port = config.port,
        "configuration loaded"
    );

    let metrics_handle = aegis_telemetry::init_metrics()
        .map_err(|e| anyhow::anyhow!("metrics init failed: {}", e))?;

    let state = build_state(config.clone()).await?;
    info!(
        upstreams = state.upstreams.names().len(),
        "proxy state initialized"
    );

    if cli.stdio {
        let stdio_state = state.clone();
        let agent = cli.stdio_agent.clone();
        tokio::spawn(async move {
            if let Err(e) = stdio::serve(stdio_state, agent).await {
                warn!("stdio transport ended with error: {}", e);
            }
        });
    }

    let addr: SocketAddr = format!("{}:{}", cli.listen, config.port).parse()?;
    let app = http::router(http::HttpState {
        proxy: state,
        metrics: metrics_handle,
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("shutdown signal received, stopping server");
}

/// Initialize tracing from the environment, `-v` forces debug
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("aegis=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aegis=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
