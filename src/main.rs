use clap::Parser;
use iflow_proxy::config::config_search_paths;
use iflow_proxy::server::shutdown_signal;
use iflow_proxy::upstream::iflow::{IflowConnector, IflowSettings};
use iflow_proxy::{build_router, AppState, ProxyConfig, SharedLogger, UpstreamAdapter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "iflow-proxy",
    about = "OpenAI-compatible chat completions API in front of iFlow",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Request log file path
    #[arg(long, default_value = "iflow-proxy.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iflow_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    // Fail fast on missing secrets.
    let auth_token = config.resolve_auth_token()?;
    let settings = IflowSettings::from_config(&config)?;

    let logger = SharedLogger::new(&cli.log_file)?;

    info!("iflow-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Upstream:  {} (model {})", settings.base_url, settings.model);
    info!("  Listen:    http://{}/v1", config.bind_addr());
    info!("  Health:    http://{}/health", config.bind_addr());
    info!("  Log file:  {}", cli.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting iflow-proxy upstream={} bind={}",
            settings.base_url,
            config.bind_addr()
        ),
    );

    let adapter = Arc::new(UpstreamAdapter::new(Arc::new(IflowConnector::new(settings))));
    adapter.initialize().await?;

    let state = Arc::new(AppState {
        adapter: Arc::clone(&adapter),
        auth_token,
        require_user_message: config.validation.require_user_message,
        logger: logger.clone(),
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal()?)
        .await?;

    info!("Shutting down");
    if let Err(e) = adapter.close().await {
        warn!(error = %e, "Failed to close upstream connection");
    }
    logger.info("shutdown", "iflow-proxy stopped");

    Ok(())
}
