use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use vertex_proxy::config::config_search_paths;
use vertex_proxy::credentials::token_source;
use vertex_proxy::logging::{init_tracing, LogLevel};
use vertex_proxy::{build_router, AppState, ProxyConfig, SharedLogger, VertexClient};

#[derive(Parser)]
#[command(
    name = "vertex-proxy",
    about = "Anthropic and OpenAI compatible gateway for Claude on Vertex AI",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// JSONL request log path (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Initial log level (overrides config and LOG_LEVEL)
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;
    config.apply_env()?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(path) = cli.log_file {
        config.log_file = Some(path);
    }

    let level_handle = init_tracing(config.log_level);

    config.validate()?;

    let logger = match config.log_file {
        Some(ref path) => SharedLogger::new(path, config.log_level)?,
        None => SharedLogger::in_memory(config.log_level),
    }
    .with_level_handle(level_handle);

    let endpoint = config.effective_endpoint();

    info!("vertex-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Endpoint:  {}", endpoint);
    info!("  Project:   {}", config.vertex.project_id);
    info!("  Region:    {}", config.vertex.region);
    info!("  Model:     {}", config.vertex.model);
    info!("  Port:      {}", config.port);
    info!("  Aliases:   {} configured", config.models.len());
    info!(
        "  Log file:  {}",
        config
            .log_file
            .as_ref()
            .map_or_else(|| "(memory only)".to_string(), |p| p.display().to_string())
    );

    logger.info(
        "startup",
        format!(
            "Starting vertex-proxy endpoint={} project={} region={} port={}",
            endpoint, config.vertex.project_id, config.vertex.region, config.port
        ),
    );

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()?;

    let tokens = token_source(&config.vertex);
    info!("  Credentials: {}", tokens.kind());

    let backend = VertexClient::new(client, &config, tokens, logger.clone());

    let port = config.port;
    let state = Arc::new(AppState::new(config, Arc::new(backend), logger));

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
