//! speql-server — async HTTP/SSE edge, concurrency kernel, and pipeline
//! orchestrator binary.
//!
//! Wires together the warehouse/LLM transports, the [`orchestrator::Core`],
//! the background worker, and the two HTTP routers (main port + control
//! port), per `spec.md` §6.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use speql::Config;

use speql_server::llm_client::{self, ReqwestLlm};
use speql_server::warehouse_client::{self, PgWarehouse};
use speql_server::{error, orchestrator, persistence};

/// Command-line flags, layered over an optional TOML config file: flags and
/// `SPEQL_*` environment variables win over the file, which wins over
/// [`Config::default`].
#[derive(Debug, Parser)]
#[command(name = "speql-server", version, about = "Speculative SQL assistant server")]
struct Cli {
    /// Path to a TOML config file (see `speql::config::Config`).
    #[arg(long, env = "SPEQL_CONFIG")]
    config: Option<PathBuf>,

    /// Main HTTP/SSE port. Overrides the config file's `port`.
    #[arg(long, env = "SPEQL_PORT")]
    port: Option<u16>,

    /// Postgres warehouse connection string.
    #[arg(long, env = "SPEQL_WAREHOUSE_URL")]
    warehouse_url: String,

    /// LLM chat-completions endpoint.
    #[arg(long, env = "SPEQL_LLM_ENDPOINT")]
    llm_endpoint: String,

    /// LLM API key.
    #[arg(long, env = "SPEQL_LLM_API_KEY")]
    llm_api_key: String,
}

fn load_config(cli: &Cli) -> error::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Config::from_toml(&text).map_err(|e| error::ServerError::Config(e.to_string()))?
        }
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> error::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = load_config(&cli)?;
    std::fs::create_dir_all(&config.log_dir)?;

    let (pg_client, pg_connection) = tokio_postgres::connect(&cli.warehouse_url, tokio_postgres::NoTls)
        .await
        .map_err(|e| error::ServerError::Warehouse(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = pg_connection.await {
            tracing::error!(error = %e, "warehouse connection closed");
        }
    });

    let warehouse: Arc<dyn warehouse_client::WarehouseClient> = Arc::new(PgWarehouse::new(pg_client));
    let llm: Arc<dyn llm_client::LlmClient> = Arc::new(ReqwestLlm::new(
        cli.llm_endpoint.clone(),
        cli.llm_api_key.clone(),
    ));

    let main_port = config.port;
    let control_port = config.control_port();
    let persistence: Arc<dyn persistence::PersistenceSink> =
        Arc::new(persistence::FilePersistenceSink::new(config.log_dir.clone()));
    let core = orchestrator::Core::with_persistence(config, llm, warehouse, persistence);

    let background_core = Arc::clone(&core);
    let background_handle = tokio::spawn(speql_server::background::run(background_core));

    let main_addr = SocketAddr::from(([0, 0, 0, 0], main_port));
    let control_addr = SocketAddr::from(([0, 0, 0, 0], control_port));

    let main_listener = tokio::net::TcpListener::bind(main_addr).await?;
    let control_listener = tokio::net::TcpListener::bind(control_addr).await?;

    tracing::info!(%main_addr, %control_addr, "speql-server listening");

    let main_server = axum::serve(main_listener, speql_server::http::main_router(Arc::clone(&core)));
    let control_server = axum::serve(control_listener, speql_server::http::control_router(Arc::clone(&core)));

    tokio::select! {
        res = main_server => if let Err(e) = res { tracing::error!(error = %e, "main server exited"); },
        res = control_server => if let Err(e) = res { tracing::error!(error = %e, "control server exited"); },
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
    }

    background_handle.abort();
    Ok(())
}
