use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::Parser;
use portcullis::{
    config::ProxyConfig,
    observability,
    pipeline::{DecisionEngine, HandlerRegistry},
    routes::{self, AppState},
};

/// CLI arguments for portcullis
#[derive(Parser, Debug)]
#[command(version, about = "Access-control decision service", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./portcullis.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the decision server (default)
    Serve,
    /// Load the configuration and rules, validate them, and exit
    Validate,
}

const DEFAULT_CONFIG_PATH: &str = "portcullis.toml";

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match args.command {
        Some(Command::Validate) => run_validate(&config_path),
        Some(Command::Serve) | None => run_server(&config_path).await,
    }
}

fn load_config(config_path: &Path) -> ProxyConfig {
    match ProxyConfig::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            );
            std::process::exit(1);
        }
    }
}

fn build_engine(config: &mut ProxyConfig) -> Result<DecisionEngine, String> {
    let handlers = HandlerRegistry::with_defaults(reqwest::Client::new())
        .map_err(|e| format!("Failed to initialize handlers: {e}"))?;
    let engine = DecisionEngine::from_config(config, handlers);
    engine
        .validate_rules()
        .map_err(|e| format!("Invalid rules: {e}"))?;
    Ok(engine)
}

fn run_validate(config_path: &Path) {
    let mut config = load_config(config_path);
    match build_engine(&mut config) {
        Ok(engine) => {
            println!(
                "{}: OK ({} rules)",
                config_path.display(),
                engine.rules().len()
            );
        }
        Err(e) => {
            eprintln!("{}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    }
}

async fn run_server(config_path: &Path) {
    let mut config = load_config(config_path);

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    tracing::info!(config_file = %config_path.display(), "Starting decision service");

    let engine = match build_engine(&mut config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "Refusing to start");
            std::process::exit(1);
        }
    };
    tracing::info!(rules = engine.rules().len(), "Rules loaded");

    let app = routes::build_app(&config.server, AppState::new(Arc::new(engine)));

    let bind_addr = config.server.bind_addr();
    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %bind_addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!("Server listening on http://{}", bind_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
