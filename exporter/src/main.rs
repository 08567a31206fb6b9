use netatmo_exporter::collector::Collector;
use netatmo_exporter::config::Config;
use netatmo_exporter::metrics;
use netatmo_exporter::oauth::OAuthClient;
use netatmo_exporter::registry::MetricRegistry;
use netatmo_exporter::server::{self, AppState};
use netatmo_exporter::telemetry::TelemetryClient;
use netatmo_exporter::token::{CredentialPersister, FilePersister, NoopPersister, TokenStore};

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    info!("Starting Netatmo exporter v{}", env!("CARGO_PKG_VERSION"));
    info!("Refresh interval: {:?}", config.poll_interval());
    info!("HTTP timeout: {:?}", config.http_timeout());
    info!("Token URL: {}", config.token_url);
    info!("API URL: {}", config.api_url);

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register exporter metrics: {}", e);
        std::process::exit(1);
    }

    let oauth = match OAuthClient::new(config.oauth_settings(), config.http_timeout()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build identity client: {}", e);
            std::process::exit(1);
        }
    };
    let telemetry = match TelemetryClient::new(config.api_url.clone(), config.http_timeout()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build telemetry client: {}", e);
            std::process::exit(1);
        }
    };

    let persister: Box<dyn CredentialPersister> = match &config.token_file {
        Some(path) => {
            info!("Persisting credentials to {}", path.display());
            Box::new(FilePersister::new(path))
        }
        None => Box::new(NoopPersister),
    };
    let tokens = match TokenStore::load(oauth.clone(), persister, config.refresh_token.clone()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to load credentials: {}", e);
            std::process::exit(1);
        }
    };

    let registry = match MetricRegistry::new() {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Failed to create metric registry: {}", e);
            std::process::exit(1);
        }
    };

    let collector = Collector::new(tokens.clone(), telemetry, registry.clone());
    let period = config.poll_interval();
    let collector_handle = tokio::spawn(collector.run(period));

    let app = server::create_router(AppState::new(registry, tokens, oauth));

    let http_addr = config.listen_socket();
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = collector_handle => {
            error!("Collector task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}
