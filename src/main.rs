use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use device_auth::config::Config;
use device_auth::error_handling::{ErrorHandler, RetryConfig};
use device_auth::metrics::MetricsCollector;
use device_auth::pow::PowPuzzle;
use device_auth::pow_worker::PowWorker;
use device_auth::prometheus_metrics::PrometheusMetrics;
use device_auth::storage::FileKeyStorage;
use device_auth::{DeviceBackend, DeviceBootstrap, HttpBackend, KeyStore, RequestAuthenticator, verify_token};

#[derive(Parser, Debug)]
#[command(name = "device-auth", version, about = "Device identity, proof-of-work bootstrap and request signing")]
struct Cli {
    /// Backend base URL (overrides DEVICE_AUTH_BACKEND_URL)
    #[arg(long)]
    backend_url: Option<String>,

    /// Directory holding the device key record (overrides DEVICE_AUTH_KEY_DIR)
    #[arg(long)]
    key_dir: Option<PathBuf>,

    /// Proof-of-work difficulty in leading hex zeros (overrides DEVICE_AUTH_POW_DIFFICULTY)
    #[arg(long)]
    difficulty: Option<u32>,

    /// Print Prometheus metrics after the command
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the device key pair if absent and print the public JWK
    Keygen,
    /// Print the stored public JWK, if any
    ShowKey,
    /// Register this device with the backend and print the certificate
    Bootstrap,
    /// Sign a JSON payload and print the token and public key
    Authorize { payload: String },
    /// Check a token against the JSON payload it claims to cover
    Verify { token: String, payload: String },
    /// Solve a puzzle locally without contacting the backend
    Solve {
        initiation_nonce: String,
        device_public_key: String,
        #[arg(default_value_t = 2)]
        difficulty: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(url) = cli.backend_url.clone() {
        config.backend_url = url;
    }
    if let Some(dir) = cli.key_dir.clone() {
        config.key_dir = dir;
    }
    if let Some(difficulty) = cli.difficulty {
        config.pow_difficulty = difficulty;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("device_auth={},warn", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    config.validate()?;
    tracing::debug!(?config, "configuration loaded");

    let prometheus = Arc::new(PrometheusMetrics::new());
    let metrics = Arc::new(MetricsCollector::new().with_prometheus(Arc::clone(&prometheus)));

    let keystore = Arc::new(
        KeyStore::new(Arc::new(FileKeyStorage::new(config.key_dir.clone())))
            .with_key_id(config.key_id.clone())
            .with_metrics(Arc::clone(&metrics)),
    );
    let worker = PowWorker::new()
        .with_deadline(config.get_pow_deadline())
        .with_metrics(Arc::clone(&metrics));

    match cli.command {
        Command::Keygen => {
            let keys = keystore.get_or_create().await?;
            println!("{}", serde_json::to_string_pretty(&keys.public_key)?);
        }
        Command::ShowKey => {
            let keys = keystore.retrieve(keystore.key_id()).await?;
            match keys.public_key {
                Some(public_key) => println!("{}", serde_json::to_string_pretty(&public_key)?),
                None => println!("no device key stored under '{}'", keystore.key_id()),
            }
        }
        Command::Bootstrap => {
            config.require_bearer_token()?;
            let backend: Arc<dyn DeviceBackend> = Arc::new(HttpBackend::from_config(&config)?);
            let handler = ErrorHandler::new(Arc::clone(&metrics))
                .with_retry_config(RetryConfig::from_config(&config));

            let result = handler
                .execute_with_retry(|| {
                    let mut bootstrap = DeviceBootstrap::new(Arc::clone(&backend), Arc::clone(&keystore))
                        .with_difficulty(config.pow_difficulty)
                        .with_worker(worker.clone())
                        .with_metrics(Arc::clone(&metrics));
                    async move { bootstrap.run().await }
                })
                .await?;

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "certificate": result.certificate.as_str(),
                    "powNonce": result.solution.nonce,
                    "powHash": result.solution.hash,
                    "iterations": result.pow_iterations,
                    "elapsedMs": result.elapsed_ms,
                }))?
            );
        }
        Command::Authorize { payload } => {
            let payload: Value = serde_json::from_str(&payload).context("payload must be JSON")?;
            let authenticator = RequestAuthenticator::new(Arc::clone(&keystore))
                .with_metrics(Arc::clone(&metrics));
            let authorization = authenticator.authorize(&payload).await?;
            println!("{}", serde_json::to_string_pretty(&authorization)?);
        }
        Command::Verify { token, payload } => {
            let payload: Value = serde_json::from_str(&payload).context("payload must be JSON")?;
            let claims = verify_token(&token, &payload)?;
            println!("{}", serde_json::to_string_pretty(&claims)?);
        }
        Command::Solve { initiation_nonce, device_public_key, difficulty } => {
            let out = worker
                .solve(PowPuzzle { initiation_nonce, device_public_key, difficulty })
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "nonce": out.solution.nonce,
                    "hash": out.solution.hash,
                    "iterations": out.iterations,
                    "elapsedMs": out.elapsed_ms,
                }))?
            );
        }
    }

    if cli.metrics || config.metrics_enabled {
        print!("{}", prometheus.export_metrics()?);
    }

    Ok(())
}
