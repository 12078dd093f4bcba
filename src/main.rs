use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use windowkeeper::config::{AppConfig, StoreBackend};
use windowkeeper::ratelimit::{Admission, Outcome, Policy, RateLimiter};
use windowkeeper::store::{MemoryStore, Store};

/// Admit keys read from stdin against a sliding window quota.
///
/// Each input line is `<key> [status]`. When a status is given the request is
/// finalized with it, which may uncount the hit.
#[derive(Parser, Debug)]
#[command(name = "windowkeeper", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Named route whose overrides apply
    #[arg(short, long)]
    route: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Decisions go to stdout, logs to stderr
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Windowkeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let limiter_config = config.limiter_for(args.route.as_deref());
    info!(
        route = ?args.route,
        window_ms = limiter_config.window_ms,
        limit = limiter_config.limit,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let store = build_store(&config, limiter_config.window_ms).await?;
    let limiter = Arc::new(RateLimiter::new(limiter_config, store)?);
    let policy = Policy::builder(limiter.clone())
        .key_fn(|key: &String| key.clone())
        .on_exceeded(|key: &String, decision| {
            info!(key = %key, count = decision.current_count, "Key over limit");
        })
        .build()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => handle_line(&policy, &line).await?,
                    None => break,
                }
            }
            _ = &mut shutdown => break,
        }
    }

    limiter.shutdown().await;
    info!("Windowkeeper stopped");
    Ok(())
}

async fn build_store(config: &AppConfig, window_ms: u64) -> anyhow::Result<Arc<dyn Store>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new(window_ms)?)),
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            use windowkeeper::store::{RedisBackend, RemoteStore};

            let url = config
                .store
                .redis_url
                .as_deref()
                .context("store.redis_url is required for the redis backend")?;
            let backend = RedisBackend::connect(url)
                .await
                .with_context(|| format!("Failed to connect to {}", url))?;
            info!(url = %url, prefix = %config.store.key_prefix, "Connected to redis");
            Ok(Arc::new(RemoteStore::new(
                backend,
                window_ms,
                config.store.key_prefix.clone(),
            )?))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => anyhow::bail!("built without the redis feature"),
    }
}

async fn handle_line(policy: &Policy<String>, line: &str) -> anyhow::Result<()> {
    let mut parts = line.split_whitespace();
    let Some(key) = parts.next() else {
        return Ok(());
    };
    let status = match parts.next() {
        Some(raw) => match raw.parse::<u16>() {
            Ok(status) => Some(status),
            Err(_) => {
                warn!(input = %raw, "Ignoring malformed status");
                None
            }
        },
        None => None,
    };

    let key = key.to_string();
    let admission = policy.admit(&key).await;
    let output = serde_json::json!({
        "key": key,
        "admitted": admission.is_admitted(),
        "enforced": !matches!(admission, Admission::Unenforced { .. }),
        "decision": admission.decision(),
    });
    println!("{}", output);

    if let (Some(status), Some(finalizer)) = (status, admission.into_finalizer()) {
        finalizer.finalize(Outcome::from_status(status)).await;
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
