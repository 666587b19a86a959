//! Sumshare Coordinator
//!
//! Registers N participants, hands each one its peer set and adds up their
//! aggregate reports into the global sum.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sumshare_channel::{load_tls, router, serve, serve_tls};
use sumshare_channel_client::HttpChannel;
use sumshare_core::{Address, Coordinator, CoordinatorConfig, RetryPolicy};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sumshare coordinator CLI arguments
#[derive(Parser, Debug)]
#[command(name = "sumshare-coordinator")]
#[command(about = "Coordinator for a private N-party sum")]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(short, long, env = "SUMSHARE_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,

    /// Address participants use to reach this coordinator
    #[arg(short, long, env = "SUMSHARE_ADDRESS", default_value = "http://127.0.0.1:8080")]
    address: Address,

    /// Number of participants
    #[arg(short = 't', long, env = "SUMSHARE_PARTICIPANTS", default_value_t = sumshare_core::DEFAULT_PARTICIPANTS)]
    participants: usize,

    /// Delivery attempts per message
    #[arg(long, env = "SUMSHARE_RETRY_ATTEMPTS", default_value_t = 5)]
    retry_attempts: u32,

    /// Initial backoff between attempts, in milliseconds
    #[arg(long, env = "SUMSHARE_RETRY_BACKOFF_MS", default_value_t = 200)]
    retry_backoff_ms: u64,

    /// Per-attempt timeout, in milliseconds
    #[arg(long, env = "SUMSHARE_RETRY_TIMEOUT_MS", default_value_t = 5_000)]
    retry_timeout_ms: u64,

    /// PEM certificate chain to serve TLS with
    #[arg(long, env = "SUMSHARE_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key matching --tls-cert
    #[arg(long, env = "SUMSHARE_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "SUMSHARE_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let retry = RetryPolicy::new(
        args.retry_attempts,
        Duration::from_millis(args.retry_backoff_ms),
        Duration::from_millis(args.retry_timeout_ms),
    )?;
    let config = CoordinatorConfig::new(args.participants, args.address.clone())?.with_retry(retry);

    info!(
        listen = %args.listen,
        address = %args.address,
        participants = args.participants,
        "Starting coordinator"
    );

    let channel = Arc::new(HttpChannel::new(args.address.clone())?);
    let coordinator = Arc::new(Coordinator::new(config, channel)?);

    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some(
            load_tls(cert, key)
                .await
                .with_context(|| format!("Failed to load {}", cert.display()))?,
        ),
        _ => None,
    };

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router("coordinator", coordinator.clone());
    let stopped = async {
        let _ = shutdown_rx.await;
    };
    let server = match tls {
        Some(tls) => tokio::spawn(serve_tls(listener, app, tls, stopped)),
        None => tokio::spawn(serve(listener, app, stopped)),
    };

    let outcome = tokio::select! {
        result = coordinator.wait_for_aggregate() => Some(result),
        _ = tokio::signal::ctrl_c() => {
            warn!(
                reports = coordinator.reports_received().await,
                "Interrupted before all reports arrived"
            );
            None
        }
    };

    for failed in coordinator
        .join_deliveries()
        .await
        .into_iter()
        .filter(|o| !o.is_delivered())
    {
        error!(to = %failed.to, kind = %failed.kind, "Peer set was never delivered");
    }

    let _ = shutdown_tx.send(());
    server.await??;

    if let Some(result) = outcome {
        let aggregate = result?;
        println!("Final value: {}", aggregate);
    }

    Ok(())
}
