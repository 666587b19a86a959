//! Sumshare Participant
//!
//! Holds one private value, registers with the coordinator, exchanges
//! additive shares with its peers and reports their sum.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sumshare_channel::{load_tls, router, serve, serve_tls};
use sumshare_channel_client::HttpChannel;
use sumshare_core::{Address, Participant, ParticipantPhase, RetryPolicy, SessionConfig};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sumshare participant CLI arguments
#[derive(Parser, Debug)]
#[command(name = "sumshare-participant")]
#[command(about = "Participant in a private N-party sum")]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(short, long, env = "SUMSHARE_LISTEN", default_value = "127.0.0.1:8081")]
    listen: String,

    /// Address peers and the coordinator use to reach this participant
    #[arg(short, long, env = "SUMSHARE_ADDRESS", default_value = "http://127.0.0.1:8081")]
    address: Address,

    /// Coordinator address
    #[arg(short, long, env = "SUMSHARE_COORDINATOR", default_value = "http://127.0.0.1:8080")]
    coordinator: Address,

    /// Number of participants
    #[arg(short = 't', long, env = "SUMSHARE_PARTICIPANTS", default_value_t = sumshare_core::DEFAULT_PARTICIPANTS)]
    participants: usize,

    /// Exclusive upper bound for random shares
    #[arg(short, long, env = "SUMSHARE_BOUND_MAX", default_value_t = sumshare_core::DEFAULT_BOUND_MAX)]
    bound_max: i64,

    /// Fixed secret instead of a random one
    #[arg(long, env = "SUMSHARE_SECRET")]
    secret: Option<i64>,

    /// Extra PEM root certificate to trust
    #[arg(long, env = "SUMSHARE_CA_CERT")]
    ca_cert: Option<PathBuf>,

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

fn channel(args: &Args) -> Result<HttpChannel> {
    let channel = match &args.ca_cert {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            HttpChannel::with_root_certificate(args.address.clone(), &pem)?
        }
        None => HttpChannel::new(args.address.clone())?,
    };
    Ok(channel.with_timeout(Duration::from_millis(args.retry_timeout_ms)))
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
    let config = SessionConfig::new(
        args.participants,
        args.bound_max,
        args.address.clone(),
        args.coordinator.clone(),
    )?
    .with_retry(retry);

    let channel = Arc::new(channel(&args)?);
    let participant = Arc::new(match args.secret {
        Some(secret) => Participant::with_secret(config, channel, secret)?,
        None => Participant::new(config, channel)?,
    });

    info!(
        listen = %args.listen,
        address = %args.address,
        coordinator = %args.coordinator,
        participants = args.participants,
        bound_max = args.bound_max,
        "Starting participant"
    );
    debug!(secret = participant.secret(), "Secret chosen");

    // Listen before registering so the peer set cannot arrive unannounced.
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
    let app = router("participant", participant.clone());
    let stopped = async {
        let _ = shutdown_rx.await;
    };
    let server = match tls {
        Some(tls) => tokio::spawn(serve_tls(listener, app, tls, stopped)),
        None => tokio::spawn(serve(listener, app, stopped)),
    };

    if let Err(e) = participant.register().await {
        let _ = shutdown_tx.send(());
        server.await??;
        return Err(e).context("Registration failed");
    }

    let phase = tokio::select! {
        phase = participant.wait_until_settled() => phase,
        _ = tokio::signal::ctrl_c() => {
            let phase = participant.phase();
            warn!(phase = ?phase, held = participant.shares_held().await, "Interrupted");
            phase
        }
    };

    for failed in participant
        .join_deliveries()
        .await
        .into_iter()
        .filter(|o| !o.is_delivered())
    {
        error!(to = %failed.to, kind = %failed.kind, "Delivery abandoned");
    }

    let _ = shutdown_tx.send(());
    server.await??;

    match phase {
        ParticipantPhase::Reported { aggregate } => {
            info!(aggregate, "Reported aggregate to coordinator");
            Ok(())
        }
        ParticipantPhase::Failed { reason } => anyhow::bail!("Session failed: {}", reason),
        other => anyhow::bail!("Session did not complete: {:?}", other),
    }
}
