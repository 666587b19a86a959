//! Sumshare Channel Listener
//!
//! HTTP listener side of the secure channel. Each request kind a
//! [`RequestHandler`] accepts gets a `POST` route; the authenticated sender
//! travels in the [`SENDER_HEADER`] header. [`serve`] listens in plain HTTP,
//! [`serve_tls`] terminates TLS with a PEM certificate and key.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sumshare_core::{Address, Error, Message, MessageKind, RequestHandler};
use thiserror::Error as ThisError;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Header carrying the sender's address
pub const SENDER_HEADER: &str = "x-sumshare-sender";

/// How long in-flight TLS requests may finish after shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Listener error types
#[derive(Debug, ThisError)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Application state
#[derive(Clone)]
struct ListenerState {
    service: &'static str,
    handler: Arc<dyn RequestHandler>,
}

/// Build the router serving `handler`
pub fn router(service: &'static str, handler: Arc<dyn RequestHandler>) -> Router {
    let kinds: Vec<MessageKind> = handler.accepts().to_vec();
    let state = ListenerState { service, handler };

    let mut router = Router::new().route("/health", get(health));
    for kind in kinds {
        router = router.route(
            kind.path(),
            post(
                move |State(state): State<ListenerState>, headers: HeaderMap, body: Bytes| async move {
                    dispatch(state, kind, headers, body).await
                },
            ),
        );
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve `router` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address = listener.local_addr()?;
    info!(address = %address, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!(address = %address, "Listener stopped");
    Ok(())
}

/// Load a PEM certificate chain and private key for [`serve_tls`]
pub async fn load_tls(cert: &Path, key: &Path) -> Result<RustlsConfig> {
    Ok(RustlsConfig::from_pem_file(cert, key).await?)
}

/// Serve `router` over TLS until `shutdown` resolves
pub async fn serve_tls<F>(
    listener: TcpListener,
    router: Router,
    tls: RustlsConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address = listener.local_addr()?;
    let handle = Handle::new();
    let stopper = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        stopper.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    info!(address = %address, "Listening with TLS");

    axum_server::from_tcp_rustls(listener.into_std()?, tls)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;

    info!(address = %address, "Listener stopped");
    Ok(())
}

/// HTTP status for a handler error
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::ProtocolViolation(_) => StatusCode::CONFLICT,
        Error::Deserialization(_) => StatusCode::BAD_REQUEST,
        Error::Overflow => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Health check endpoint
async fn health(State(state): State<ListenerState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": state.service,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn dispatch(state: ListenerState, kind: MessageKind, headers: HeaderMap, body: Bytes) -> Response {
    let from = match headers.get(SENDER_HEADER).and_then(|v| v.to_str().ok()) {
        Some(value) if !value.is_empty() => Address::new(value),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Missing {} header", SENDER_HEADER),
            );
        }
    };

    let message = match Message::decode(kind, &body) {
        Ok(message) => message,
        Err(e) => {
            warn!(from = %from, kind = %kind, "Malformed request: {}", e);
            return error_response(status_for(&e), e.to_string());
        }
    };

    match state.handler.handle(from.clone(), message).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            warn!(from = %from, kind = %kind, "Request rejected: {}", e);
            error_response(status_for(&e), e.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
