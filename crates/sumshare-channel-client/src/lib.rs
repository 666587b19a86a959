//! Sumshare Channel Client
//!
//! Sender side of the secure channel: each [`Message`] is posted to the
//! recipient's route for its kind, tagged with this node's address.

use sumshare_channel::SENDER_HEADER;
use sumshare_core::channel::{async_trait, SecureChannel};
use sumshare_core::{Address, Error, Message, Result};
use reqwest::{Certificate, Client, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument};

/// HTTP-based channel
pub struct HttpChannel {
    /// HTTP client
    client: Client,
    /// This node's address
    local: Address,
    /// Request timeout
    timeout: Duration,
}

impl HttpChannel {
    /// Create a channel trusting the platform's root certificates
    pub fn new(local: Address) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(Self::from_client(client, local))
    }

    /// Create a channel that additionally trusts the PEM certificate `pem`
    pub fn with_root_certificate(local: Address, pem: &[u8]) -> Result<Self> {
        let certificate = Certificate::from_pem(pem)
            .map_err(|e| Error::InvalidConfig(format!("Root certificate: {}", e)))?;
        let client = Client::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(Self::from_client(client, local))
    }

    fn from_client(client: Client, local: Address) -> Self {
        Self {
            client,
            local,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Map a non-success response onto the channel error taxonomy
fn classify(status: StatusCode, body: String) -> Error {
    if status.is_client_error() {
        Error::Rejected {
            status: status.as_u16(),
            message: body,
        }
    } else {
        Error::Transport(format!("Server answered {}: {}", status, body))
    }
}

#[async_trait]
impl SecureChannel for HttpChannel {
    fn local_address(&self) -> &Address {
        &self.local
    }

    #[instrument(skip(self, message), fields(kind = %message.kind()))]
    async fn send(&self, to: &Address, message: &Message) -> Result<()> {
        let body = message.encode()?;
        let url = format!("{}{}", to, message.kind().path());

        let response = self
            .client
            .post(&url)
            .header(SENDER_HEADER, self.local.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify(status, text));
        }

        debug!(to = %to, "Message delivered");
        Ok(())
    }
}
