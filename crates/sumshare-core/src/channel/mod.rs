//! Secure channel seam between nodes
//!
//! Transport security is the channel's concern; the protocol only needs a
//! point-to-point `send` and a handler for inbound requests, with the
//! sender's authenticated address attached.

use crate::{Address, Message, MessageKind, Result};

pub use ::async_trait::async_trait;

mod delivery;
mod retry;

/// In-memory channel for testing and local simulation
pub mod memory;

pub use delivery::{DeliveryFailure, DeliveryOutcome, DeliveryTracker};
pub use memory::{MemoryChannel, MemoryHub, RecordingEndpoint};
pub use retry::deliver;

/// Outbound side of the channel
#[async_trait]
pub trait SecureChannel: Send + Sync + 'static {
    /// Address the remote side sees as the sender
    fn local_address(&self) -> &Address;

    /// Send a request and wait for its acknowledgement
    ///
    /// Connection failures are [`Error::Transport`](crate::Error::Transport);
    /// a refusal by the remote handler is
    /// [`Error::Rejected`](crate::Error::Rejected).
    async fn send(&self, to: &Address, message: &Message) -> Result<()>;
}

/// Inbound side of the channel
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Request kinds this endpoint serves
    fn accepts(&self) -> &[MessageKind];

    /// Handle a request from an authenticated sender
    async fn handle(&self, from: Address, message: Message) -> Result<()>;
}
