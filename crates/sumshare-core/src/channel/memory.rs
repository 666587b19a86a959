//! In-memory channel implementation for testing

use super::{async_trait, RequestHandler, SecureChannel};
use crate::{Address, Error, Message, MessageKind, Result};
use dashmap::{DashMap, DashSet};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

/// Shared routing table connecting in-memory endpoints
///
/// Requests are encoded and decoded like on the wire, then handed to the
/// destination's handler directly. Endpoints are held weakly so sessions
/// owning a channel into the hub do not keep themselves alive.
#[derive(Clone, Default)]
pub struct MemoryHub {
    /// Bound endpoints: address -> handler
    endpoints: Arc<DashMap<Address, Weak<dyn RequestHandler>>>,
    /// Routes that fail with a transport error
    blocked: Arc<DashSet<(Address, MessageKind)>>,
    /// Accepted requests per kind
    delivered: Arc<DashMap<MessageKind, AtomicUsize>>,
    /// Upper bound of a random delay before each delivery
    jitter: Option<Duration>,
}

impl MemoryHub {
    /// Create a new in-memory hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every delivery by a random amount up to `max`
    pub fn with_jitter(mut self, max: Duration) -> Self {
        self.jitter = Some(max);
        self
    }

    /// Create the outbound channel of the endpoint at `local`
    pub fn channel(&self, local: impl Into<Address>) -> MemoryChannel {
        MemoryChannel {
            hub: self.clone(),
            local: local.into(),
        }
    }

    /// Route requests for `address` to `handler`
    pub fn bind<H: RequestHandler + 'static>(&self, address: impl Into<Address>, handler: &Arc<H>) {
        let weak: Weak<dyn RequestHandler> = Arc::downgrade(handler) as Weak<dyn RequestHandler>;
        self.endpoints.insert(address.into(), weak);
    }

    /// Make every `kind` request to `address` fail as unreachable
    pub fn block(&self, address: impl Into<Address>, kind: MessageKind) {
        self.blocked.insert((address.into(), kind));
    }

    /// Number of accepted requests of `kind`
    pub fn delivered(&self, kind: MessageKind) -> usize {
        self.delivered
            .get(&kind)
            .map(|count| count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn endpoint(&self, address: &Address) -> Option<Arc<dyn RequestHandler>> {
        self.endpoints.get(address).and_then(|entry| entry.upgrade())
    }

    fn record(&self, kind: MessageKind) {
        self.delivered
            .entry(kind)
            .or_default()
            .fetch_add(1, Ordering::SeqCst);
    }
}

/// Outbound side of one in-memory endpoint
#[derive(Clone)]
pub struct MemoryChannel {
    hub: MemoryHub,
    local: Address,
}

#[async_trait]
impl SecureChannel for MemoryChannel {
    fn local_address(&self) -> &Address {
        &self.local
    }

    async fn send(&self, to: &Address, message: &Message) -> Result<()> {
        if let Some(max) = self.hub.jitter {
            let micros = rand::thread_rng().gen_range(0..=max.as_micros() as u64);
            tokio::time::sleep(Duration::from_micros(micros)).await;
        }

        let kind = message.kind();
        if self.hub.blocked.contains(&(to.clone(), kind)) {
            return Err(Error::Transport(format!("{} is unreachable", to)));
        }

        let handler = self
            .hub
            .endpoint(to)
            .ok_or_else(|| Error::Transport(format!("No listener at {}", to)))?;

        if !handler.accepts().contains(&kind) {
            return Err(Error::Rejected {
                status: 404,
                message: format!("{} does not accept {}", to, kind),
            });
        }

        let decoded = Message::decode(kind, &message.encode()?)?;

        match handler.handle(self.local.clone(), decoded).await {
            Ok(()) => {
                self.hub.record(kind);
                Ok(())
            }
            Err(e @ Error::ProtocolViolation(_)) => Err(Error::Rejected {
                status: 409,
                message: e.to_string(),
            }),
            Err(e @ Error::Deserialization(_)) => Err(Error::Rejected {
                status: 400,
                message: e.to_string(),
            }),
            Err(e @ Error::Overflow) => Err(Error::Rejected {
                status: 422,
                message: e.to_string(),
            }),
            Err(e) => Err(Error::Transport(e.to_string())),
        }
    }
}

/// Endpoint that accepts and records every request of the given kinds
pub struct RecordingEndpoint {
    kinds: Vec<MessageKind>,
    received: Mutex<Vec<(Address, Message)>>,
}

impl RecordingEndpoint {
    pub fn new(kinds: &[MessageKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            received: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far, in arrival order
    pub async fn received(&self) -> Vec<(Address, Message)> {
        self.received.lock().await.clone()
    }
}

#[async_trait]
impl RequestHandler for RecordingEndpoint {
    fn accepts(&self) -> &[MessageKind] {
        &self.kinds
    }

    async fn handle(&self, from: Address, message: Message) -> Result<()> {
        self.received.lock().await.push((from, message));
        Ok(())
    }
}
