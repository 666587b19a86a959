//! Core types and wire payloads

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Endpoint identifier of a node (a base URL in the HTTP binding)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Create a new address, dropping any trailing `/`
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self(address.trim_end_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address::new(value)
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Address::new(value)
    }
}

impl FromStr for Address {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Address::new(s))
    }
}

/// A registered participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// Listener address of the participant
    pub address: Address,
    /// 0-based position in registration order
    pub ordinal: usize,
}

impl ParticipantRecord {
    pub fn new(address: Address, ordinal: usize) -> Self {
        Self { address, ordinal }
    }
}

/// Registration payload: `{address}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub address: Address,
}

/// Peer-set broadcast payload: `{peers}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSetBroadcast {
    pub peers: Vec<Address>,
}

/// Share delivery and aggregate report payload: `{share}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareMessage {
    pub share: i64,
}

/// Kind of protocol request, one per route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Participant → coordinator
    Register,
    /// Coordinator → participant
    PeerSet,
    /// Participant → participant
    Share,
    /// Participant → coordinator
    Report,
}

impl MessageKind {
    /// Route path in the HTTP binding
    pub const fn path(self) -> &'static str {
        match self {
            MessageKind::Register => "/v1/register",
            MessageKind::PeerSet => "/v1/peers",
            MessageKind::Share => "/v1/shares",
            MessageKind::Report => "/v1/report",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Register => "registration",
            MessageKind::PeerSet => "peer set",
            MessageKind::Share => "share",
            MessageKind::Report => "aggregate report",
        };
        f.write_str(name)
    }
}

/// Protocol request exchanged over a [`SecureChannel`](crate::SecureChannel)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Register(Registration),
    PeerSet(PeerSetBroadcast),
    Share(ShareMessage),
    Report(ShareMessage),
}

impl Message {
    pub fn register(address: Address) -> Self {
        Message::Register(Registration { address })
    }

    pub fn peer_set(peers: Vec<Address>) -> Self {
        Message::PeerSet(PeerSetBroadcast { peers })
    }

    pub fn share(share: i64) -> Self {
        Message::Share(ShareMessage { share })
    }

    pub fn report(share: i64) -> Self {
        Message::Report(ShareMessage { share })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Register(_) => MessageKind::Register,
            Message::PeerSet(_) => MessageKind::PeerSet,
            Message::Share(_) => MessageKind::Share,
            Message::Report(_) => MessageKind::Report,
        }
    }

    /// Encode the payload as a JSON document
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Message::Register(body) => serde_json::to_vec(body)?,
            Message::PeerSet(body) => serde_json::to_vec(body)?,
            Message::Share(body) | Message::Report(body) => serde_json::to_vec(body)?,
        };
        Ok(bytes)
    }

    /// Decode a JSON payload received on the route for `kind`
    pub fn decode(kind: MessageKind, bytes: &[u8]) -> Result<Self> {
        fn parse<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
            serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
        }

        let message = match kind {
            MessageKind::Register => Message::Register(parse(bytes)?),
            MessageKind::PeerSet => Message::PeerSet(parse(bytes)?),
            MessageKind::Share => Message::Share(parse(bytes)?),
            MessageKind::Report => Message::Report(parse(bytes)?),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalization() {
        let a = Address::new("https://localhost:8081/");
        let b: Address = "https://localhost:8081".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "https://localhost:8081");
    }

    #[test]
    fn test_payload_shapes() {
        let register = Message::register(Address::new("http://127.0.0.1:8081"));
        assert_eq!(
            register.encode().unwrap(),
            br#"{"address":"http://127.0.0.1:8081"}"#.to_vec()
        );

        let report = Message::report(-42);
        assert_eq!(report.encode().unwrap(), br#"{"share":-42}"#.to_vec());

        let peers = Message::decode(MessageKind::PeerSet, br#"{"peers":["a","b"]}"#).unwrap();
        assert_eq!(peers, Message::peer_set(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn test_malformed_payload() {
        let err = Message::decode(MessageKind::Share, br#"{"share":"ten"}"#).unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));

        let err = Message::decode(MessageKind::Register, b"not json").unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
    }
}
