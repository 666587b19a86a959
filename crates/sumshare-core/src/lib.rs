//! # Sumshare Core
//!
//! Protocol core for computing the sum of N private integers with n-out-of-n
//! additive secret sharing.
//!
//! This crate provides:
//! - Share generation and summation ([`shares`])
//! - The coordinator session ([`coordinator`])
//! - The participant session ([`participant`])
//! - The secure channel seam and an in-memory channel ([`channel`])
//!
//! ## Protocol Overview
//!
//! 1. Every participant registers its address with the coordinator.
//! 2. Once N participants are registered, the coordinator sends each one the
//!    addresses of the other N-1.
//! 3. Each participant splits its secret into N shares, keeps one and sends
//!    one to every peer.
//! 4. After holding exactly N shares, a participant reports their sum.
//! 5. The coordinator adds the N reports; the result equals the sum of all
//!    secrets.
//!
//! Shares are plain bounded integers, not field elements, so a share leaks
//! magnitude information about the secret it came from.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sumshare_core::{Coordinator, CoordinatorConfig};
//!
//! let coordinator = Coordinator::new(config, channel)?;
//! let sum = coordinator.wait_for_aggregate().await?;
//! ```

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod participant;
pub mod shares;
pub mod types;

pub use channel::{DeliveryFailure, DeliveryOutcome, RequestHandler, SecureChannel};
pub use config::{CoordinatorConfig, RetryPolicy, SessionConfig};
pub use coordinator::{Coordinator, CoordinatorPhase};
pub use error::{Error, Result};
pub use participant::{Participant, ParticipantPhase};
pub use types::{Address, Message, MessageKind, ParticipantRecord};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of participants
pub const DEFAULT_PARTICIPANTS: usize = 3;

/// Default upper bound for shares (secrets are drawn below `bound / N`)
pub const DEFAULT_BOUND_MAX: i64 = 300;
