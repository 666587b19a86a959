//! Participant session
//!
//! A participant holds one private value. After the coordinator hands it the
//! peer set it splits the value into N additive shares, keeps the last one,
//! sends one to every peer and, once it holds N shares, reports their sum.

mod received;

pub use received::ReceivedShares;

use crate::channel::{async_trait, deliver, DeliveryOutcome, DeliveryTracker, RequestHandler};
use crate::shares::{draw_secret, generate_shares};
use crate::{Address, Error, Message, MessageKind, Result, SecureChannel, SessionConfig};
use rand::rngs::OsRng;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of a participant session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantPhase {
    /// Registered, waiting for the coordinator's peer set
    AwaitingPeerSet,
    /// Shares dealt, collecting shares from peers
    Exchanging,
    /// All N shares held, aggregate report in flight
    Reporting { aggregate: i64 },
    /// Coordinator acknowledged the aggregate report
    Reported { aggregate: i64 },
    /// The aggregate report could not be delivered
    Failed { reason: String },
}

impl ParticipantPhase {
    /// Whether the session can make no further progress
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ParticipantPhase::Reported { .. } | ParticipantPhase::Failed { .. }
        )
    }
}

struct ExchangeState {
    peers: Option<Vec<Address>>,
    received: ReceivedShares,
}

/// Participant session state
pub struct Participant<C: SecureChannel> {
    config: SessionConfig,
    secret: i64,
    channel: Arc<C>,
    state: Mutex<ExchangeState>,
    phase: Arc<watch::Sender<ParticipantPhase>>,
    deliveries: DeliveryTracker,
}

impl<C: SecureChannel> Participant<C> {
    /// Create a participant with a secret drawn from `[0, bound / N)`
    pub fn new(config: SessionConfig, channel: Arc<C>) -> Result<Self> {
        let secret = draw_secret(&mut OsRng, config.bound_max, config.participant_count)?;
        Self::with_secret(config, channel, secret)
    }

    /// Create a participant holding `secret`
    pub fn with_secret(config: SessionConfig, channel: Arc<C>, secret: i64) -> Result<Self> {
        let limit = config.secret_limit();
        if !(0..limit).contains(&secret) {
            return Err(Error::InvalidConfig(format!(
                "Secret must lie in [0, {}), got {}",
                limit, secret
            )));
        }
        if channel.local_address() != &config.self_address {
            return Err(Error::InvalidConfig(format!(
                "Channel sends as {} but the participant is {}",
                channel.local_address(),
                config.self_address
            )));
        }

        let (phase, _) = watch::channel(ParticipantPhase::AwaitingPeerSet);

        Ok(Self {
            state: Mutex::new(ExchangeState {
                peers: None,
                received: ReceivedShares::new(config.participant_count),
            }),
            config,
            secret,
            channel,
            phase: Arc::new(phase),
            deliveries: DeliveryTracker::new(),
        })
    }

    pub fn address(&self) -> &Address {
        &self.config.self_address
    }

    pub fn secret(&self) -> i64 {
        self.secret
    }

    pub fn phase(&self) -> ParticipantPhase {
        self.phase.borrow().clone()
    }

    /// Number of shares held so far, own share included
    pub async fn shares_held(&self) -> usize {
        self.state.lock().await.received.len()
    }

    /// Register with the coordinator
    ///
    /// Uses the configured retry policy; exhausting it is returned as
    /// [`Error::Delivery`].
    #[instrument(skip(self), fields(participant = %self.config.self_address))]
    pub async fn register(&self) -> Result<()> {
        let message = Message::register(self.config.self_address.clone());
        deliver(
            self.channel.as_ref(),
            &self.config.coordinator_address,
            &message,
            &self.config.retry,
        )
        .await?;

        info!(
            coordinator = %self.config.coordinator_address,
            "Registered with coordinator"
        );
        Ok(())
    }

    /// Handle the peer set broadcast by the coordinator
    ///
    /// Deals the shares, retains the last one and dispatches one delivery
    /// per peer without waiting for them.
    #[instrument(skip(self, peers), fields(participant = %self.config.self_address))]
    pub async fn on_peer_set(&self, from: &Address, peers: Vec<Address>) -> Result<()> {
        if from != &self.config.coordinator_address {
            return Err(Error::violation(format!(
                "Peer set from {} instead of the coordinator",
                from
            )));
        }
        self.validate_peers(&peers)?;

        let sealed = {
            let mut state = self.state.lock().await;
            match &state.peers {
                Some(known) if known == &peers => {
                    debug!("Peer set resent, already dealt");
                    return Ok(());
                }
                Some(_) => return Err(Error::violation("Conflicting peer set")),
                None => {}
            }

            let n = self.config.participant_count;
            let mut shares = generate_shares(&mut OsRng, self.config.bound_max, self.secret, n)?;
            let kept = shares.pop().ok_or_else(|| Error::Internal("No share to keep".into()))?;

            for sender in state.received.retain_senders(&peers) {
                warn!(sender = %sender, "Discarding share from a sender outside the peer set");
            }

            let sealed = state.received.retain_own(kept)?;
            self.phase.send_replace(match sealed {
                Some(aggregate) => ParticipantPhase::Reporting { aggregate },
                None => ParticipantPhase::Exchanging,
            });

            info!(peers = peers.len(), "Received peer set, sending shares");

            // Dispatched under the lock so that no report can complete
            // before these deliveries are tracked.
            for (peer, share) in peers.iter().zip(shares) {
                self.deliveries
                    .dispatch(
                        self.channel.clone(),
                        peer.clone(),
                        Message::share(share),
                        self.config.retry.clone(),
                    )
                    .await;
            }

            state.peers = Some(peers);
            sealed
        };

        if let Some(aggregate) = sealed {
            self.report(aggregate).await;
        }

        Ok(())
    }

    /// Handle a share delivered by a peer
    #[instrument(skip(self, share), fields(participant = %self.config.self_address))]
    pub async fn on_share(&self, from: &Address, share: i64) -> Result<()> {
        if from == &self.config.self_address {
            return Err(Error::violation("Share addressed to self"));
        }
        if from == &self.config.coordinator_address {
            return Err(Error::violation("Share from the coordinator"));
        }

        let (held, sealed) = {
            let mut state = self.state.lock().await;
            if let Some(peers) = &state.peers {
                if !peers.contains(from) {
                    return Err(Error::violation(format!("{} is not a peer", from)));
                }
            }
            let sealed = state.received.insert(from.clone(), share)?;
            if let Some(aggregate) = sealed {
                self.phase
                    .send_replace(ParticipantPhase::Reporting { aggregate });
            }
            (state.received.len(), sealed)
        };

        debug!(
            from = %from,
            held,
            expected = self.config.participant_count,
            "Received share"
        );

        if let Some(aggregate) = sealed {
            self.report(aggregate).await;
        }

        Ok(())
    }

    /// Wait until the aggregate report was delivered or failed
    pub async fn wait_until_settled(&self) -> ParticipantPhase {
        let mut rx = self.phase.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let phase = match rx.wait_for(ParticipantPhase::is_settled).await {
            Ok(phase) => phase.clone(),
            Err(_) => self.phase(),
        };
        phase
    }

    /// Wait for every share delivery and the aggregate report
    pub async fn join_deliveries(&self) -> Vec<DeliveryOutcome> {
        self.deliveries.join().await
    }

    /// Send the aggregate to the coordinator
    ///
    /// Only the insertion that sealed [`ReceivedShares`] gets an aggregate to
    /// pass here, so this runs once per session.
    async fn report(&self, aggregate: i64) {
        info!(aggregate, "Collected all shares, reporting aggregate");

        let channel = self.channel.clone();
        let coordinator = self.config.coordinator_address.clone();
        let policy = self.config.retry.clone();
        let phase = self.phase.clone();

        self.deliveries
            .spawn(async move {
                let message = Message::report(aggregate);
                let result = deliver(channel.as_ref(), &coordinator, &message, &policy).await;

                match &result {
                    Ok(()) => {
                        info!(from = %channel.local_address(), aggregate, "Aggregate report accepted");
                        phase.send_replace(ParticipantPhase::Reported { aggregate });
                    }
                    Err(failure) => {
                        error!(from = %channel.local_address(), "{}", failure);
                        phase.send_replace(ParticipantPhase::Failed {
                            reason: failure.to_string(),
                        });
                    }
                }

                DeliveryOutcome {
                    to: coordinator,
                    kind: MessageKind::Report,
                    result,
                }
            })
            .await;
    }

    fn validate_peers(&self, peers: &[Address]) -> Result<()> {
        let expected = self.config.participant_count - 1;
        if peers.len() != expected {
            return Err(Error::violation(format!(
                "Peer set has {} entries, expected {}",
                peers.len(),
                expected
            )));
        }
        if peers.contains(&self.config.self_address) {
            return Err(Error::violation("Peer set contains self"));
        }
        let unique: HashSet<&Address> = peers.iter().collect();
        if unique.len() != peers.len() {
            return Err(Error::violation("Peer set contains duplicates"));
        }
        Ok(())
    }
}

#[async_trait]
impl<C: SecureChannel> RequestHandler for Participant<C> {
    fn accepts(&self) -> &[MessageKind] {
        &[MessageKind::PeerSet, MessageKind::Share]
    }

    async fn handle(&self, from: Address, message: Message) -> Result<()> {
        match message {
            Message::PeerSet(body) => self.on_peer_set(&from, body.peers).await,
            Message::Share(body) => self.on_share(&from, body.share).await,
            other => Err(Error::violation(format!(
                "Participant does not handle {}",
                other.kind()
            ))),
        }
    }
}
