//! Coordinator session
//!
//! Collects N registrations, hands every participant the addresses of the
//! other N-1, then adds the N aggregate reports into the global sum.

use crate::channel::{async_trait, DeliveryOutcome, DeliveryTracker, RequestHandler};
use crate::{
    Address, CoordinatorConfig, Error, Message, MessageKind, ParticipantRecord, Result,
    SecureChannel,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument};

/// Lifecycle of the coordinator session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    AwaitingRegistrations,
    BroadcastingPeerSets,
    AwaitingReports,
    Complete { aggregate: i64 },
}

struct Registry {
    phase: CoordinatorPhase,
    participants: Vec<ParticipantRecord>,
    reported: HashMap<Address, i64>,
    total: i64,
}

impl Registry {
    fn contains(&self, address: &Address) -> bool {
        self.participants.iter().any(|p| &p.address == address)
    }
}

/// Coordinator session state
pub struct Coordinator<C: SecureChannel> {
    config: CoordinatorConfig,
    channel: Arc<C>,
    registry: Mutex<Registry>,
    phase: watch::Sender<CoordinatorPhase>,
    deliveries: DeliveryTracker,
}

impl<C: SecureChannel> Coordinator<C> {
    /// Create a new coordinator session
    pub fn new(config: CoordinatorConfig, channel: Arc<C>) -> Result<Self> {
        if channel.local_address() != &config.self_address {
            return Err(Error::InvalidConfig(format!(
                "Channel sends as {} but the coordinator is {}",
                channel.local_address(),
                config.self_address
            )));
        }

        let (phase, _) = watch::channel(CoordinatorPhase::AwaitingRegistrations);

        Ok(Self {
            registry: Mutex::new(Registry {
                phase: CoordinatorPhase::AwaitingRegistrations,
                participants: Vec::with_capacity(config.participant_count),
                reported: HashMap::new(),
                total: 0,
            }),
            config,
            channel,
            phase,
            deliveries: DeliveryTracker::new(),
        })
    }

    pub fn phase(&self) -> CoordinatorPhase {
        *self.phase.borrow()
    }

    /// Global sum, once every report arrived
    pub fn aggregate(&self) -> Option<i64> {
        match self.phase() {
            CoordinatorPhase::Complete { aggregate } => Some(aggregate),
            _ => None,
        }
    }

    /// Registered participants in registration order
    pub async fn registry(&self) -> Vec<ParticipantRecord> {
        self.registry.lock().await.participants.clone()
    }

    /// Number of aggregate reports accepted so far
    pub async fn reports_received(&self) -> usize {
        self.registry.lock().await.reported.len()
    }

    /// Register a participant
    ///
    /// The registration that completes the quorum triggers the peer-set
    /// broadcast. The phase leaves `AwaitingRegistrations` under the registry
    /// lock, so the broadcast cannot fire twice.
    #[instrument(skip(self))]
    pub async fn register(&self, address: Address) -> Result<ParticipantRecord> {
        let (record, quorum) = {
            let mut registry = self.registry.lock().await;

            if registry.contains(&address) {
                return Err(Error::violation(format!("{} is already registered", address)));
            }
            if registry.phase != CoordinatorPhase::AwaitingRegistrations {
                return Err(Error::violation(format!(
                    "Registry is full with {} participants",
                    self.config.participant_count
                )));
            }

            let record = ParticipantRecord::new(address, registry.participants.len());
            registry.participants.push(record.clone());

            info!(
                address = %record.address,
                ordinal = record.ordinal,
                registered = registry.participants.len(),
                expected = self.config.participant_count,
                "Registered participant"
            );

            let quorum = if registry.participants.len() == self.config.participant_count {
                self.transition(&mut registry, CoordinatorPhase::BroadcastingPeerSets);
                Some(registry.participants.clone())
            } else {
                None
            };

            (record, quorum)
        };

        if let Some(participants) = quorum {
            self.broadcast_peer_sets(&participants).await;
        }

        Ok(record)
    }

    /// Accept an aggregate report from a registered participant
    ///
    /// A resend of the report already counted from `from` is acknowledged
    /// without effect, also after completion.
    #[instrument(skip(self, share))]
    pub async fn receive_report(&self, from: &Address, share: i64) -> Result<()> {
        let mut registry = self.registry.lock().await;

        match registry.reported.get(from) {
            Some(counted) if *counted == share => {
                debug!(from = %from, "Report resent, already counted");
                return Ok(());
            }
            Some(_) => {
                return Err(Error::violation(format!(
                    "{} already reported a different aggregate",
                    from
                )));
            }
            None => {}
        }

        match registry.phase {
            CoordinatorPhase::AwaitingRegistrations => {
                return Err(Error::violation("Report before the peer sets were sent"));
            }
            CoordinatorPhase::Complete { .. } => {
                return Err(Error::violation("Session is already complete"));
            }
            CoordinatorPhase::BroadcastingPeerSets | CoordinatorPhase::AwaitingReports => {}
        }
        if !registry.contains(from) {
            return Err(Error::violation(format!("{} is not registered", from)));
        }

        let total = registry.total.checked_add(share).ok_or(Error::Overflow)?;
        registry.total = total;
        registry.reported.insert(from.clone(), share);

        info!(
            from = %from,
            reports = registry.reported.len(),
            expected = self.config.participant_count,
            "Received aggregate report"
        );

        if registry.reported.len() == self.config.participant_count {
            info!(aggregate = total, "Finished computing");
            self.transition(&mut registry, CoordinatorPhase::Complete { aggregate: total });
        }

        Ok(())
    }

    /// Wait until all reports arrived and return the global sum
    pub async fn wait_for_aggregate(&self) -> Result<i64> {
        let mut rx = self.phase.subscribe();
        let phase = rx
            .wait_for(|phase| matches!(phase, CoordinatorPhase::Complete { .. }))
            .await
            .map_err(|_| Error::Internal("Coordinator phase channel closed".into()))?;

        match *phase {
            CoordinatorPhase::Complete { aggregate } => Ok(aggregate),
            other => Err(Error::Internal(format!("Unexpected phase {:?}", other))),
        }
    }

    /// Wait for every peer-set delivery and return their outcomes
    pub async fn join_deliveries(&self) -> Vec<DeliveryOutcome> {
        self.deliveries.join().await
    }

    async fn broadcast_peer_sets(&self, participants: &[ParticipantRecord]) {
        info!(participants = participants.len(), "Quorum reached, sending peer sets");

        for record in participants {
            let peers: Vec<Address> = participants
                .iter()
                .filter(|p| p.ordinal != record.ordinal)
                .map(|p| p.address.clone())
                .collect();

            self.deliveries
                .dispatch(
                    self.channel.clone(),
                    record.address.clone(),
                    Message::peer_set(peers),
                    self.config.retry.clone(),
                )
                .await;
        }

        let mut registry = self.registry.lock().await;
        if registry.phase == CoordinatorPhase::BroadcastingPeerSets {
            self.transition(&mut registry, CoordinatorPhase::AwaitingReports);
        }
    }

    fn transition(&self, registry: &mut Registry, next: CoordinatorPhase) {
        registry.phase = next;
        self.phase.send_replace(next);
    }
}

#[async_trait]
impl<C: SecureChannel> RequestHandler for Coordinator<C> {
    fn accepts(&self) -> &[MessageKind] {
        &[MessageKind::Register, MessageKind::Report]
    }

    async fn handle(&self, from: Address, message: Message) -> Result<()> {
        match message {
            Message::Register(body) => {
                if body.address != from {
                    return Err(Error::violation(format!(
                        "{} tried to register {}",
                        from, body.address
                    )));
                }
                self.register(body.address).await.map(|_| ())
            }
            Message::Report(body) => self.receive_report(&from, body.share).await,
            other => Err(Error::violation(format!(
                "Coordinator does not handle {}",
                other.kind()
            ))),
        }
    }
}
