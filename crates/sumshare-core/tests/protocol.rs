//! End-to-end sessions over the in-memory channel

use dashmap::DashSet;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use sumshare_core::channel::{async_trait, MemoryChannel, MemoryHub};
use sumshare_core::{
    Address, Coordinator, CoordinatorConfig, CoordinatorPhase, Error, Message, MessageKind,
    Participant, ParticipantPhase, RetryPolicy, SecureChannel, SessionConfig,
};

const COORDINATOR: &str = "mem://coordinator";

struct Session {
    hub: MemoryHub,
    coordinator: Arc<Coordinator<MemoryChannel>>,
    participants: Vec<Arc<Participant<MemoryChannel>>>,
}

fn retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(500)).unwrap()
}

fn address(i: usize) -> Address {
    Address::new(format!("mem://participant-{}", i))
}

fn session(hub: MemoryHub, bound: i64, secrets: &[i64]) -> Session {
    let n = secrets.len();

    let config = CoordinatorConfig::new(n, COORDINATOR.into())
        .unwrap()
        .with_retry(retry());
    let coordinator = Arc::new(Coordinator::new(config, Arc::new(hub.channel(COORDINATOR))).unwrap());
    hub.bind(COORDINATOR, &coordinator);

    let participants = secrets
        .iter()
        .enumerate()
        .map(|(i, secret)| {
            let config = SessionConfig::new(n, bound, address(i), COORDINATOR.into())
                .unwrap()
                .with_retry(retry());
            let channel = Arc::new(hub.channel(address(i)));
            let participant = Arc::new(Participant::with_secret(config, channel, *secret).unwrap());
            hub.bind(address(i), &participant);
            participant
        })
        .collect();

    Session {
        hub,
        coordinator,
        participants,
    }
}

impl Session {
    /// Register every participant concurrently
    async fn register_all(&self) {
        let tasks: Vec<_> = self
            .participants
            .iter()
            .cloned()
            .map(|p| tokio::spawn(async move { p.register().await }))
            .collect();

        for result in futures_util::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }
    }

    async fn run(&self) -> i64 {
        self.register_all().await;
        tokio::time::timeout(Duration::from_secs(10), self.coordinator.wait_for_aggregate())
            .await
            .expect("session did not complete")
            .unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_participants() {
    let session = session(MemoryHub::new(), 100, &[10, 20, 30]);

    assert_eq!(session.run().await, 60);
    assert_eq!(
        session.coordinator.phase(),
        CoordinatorPhase::Complete { aggregate: 60 }
    );

    let mut reported = 0;
    for participant in &session.participants {
        let phase = participant.wait_until_settled().await;
        assert!(matches!(phase, ParticipantPhase::Reported { .. }));
        assert_eq!(participant.shares_held().await, 3);

        let outcomes = participant.join_deliveries().await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.is_delivered()));

        if let ParticipantPhase::Reported { aggregate } = phase {
            reported += aggregate;
        }
    }
    assert_eq!(reported, 60);

    let broadcasts = session.coordinator.join_deliveries().await;
    assert_eq!(broadcasts.len(), 3);

    assert_eq!(session.hub.delivered(MessageKind::Register), 3);
    assert_eq!(session.hub.delivered(MessageKind::PeerSet), 3);
    assert_eq!(session.hub.delivered(MessageKind::Share), 6);
    assert_eq!(session.hub.delivered(MessageKind::Report), 3);
}

#[tokio::test]
async fn test_single_participant() {
    let session = session(MemoryHub::new(), 100, &[42]);

    assert_eq!(session.run().await, 42);

    let participant = &session.participants[0];
    assert_eq!(
        participant.wait_until_settled().await,
        ParticipantPhase::Reported { aggregate: 42 }
    );
    assert_eq!(participant.shares_held().await, 1);
    assert_eq!(session.hub.delivered(MessageKind::Share), 0);
    assert_eq!(session.coordinator.reports_received().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drawn_secrets_sum() {
    let hub = MemoryHub::new();
    let n = 5;
    let bound = 1_000;

    let config = CoordinatorConfig::new(n, COORDINATOR.into()).unwrap();
    let coordinator = Arc::new(Coordinator::new(config, Arc::new(hub.channel(COORDINATOR))).unwrap());
    hub.bind(COORDINATOR, &coordinator);

    let participants: Vec<_> = (0..n)
        .map(|i| {
            let config = SessionConfig::new(n, bound, address(i), COORDINATOR.into()).unwrap();
            let participant =
                Arc::new(Participant::new(config, Arc::new(hub.channel(address(i)))).unwrap());
            hub.bind(address(i), &participant);
            participant
        })
        .collect();

    for participant in &participants {
        assert!((0..bound / n as i64).contains(&participant.secret()));
        participant.register().await.unwrap();
    }

    let expected: i64 = participants.iter().map(|p| p.secret()).sum();
    let aggregate = tokio::time::timeout(Duration::from_secs(10), coordinator.wait_for_aggregate())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate, expected);
    assert!(aggregate < bound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_peer_blocks_only_its_destination() {
    let hub = MemoryHub::new();
    // Nobody can deliver a share to participant 2.
    hub.block(address(2), MessageKind::Share);
    let session = session(hub, 100, &[10, 20, 30]);

    session.register_all().await;

    for participant in &session.participants[..2] {
        let phase = tokio::time::timeout(Duration::from_secs(10), participant.wait_until_settled())
            .await
            .unwrap();
        assert!(matches!(phase, ParticipantPhase::Reported { .. }));
        assert_eq!(participant.shares_held().await, 3);

        let failures: Vec<_> = participant
            .join_deliveries()
            .await
            .into_iter()
            .filter_map(|o| o.result.err())
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].to, address(2));
        assert_eq!(failures[0].kind, MessageKind::Share);
        assert_eq!(failures[0].attempts, 3);
    }

    let stalled = &session.participants[2];
    stalled.join_deliveries().await;
    assert_eq!(stalled.phase(), ParticipantPhase::Exchanging);
    assert_eq!(stalled.shares_held().await, 1);

    let waited =
        tokio::time::timeout(Duration::from_millis(200), session.coordinator.wait_for_aggregate())
            .await;
    assert!(waited.is_err());
    assert_eq!(session.coordinator.phase(), CoordinatorPhase::AwaitingReports);
    assert_eq!(session.coordinator.reports_received().await, 2);
    assert_eq!(session.coordinator.aggregate(), None);
}

#[tokio::test]
async fn test_unreachable_coordinator_fails_registration() {
    let hub = MemoryHub::new();
    let config = SessionConfig::new(2, 100, address(0), COORDINATOR.into())
        .unwrap()
        .with_retry(retry());
    let participant = Participant::with_secret(config, Arc::new(hub.channel(address(0))), 1).unwrap();

    let err = participant.register().await.unwrap_err();
    assert!(matches!(err, sumshare_core::Error::Delivery(_)));
}

/// Delivers every request, but loses the first acknowledgement per
/// destination and kind so the sender retries an applied request.
struct DroppedAcks {
    inner: MemoryChannel,
    kinds: Vec<MessageKind>,
    lost: DashSet<(Address, MessageKind)>,
}

impl DroppedAcks {
    fn new(inner: MemoryChannel, kinds: &[MessageKind]) -> Self {
        Self {
            inner,
            kinds: kinds.to_vec(),
            lost: DashSet::new(),
        }
    }
}

#[async_trait]
impl SecureChannel for DroppedAcks {
    fn local_address(&self) -> &Address {
        self.inner.local_address()
    }

    async fn send(&self, to: &Address, message: &Message) -> sumshare_core::Result<()> {
        self.inner.send(to, message).await?;
        let kind = message.kind();
        if self.kinds.contains(&kind) && self.lost.insert((to.clone(), kind)) {
            return Err(Error::Transport("response lost".into()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_lost_report_ack_still_reports() {
    let hub = MemoryHub::new();
    let config = CoordinatorConfig::new(1, COORDINATOR.into()).unwrap().with_retry(retry());
    let coordinator = Arc::new(Coordinator::new(config, Arc::new(hub.channel(COORDINATOR))).unwrap());
    hub.bind(COORDINATOR, &coordinator);

    let config = SessionConfig::new(1, 100, address(0), COORDINATOR.into())
        .unwrap()
        .with_retry(retry());
    let channel = Arc::new(DroppedAcks::new(hub.channel(address(0)), &[MessageKind::Report]));
    let participant = Arc::new(Participant::with_secret(config, channel, 42).unwrap());
    hub.bind(address(0), &participant);

    participant.register().await.unwrap();
    assert_eq!(coordinator.wait_for_aggregate().await.unwrap(), 42);
    assert_eq!(
        participant.wait_until_settled().await,
        ParticipantPhase::Reported { aggregate: 42 }
    );
    assert_eq!(hub.delivered(MessageKind::Report), 2);
    assert_eq!(coordinator.aggregate(), Some(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_acks_are_retried_without_failures() {
    let hub = MemoryHub::new();
    let lossy = [MessageKind::PeerSet, MessageKind::Share, MessageKind::Report];
    let secrets = [10, 20, 30];
    let n = secrets.len();

    let config = CoordinatorConfig::new(n, COORDINATOR.into()).unwrap().with_retry(retry());
    let channel = Arc::new(DroppedAcks::new(hub.channel(COORDINATOR), &lossy));
    let coordinator = Arc::new(Coordinator::new(config, channel).unwrap());
    hub.bind(COORDINATOR, &coordinator);

    let participants: Vec<_> = secrets
        .iter()
        .enumerate()
        .map(|(i, secret)| {
            let config = SessionConfig::new(n, 100, address(i), COORDINATOR.into())
                .unwrap()
                .with_retry(retry());
            let channel = Arc::new(DroppedAcks::new(hub.channel(address(i)), &lossy));
            let participant = Arc::new(Participant::with_secret(config, channel, *secret).unwrap());
            hub.bind(address(i), &participant);
            participant
        })
        .collect();

    for participant in &participants {
        participant.register().await.unwrap();
    }

    let aggregate = tokio::time::timeout(Duration::from_secs(10), coordinator.wait_for_aggregate())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate, 60);

    for participant in &participants {
        let phase = participant.wait_until_settled().await;
        assert!(matches!(phase, ParticipantPhase::Reported { .. }));
        assert_eq!(participant.shares_held().await, n);
        assert!(participant
            .join_deliveries()
            .await
            .iter()
            .all(|o| o.is_delivered()));
    }
    assert!(coordinator
        .join_deliveries()
        .await
        .iter()
        .all(|o| o.is_delivered()));
    assert_eq!(coordinator.reports_received().await, n);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Random delivery delays reorder peer sets, shares and reports; the
    /// session still completes with every participant reporting once.
    #[test]
    fn prop_any_interleaving_sums_secrets(
        secrets in proptest::collection::vec(0i64..50, 1..7),
        jitter_us in 0u64..2_000,
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let n = secrets.len();
            let bound = 50 * n as i64;
            let hub = MemoryHub::new().with_jitter(Duration::from_micros(jitter_us));
            let session = session(hub, bound, &secrets);

            let aggregate = session.run().await;
            prop_assert_eq!(aggregate, secrets.iter().sum::<i64>());

            for participant in &session.participants {
                let phase = participant.wait_until_settled().await;
                let reported = matches!(phase, ParticipantPhase::Reported { .. });
                prop_assert!(reported);
                prop_assert_eq!(participant.shares_held().await, n);
                participant.join_deliveries().await;
            }

            prop_assert_eq!(session.hub.delivered(MessageKind::Report), n);
            prop_assert_eq!(session.hub.delivered(MessageKind::Share), n * (n - 1));
            Ok::<(), TestCaseError>(())
        })?;
    }
}
