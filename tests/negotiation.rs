use parking_lot::Mutex;
use parley_lib::config::SessionConfig;
use parley_lib::peer::fake::{FakeBackend, FakeBackendFactory};
use parley_lib::peer::types::{IceCandidate, MediaKind, MediaTrack, SessionDescription, TransportState};
use parley_lib::peer::BackendEvent;
use parley_lib::signaling::SignalKind;
use parley_lib::{
    ConnectionLifecycleController, DisconnectReason, InMemoryBus, MessageBus, NegotiationState,
    Role, RoomRegistry, SignalingMessage, SignalingTransport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ROOM: &str = "482913";

#[derive(Clone, Default)]
struct Recorder {
    connected: Arc<AtomicUsize>,
    disconnected: Arc<Mutex<Vec<DisconnectReason>>>,
}

impl Recorder {
    fn callbacks(
        &self,
    ) -> (
        impl FnOnce() + Send + 'static,
        impl FnOnce(DisconnectReason) + Send + 'static,
    ) {
        let connected = self.connected.clone();
        let disconnected = self.disconnected.clone();
        (
            move || {
                connected.fetch_add(1, Ordering::SeqCst);
            },
            move |reason| disconnected.lock().push(reason),
        )
    }

    fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnected(&self) -> Vec<DisconnectReason> {
        self.disconnected.lock().clone()
    }
}

struct Peer {
    controller: ConnectionLifecycleController,
    factory: FakeBackendFactory,
    recorder: Recorder,
}

impl Peer {
    fn new(bus: &Arc<InMemoryBus>, factory: FakeBackendFactory) -> Self {
        let controller = ConnectionLifecycleController::new(
            SessionConfig::default(),
            bus.clone(),
            Arc::new(factory.clone()),
        )
        .with_registry(RoomRegistry::with_generator(|| ROOM.to_string()));
        Self {
            controller,
            factory,
            recorder: Recorder::default(),
        }
    }

    async fn initialize(&mut self) {
        let (on_connected, on_disconnected) = self.recorder.callbacks();
        self.controller
            .initialize(on_connected, on_disconnected)
            .await
            .expect("initialize");
    }

    fn backend(&self) -> FakeBackend {
        self.factory.last().expect("backend created")
    }
}

async fn stored(bus: &InMemoryBus) -> Vec<SignalingMessage> {
    bus.list(ROOM)
        .await
        .expect("list")
        .into_iter()
        .filter_map(|entry| SignalingMessage::decode(&entry.data).ok())
        .collect()
}

async fn connected_pair(bus: &Arc<InMemoryBus>) -> (Peer, Peer) {
    let mut alice = Peer::new(bus, FakeBackendFactory::new());
    let mut bob = Peer::new(bus, FakeBackendFactory::new());

    assert_eq!(alice.controller.create_session().expect("create"), ROOM);
    alice.initialize().await;
    alice.controller.call().await.expect("call");

    bob.controller.join_session(ROOM).expect("join");
    bob.initialize().await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(alice.recorder.connected(), 1);
    assert_eq!(bob.recorder.connected(), 1);
    (alice, bob)
}

#[tokio::test(start_paused = true)]
async fn initiator_call_publishes_one_offer() {
    let bus = Arc::new(InMemoryBus::new());
    let mut alice = Peer::new(&bus, FakeBackendFactory::new());

    let id = alice.controller.create_session().expect("create");
    assert_eq!(id, ROOM);
    assert_eq!(alice.controller.role(), Some(Role::Initiator));

    alice.initialize().await;
    alice.controller.call().await.expect("call");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let offers: Vec<_> = stored(&bus)
        .await
        .into_iter()
        .filter(|msg| msg.kind == SignalKind::Offer)
        .collect();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].session_id, ROOM);
    assert_eq!(
        alice.controller.state(),
        NegotiationState::AwaitingRemoteAnswer
    );

    let err = alice.controller.call().await.unwrap_err();
    assert!(matches!(err, parley_lib::ParleyError::Protocol(_)));
    alice.controller.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn two_peers_connect_exactly_once() {
    let bus = Arc::new(InMemoryBus::new());
    let (mut alice, mut bob) = connected_pair(&bus).await;

    assert_eq!(alice.controller.state(), NegotiationState::Connected);
    assert_eq!(bob.controller.state(), NegotiationState::Connected);
    assert_eq!(bob.backend().answers_created(), 1);
    assert_eq!(alice.backend().offers_created(), 1);
    assert!(!alice.backend().applied_candidates().is_empty());
    assert!(!bob.backend().applied_candidates().is_empty());

    // Outlive the connect timeout: it was cancelled on connect.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(alice.recorder.disconnected().is_empty());
    assert!(bob.recorder.disconnected().is_empty());

    alice.controller.hang_up().await;
    bob.controller.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_connected_signals_are_absorbed() {
    let bus = Arc::new(InMemoryBus::new());
    let (mut alice, mut bob) = connected_pair(&bus).await;

    let backend = alice.backend();
    backend.emit(BackendEvent::TransportState(TransportState::Connected));
    backend.emit(BackendEvent::TransportState(TransportState::Connected));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.recorder.connected(), 1);

    backend.emit(BackendEvent::TransportState(TransportState::Failed));
    backend.emit(BackendEvent::TransportState(TransportState::Closed));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        alice.recorder.disconnected(),
        vec![DisconnectReason::TransportLost]
    );
    assert_eq!(alice.controller.state(), NegotiationState::Disconnected);

    alice.controller.hang_up().await;
    assert_eq!(
        alice.recorder.disconnected(),
        vec![DisconnectReason::TransportLost]
    );
    bob.controller.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_once() {
    let bus = Arc::new(InMemoryBus::new());
    let mut alice = Peer::new(&bus, FakeBackendFactory::new());
    alice.controller.create_session().expect("create");
    alice.initialize().await;
    alice.controller.call().await.expect("call");

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(alice.recorder.disconnected().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(alice.recorder.disconnected(), vec![DisconnectReason::Timeout]);
    assert_eq!(alice.controller.state(), NegotiationState::Disconnected);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(alice.recorder.disconnected(), vec![DisconnectReason::Timeout]);
    assert_eq!(alice.recorder.connected(), 0);
    assert!(alice.backend().is_closed());
}

#[tokio::test(start_paused = true)]
async fn hang_up_notifies_peer_and_purges_history() {
    let bus = Arc::new(InMemoryBus::new());
    let (mut alice, mut bob) = connected_pair(&bus).await;
    let alice_tracks: Vec<MediaTrack> = alice.backend().tracks();
    assert_eq!(alice_tracks.len(), 2);

    alice.controller.hang_up().await;
    assert_eq!(
        alice.recorder.disconnected(),
        vec![DisconnectReason::LocalHangUp]
    );
    assert!(alice_tracks.iter().all(MediaTrack::is_stopped));
    assert!(alice.backend().is_closed());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
        bob.recorder.disconnected(),
        vec![DisconnectReason::RemoteHangUp]
    );
    assert_eq!(bob.controller.state(), NegotiationState::Disconnected);

    // A third party joining the same room finds nothing to negotiate with.
    let carol = SignalingTransport::new(bus.clone(), "carol", &SessionConfig::default());
    let seen = Mutex::new(Vec::new());
    let handler = |msg: SignalingMessage| seen.lock().push(msg.kind);
    carol.poll_once(ROOM, &handler).await.expect("poll");
    assert!(seen
        .lock()
        .iter()
        .all(|kind| matches!(kind, SignalKind::Disconnect)));

    bob.controller.hang_up().await;
    assert_eq!(
        bob.recorder.disconnected(),
        vec![DisconnectReason::RemoteHangUp]
    );
}

#[tokio::test(start_paused = true)]
async fn teardown_twice_matches_teardown_once() {
    let bus = Arc::new(InMemoryBus::new());
    let (mut alice, mut bob) = connected_pair(&bus).await;

    alice.controller.teardown().await;
    let once = alice.controller.snapshot();
    alice.controller.teardown().await;
    let twice = alice.controller.snapshot();

    assert_eq!(once, twice);
    assert!(!once.active);
    assert_eq!(once.session, None);
    assert_eq!(once.state, NegotiationState::Disconnected);
    assert_eq!(alice.recorder.disconnected().len(), 1);
    bob.controller.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn candidate_before_offer_is_applied_after_it() {
    let bus = Arc::new(InMemoryBus::new());
    let mut bob = Peer::new(&bus, FakeBackendFactory::new());
    bob.controller.join_session(ROOM).expect("join");
    bob.initialize().await;

    let remote = SignalingTransport::new(bus.clone(), "remote", &SessionConfig::default());
    let candidate = IceCandidate {
        candidate: "candidate:7 1 udp 2122260223 10.9.0.7 50007 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    let mut early = SignalingMessage::candidate(ROOM, "remote", &candidate).expect("encode");
    let mut offer =
        SignalingMessage::description(ROOM, "remote", &SessionDescription::offer("v=0"))
            .expect("encode");
    // Same wall clock as real traffic, candidate sorted first.
    let now = parley_lib::utils::now_ms();
    early.sent_at = now;
    offer.sent_at = now + 1;
    remote.publish_now(early).await.expect("publish");
    remote.publish_now(offer).await.expect("publish");

    tokio::time::sleep(Duration::from_secs(3)).await;

    let backend = bob.backend();
    assert_eq!(backend.applied_candidates(), vec![candidate]);
    assert_eq!(backend.answers_created(), 1);
    assert_eq!(bob.recorder.connected(), 1);
    bob.controller.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn toggles_flip_tracks_without_touching_negotiation() {
    let bus = Arc::new(InMemoryBus::new());
    let (mut alice, mut bob) = connected_pair(&bus).await;

    alice.controller.toggle_audio(false);
    let media = alice.controller.local_media();
    assert!(!media.audio_enabled);
    assert!(media.video_enabled);
    for track in &media.tracks {
        assert_eq!(track.enabled, track.kind == MediaKind::Video);
    }
    assert_eq!(alice.controller.state(), NegotiationState::Connected);

    alice.controller.toggle_video(false);
    alice.controller.toggle_audio(true);
    let media = alice.controller.local_media();
    for track in &media.tracks {
        assert_eq!(track.enabled, track.kind == MediaKind::Audio);
    }
    assert_eq!(alice.controller.state(), NegotiationState::Connected);

    alice.controller.hang_up().await;
    bob.controller.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_offer_fails_once() {
    let bus = Arc::new(InMemoryBus::new());
    let mut alice = Peer::new(&bus, FakeBackendFactory::new());
    let mut bob = Peer::new(&bus, FakeBackendFactory::failing_remote_description());

    alice.controller.create_session().expect("create");
    alice.initialize().await;
    alice.controller.call().await.expect("call");
    bob.controller.join_session(ROOM).expect("join");
    bob.initialize().await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        bob.recorder.disconnected(),
        vec![DisconnectReason::NegotiationFailed]
    );
    assert_eq!(bob.recorder.connected(), 0);
    assert_eq!(bob.backend().answers_created(), 0);

    // Bob's farewell reaches the waiting initiator.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
        alice.recorder.disconnected(),
        vec![DisconnectReason::RemoteHangUp]
    );
    alice.controller.hang_up().await;
    bob.controller.hang_up().await;
}
