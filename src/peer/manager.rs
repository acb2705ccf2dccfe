use crate::collaborators::MediaSink;
use crate::error::{BackendError, NegotiationProtocolError};
use crate::peer::connection::{BackendEvent, NegotiationBackend};
use crate::peer::ice::{analyze_candidates, CandidateBuffer};
use crate::peer::media::{acquire_tracks, CaptureDevice, LocalMedia};
use crate::peer::state::{transition, DisconnectReason, Effect, Event, NegotiationState};
use crate::peer::types::{IceCandidate, SessionDescription, TransportState};
use crate::session::Session;
use crate::signaling::{SignalKind, SignalingMessage, SignalingTransport, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What the lifecycle controller must tell its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerOutcome {
    Connected,
    Disconnected(DisconnectReason),
}

/// Drives offer/answer/candidate negotiation for one session and owns the
/// negotiation object plus the local tracks fed into it.
pub struct PeerConnectionManager {
    session: Session,
    state: NegotiationState,
    backend: Option<Arc<dyn NegotiationBackend>>,
    transport: SignalingTransport,
    subscription: Option<Subscription>,
    media: Arc<Mutex<LocalMedia>>,
    sink: Arc<dyn MediaSink>,
    candidates: CandidateBuffer,
    local_candidates: Vec<IceCandidate>,
    remote_description: Option<SessionDescription>,
    local_offer: Option<SessionDescription>,
}

impl PeerConnectionManager {
    pub fn new(
        session: Session,
        backend: Arc<dyn NegotiationBackend>,
        transport: SignalingTransport,
        media: Arc<Mutex<LocalMedia>>,
        sink: Arc<dyn MediaSink>,
    ) -> Self {
        Self {
            session,
            state: NegotiationState::Idle,
            backend: Some(backend),
            transport,
            subscription: None,
            media,
            sink,
            candidates: CandidateBuffer::new(),
            local_candidates: Vec::new(),
            remote_description: None,
            local_offer: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn candidates(&self) -> &CandidateBuffer {
        &self.candidates
    }

    /// Last remote description applied to the negotiation object.
    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn local_offer(&self) -> Option<&SessionDescription> {
        self.local_offer.as_ref()
    }

    /// Acquires local media, hands it to the sink and the negotiation
    /// object, then starts listening for signals. A joiner announces itself
    /// with a ping and waits for the offer.
    pub async fn start(
        &mut self,
        device: &dyn CaptureDevice,
        signals: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Result<(), NegotiationProtocolError> {
        if self.state != NegotiationState::Idle || self.subscription.is_some() {
            return Err(NegotiationProtocolError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        let tracks = acquire_tracks(device).await;
        let tracks = self.media.lock().install(tracks);
        self.sink.attach_local(&tracks);
        if let Some(backend) = &self.backend {
            for track in &tracks {
                // A track the negotiation object refuses is dropped, not fatal.
                if let Err(err) = backend.add_local_track(track).await {
                    warn!(session_id = %self.session.id(), track = track.label(), error = %err, "could not add local track");
                }
            }
        }

        self.subscription = Some(self.transport.subscribe(self.session.id(), move |msg| {
            let _ = signals.send(msg);
        }));

        if !self.session.is_initiator() {
            self.apply(Event::Listen).await?;
            self.transport
                .publish(SignalingMessage::ping(self.session.id(), self.transport.peer_id()));
        }
        info!(session_id = %self.session.id(), role = ?self.session.role(), "peer started");
        Ok(())
    }

    /// Applies one event and runs its effects. Protocol errors leave the
    /// state untouched; backend failures move the session to `Failed`.
    pub async fn apply(
        &mut self,
        event: Event,
    ) -> Result<Vec<ManagerOutcome>, NegotiationProtocolError> {
        let name = event.name();
        let next = transition(self.session.role(), self.state, event)?;
        if next.state != self.state {
            info!(
                session_id = %self.session.id(),
                from = ?self.state,
                to = ?next.state,
                event = name,
                "negotiation state changed"
            );
        }
        self.state = next.state;

        let mut outcomes = Vec::new();
        for effect in next.effects {
            match self.run(effect).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(err) => {
                    error!(session_id = %self.session.id(), event = name, error = %err, "negotiation step failed");
                    outcomes.extend(self.fail()?);
                    break;
                }
            }
        }
        Ok(outcomes)
    }

    fn fail(&mut self) -> Result<Vec<ManagerOutcome>, NegotiationProtocolError> {
        let next = transition(self.session.role(), self.state, Event::NegotiationFailed)?;
        self.state = next.state;
        Ok(next
            .effects
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::NotifyDisconnected(reason) => Some(ManagerOutcome::Disconnected(reason)),
                _ => None,
            })
            .collect())
    }

    /// Handles one delivered signal. Malformed or out-of-place messages are
    /// logged and dropped.
    pub async fn handle_signal(&mut self, msg: SignalingMessage) -> Vec<ManagerOutcome> {
        let event = match msg.kind {
            SignalKind::Offer => msg.session_description().map(Event::OfferReceived),
            SignalKind::Answer => msg.session_description().map(Event::AnswerReceived),
            SignalKind::Candidate => msg.ice_candidate().map(Event::CandidateReceived),
            SignalKind::Ping => Ok(Event::PeerPing),
            SignalKind::Disconnect => Ok(Event::RemoteHangUp),
        };
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!(session_id = %self.session.id(), message_id = %msg.message_id, error = %err, "dropping undecodable signal");
                return Vec::new();
            }
        };
        if matches!(event, Event::PeerPing) {
            info!(session_id = %self.session.id(), from = %msg.from, "peer is looking to connect");
        }
        match self.apply(event).await {
            Ok(outcomes) => outcomes,
            Err(err) => {
                warn!(
                    session_id = %self.session.id(),
                    kind = %msg.kind,
                    message_id = %msg.message_id,
                    error = %err,
                    "ignoring unexpected signal"
                );
                Vec::new()
            }
        }
    }

    pub async fn handle_backend(&mut self, event: BackendEvent) -> Vec<ManagerOutcome> {
        let event = match event {
            BackendEvent::LocalCandidate(candidate) => {
                if self.state.is_terminal() {
                    return Vec::new();
                }
                match SignalingMessage::candidate(
                    self.session.id(),
                    self.transport.peer_id(),
                    &candidate,
                ) {
                    Ok(msg) => self.transport.publish(msg),
                    Err(err) => warn!(error = %err, "could not encode local candidate"),
                }
                self.local_candidates.push(candidate);
                return Vec::new();
            }
            BackendEvent::TransportState(state) => {
                if state == TransportState::Failed {
                    analyze_candidates(&self.local_candidates);
                }
                Event::Transport(state)
            }
            BackendEvent::RemoteTrack(track) => {
                if !self.state.is_terminal() {
                    self.sink.attach_remote(&track);
                }
                Event::RemoteTrack
            }
        };
        match self.apply(event).await {
            Ok(outcomes) => outcomes,
            Err(err) => {
                debug!(session_id = %self.session.id(), error = %err, "backend event absorbed");
                Vec::new()
            }
        }
    }

    /// Connect deadline passed.
    pub async fn expire(&mut self) -> Vec<ManagerOutcome> {
        match self.apply(Event::TimedOut).await {
            Ok(outcomes) => outcomes,
            Err(err) => {
                debug!(error = %err, "timeout absorbed");
                Vec::new()
            }
        }
    }

    async fn run(&mut self, effect: Effect) -> Result<Option<ManagerOutcome>, BackendError> {
        match effect {
            Effect::CreateOffer => {
                let backend = self.backend()?;
                let offer = backend.create_offer().await?;
                backend.set_local_description(&offer).await?;
                self.send_description(&offer);
                self.local_offer = Some(offer);
            }
            Effect::ResendOffer => {
                if let Some(offer) = self.local_offer.clone() {
                    debug!(session_id = %self.session.id(), "re-sending offer to late joiner");
                    self.send_description(&offer);
                }
            }
            Effect::AnswerOffer(offer) => {
                let backend = self.backend()?;
                self.set_remote(&backend, offer).await?;
                let answer = backend.create_answer().await?;
                backend.set_local_description(&answer).await?;
                self.send_description(&answer);
            }
            Effect::ApplyAnswer(answer) => {
                let backend = self.backend()?;
                self.set_remote(&backend, answer).await?;
            }
            Effect::ApplyCandidate(candidate) => {
                if let Some(candidate) = self.candidates.accept(candidate) {
                    let backend = self.backend()?;
                    self.add_candidate(&backend, &candidate).await;
                }
            }
            Effect::NotifyConnected => return Ok(Some(ManagerOutcome::Connected)),
            Effect::NotifyDisconnected(reason) => {
                return Ok(Some(ManagerOutcome::Disconnected(reason)))
            }
        }
        Ok(None)
    }

    fn backend(&self) -> Result<Arc<dyn NegotiationBackend>, BackendError> {
        self.backend.clone().ok_or(BackendError::Closed)
    }

    async fn set_remote(
        &mut self,
        backend: &Arc<dyn NegotiationBackend>,
        desc: SessionDescription,
    ) -> Result<(), BackendError> {
        backend.set_remote_description(&desc).await?;
        self.remote_description = Some(desc);
        let backlog = self.candidates.release();
        if !backlog.is_empty() {
            debug!(session_id = %self.session.id(), count = backlog.len(), "flushing buffered candidates");
        }
        for candidate in backlog {
            self.add_candidate(backend, &candidate).await;
        }
        Ok(())
    }

    async fn add_candidate(&mut self, backend: &Arc<dyn NegotiationBackend>, candidate: &IceCandidate) {
        match backend.add_ice_candidate(candidate).await {
            Ok(()) => self.candidates.record_applied(),
            Err(err) => warn!(session_id = %self.session.id(), error = %err, "remote candidate rejected"),
        }
    }

    fn send_description(&self, desc: &SessionDescription) {
        match SignalingMessage::description(self.session.id(), self.transport.peer_id(), desc) {
            Ok(msg) => self.transport.publish(msg),
            Err(err) => error!(error = %err, "could not encode session description"),
        }
    }

    /// Steps 2 to 7 of teardown. Every step runs even if an earlier one
    /// failed; failures are logged.
    pub async fn teardown(&mut self, notify_remote: bool) {
        let session_id = self.session.id().to_string();

        let farewell = if notify_remote {
            let msg = SignalingMessage::disconnect(&session_id, self.transport.peer_id());
            let key = msg.key();
            self.transport.publish(msg);
            Some(key)
        } else {
            None
        };

        if let Some(backend) = self.backend.take() {
            if let Err(err) = backend.close().await {
                warn!(%session_id, error = %err, "closing negotiation object failed");
            }
        }

        let stopped = self.media.lock().stop_all();
        debug!(%session_id, stopped, "local tracks stopped");

        self.sink.detach_all();

        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        if let Err(err) = self
            .transport
            .purge_session(&session_id, farewell.as_ref())
            .await
        {
            warn!(%session_id, error = %err, "purging signaling history failed");
        }

        self.candidates.clear();
        self.local_offer = None;
        self.state = NegotiationState::Disconnected;
        info!(%session_id, "session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NullSink;
    use crate::config::SessionConfig;
    use crate::peer::connection::BackendFactory;
    use crate::peer::fake::{FakeBackend, FakeBackendFactory};
    use crate::peer::media::NoCaptureDevice;
    use crate::peer::types::MediaTrack;
    use crate::session::Role;
    use crate::signaling::{InMemoryBus, MessageBus};

    struct Harness {
        manager: PeerConnectionManager,
        fake: FakeBackend,
        bus: Arc<InMemoryBus>,
        media: Arc<Mutex<LocalMedia>>,
        _events: mpsc::UnboundedReceiver<BackendEvent>,
    }

    async fn harness(role: Role, factory: FakeBackendFactory) -> Harness {
        let bus = Arc::new(InMemoryBus::new());
        let transport = SignalingTransport::new(bus.clone(), "local", &SessionConfig::default());
        let (tx, events) = mpsc::unbounded_channel();
        let backend = factory.create(&[], tx).await.expect("backend");
        let media = Arc::new(Mutex::new(LocalMedia::new()));
        let manager = PeerConnectionManager::new(
            Session::new("482913", role),
            backend,
            transport,
            media.clone(),
            Arc::new(NullSink),
        );
        Harness {
            manager,
            fake: factory.last().expect("fake handle"),
            bus,
            media,
            _events: events,
        }
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.1.0.{n} 4000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn early_candidates_are_applied_after_offer() {
        let mut h = harness(Role::Joiner, FakeBackendFactory::new()).await;
        h.manager
            .apply(Event::CandidateReceived(candidate(1)))
            .await
            .expect("buffered");
        h.manager
            .apply(Event::CandidateReceived(candidate(2)))
            .await
            .expect("buffered");
        assert_eq!(h.manager.candidates().pending(), 2);
        assert!(h.fake.applied_candidates().is_empty());

        h.manager
            .apply(Event::OfferReceived(SessionDescription::offer("v=0")))
            .await
            .expect("offer");

        assert_eq!(h.manager.state(), NegotiationState::IceExchange);
        assert_eq!(h.fake.applied_candidates(), vec![candidate(1), candidate(2)]);
        assert_eq!(h.manager.candidates().applied(), h.manager.candidates().received());
        assert_eq!(
            h.manager.remote_description(),
            Some(&SessionDescription::offer("v=0"))
        );
    }

    #[tokio::test]
    async fn duplicate_offer_is_not_answered_twice() {
        let mut h = harness(Role::Joiner, FakeBackendFactory::new()).await;
        h.manager
            .apply(Event::OfferReceived(SessionDescription::offer("v=0")))
            .await
            .expect("offer");
        let err = h
            .manager
            .apply(Event::OfferReceived(SessionDescription::offer("v=0")))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationProtocolError::DuplicateOffer { .. }));
        assert_eq!(h.fake.answers_created(), 1);

        settle().await;
        let answers = h
            .bus
            .list("482913")
            .await
            .expect("list")
            .into_iter()
            .filter(|s| s.data.contains("\"answer\""))
            .count();
        assert_eq!(answers, 1);
    }

    #[tokio::test]
    async fn rejected_description_fails_the_session() {
        let mut h = harness(Role::Joiner, FakeBackendFactory::failing_remote_description()).await;
        let outcomes = h
            .manager
            .apply(Event::OfferReceived(SessionDescription::offer("v=0")))
            .await
            .expect("handled");
        assert_eq!(
            outcomes,
            vec![ManagerOutcome::Disconnected(DisconnectReason::NegotiationFailed)]
        );
        assert_eq!(h.manager.state(), NegotiationState::Failed);
        assert_eq!(h.fake.answers_created(), 0);
    }

    #[tokio::test]
    async fn answer_after_connected_is_ignored() {
        let mut h = harness(Role::Initiator, FakeBackendFactory::new()).await;
        h.manager.apply(Event::Call).await.expect("call");
        h.manager
            .apply(Event::AnswerReceived(SessionDescription::answer("v=0")))
            .await
            .expect("answer");
        let outcomes = h
            .manager
            .handle_backend(BackendEvent::TransportState(TransportState::Connected))
            .await;
        assert_eq!(outcomes, vec![ManagerOutcome::Connected]);

        let late = SignalingMessage::description(
            "482913",
            "remote",
            &SessionDescription::answer("v=1"),
        )
        .expect("encode");
        assert!(h.manager.handle_signal(late).await.is_empty());
        assert_eq!(h.manager.state(), NegotiationState::Connected);
        assert_eq!(
            h.manager.remote_description(),
            Some(&SessionDescription::answer("v=0"))
        );
    }

    #[tokio::test]
    async fn joiner_start_pings_and_listens() {
        let mut h = harness(Role::Joiner, FakeBackendFactory::new()).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        h.manager.start(&NoCaptureDevice, tx).await.expect("start");
        assert_eq!(h.manager.state(), NegotiationState::AwaitingRemoteOffer);
        assert_eq!(h.fake.tracks().len(), 2);

        settle().await;
        let stored = h.bus.list("482913").await.expect("list");
        assert_eq!(stored.len(), 1);
        assert!(stored[0].data.contains("\"ping\""));
    }

    #[tokio::test]
    async fn teardown_releases_everything() {
        let mut h = harness(Role::Initiator, FakeBackendFactory::new()).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        h.manager.start(&NoCaptureDevice, tx).await.expect("start");
        let tracks = h.media.lock().tracks().to_vec();
        h.manager.apply(Event::Call).await.expect("call");

        h.manager.teardown(true).await;
        settle().await;

        assert_eq!(h.manager.state(), NegotiationState::Disconnected);
        assert!(h.fake.is_closed());
        assert!(tracks.iter().all(MediaTrack::is_stopped));
        let stored = h.bus.list("482913").await.expect("list");
        assert_eq!(stored.len(), 1);
        assert!(stored[0].data.contains("\"disconnect\""));
    }
}
