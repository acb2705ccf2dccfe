//! In-process negotiation object with scripted, deterministic behaviour.
//!
//! Every `set_local_description` gathers exactly one host candidate. Once
//! the remote description is set and at least one remote candidate has been
//! applied, the backend reports `Connected` followed by one remote track per
//! local track of the other side's default shape (audio, then video). That
//! is three "connected" signals per session, on purpose.

use crate::error::BackendError;
use crate::peer::connection::{BackendEvent, BackendFactory, NegotiationBackend};
use crate::peer::types::{
    IceCandidate, MediaKind, MediaTrack, RemoteTrackInfo, SdpType, ServerConfig,
    SessionDescription, TransportState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

static NEXT_BACKEND: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Default)]
struct FakeState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    tracks: Vec<MediaTrack>,
    offers: usize,
    answers: usize,
    announced: bool,
    closed: bool,
}

/// Inspectable handle to one fake negotiation object.
#[derive(Clone)]
pub struct FakeBackend {
    index: usize,
    state: Arc<Mutex<FakeState>>,
    events: mpsc::UnboundedSender<BackendEvent>,
    fail_remote: bool,
}

impl FakeBackend {
    fn new(events: mpsc::UnboundedSender<BackendEvent>, fail_remote: bool) -> Self {
        Self {
            index: NEXT_BACKEND.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(Mutex::new(FakeState::default())),
            events,
            fail_remote,
        }
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.state.lock().tracks.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers
    }

    pub fn answers_created(&self) -> usize {
        self.state.lock().answers
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Injects an event as if the native object had raised it.
    pub fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(&self, state: &FakeState) -> Result<(), BackendError> {
        if state.closed {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    fn candidate(&self, n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{n} 1 udp 2122260223 10.0.{}.{} {} typ host",
                self.index % 250,
                n % 250,
                50_000 + n
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn maybe_announce(&self) {
        let ready = {
            let mut state = self.state.lock();
            let ready = !state.announced
                && !state.closed
                && state.remote.is_some()
                && !state.applied.is_empty();
            if ready {
                state.announced = true;
            }
            ready
        };
        if !ready {
            return;
        }
        self.emit(BackendEvent::TransportState(TransportState::Connected));
        for (kind, id) in [(MediaKind::Audio, "remote-audio"), (MediaKind::Video, "remote-video")] {
            self.emit(BackendEvent::RemoteTrack(RemoteTrackInfo {
                id: id.into(),
                stream_id: "remote".into(),
                kind,
            }));
        }
    }
}

#[async_trait]
impl NegotiationBackend for FakeBackend {
    async fn create_offer(&self) -> Result<SessionDescription, BackendError> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=fake {} {} IN IP4 127.0.0.1\r\ns=offer\r\n",
            self.index, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, BackendError> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        if state.remote.as_ref().map(|d| d.sdp_type) != Some(SdpType::Offer) {
            return Err(BackendError::Rejected {
                operation: "create answer",
                reason: "no remote offer".into(),
            });
        }
        state.answers += 1;
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=fake {} {} IN IP4 127.0.0.1\r\ns=answer\r\n",
            self.index, state.answers
        )))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), BackendError> {
        let n = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            state.local = Some(desc.clone());
            state.offers + state.answers
        };
        self.emit(BackendEvent::TransportState(TransportState::Connecting));
        self.emit(BackendEvent::LocalCandidate(self.candidate(n)));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), BackendError> {
        {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            if self.fail_remote {
                return Err(BackendError::Rejected {
                    operation: "set remote description",
                    reason: "scripted failure".into(),
                });
            }
            state.remote = Some(desc.clone());
        }
        self.maybe_announce();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), BackendError> {
        {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            if state.remote.is_none() {
                return Err(BackendError::Rejected {
                    operation: "add candidate",
                    reason: "remote description not set".into(),
                });
            }
            state.applied.push(candidate.clone());
        }
        self.maybe_announce();
        Ok(())
    }

    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        state.tracks.push(track.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

/// Hands out `FakeBackend`s and keeps a handle to each for inspection.
#[derive(Clone, Default)]
pub struct FakeBackendFactory {
    created: Arc<Mutex<Vec<FakeBackend>>>,
    fail_remote: bool,
}

impl FakeBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every backend rejects `set_remote_description`.
    pub fn failing_remote_description() -> Self {
        Self {
            fail_remote: true,
            ..Self::default()
        }
    }

    pub fn backends(&self) -> Vec<FakeBackend> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<FakeBackend> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl BackendFactory for FakeBackendFactory {
    async fn create(
        &self,
        _ice_servers: &[ServerConfig],
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<Arc<dyn NegotiationBackend>, BackendError> {
        let backend = FakeBackend::new(events, self.fail_remote);
        self.created.lock().push(backend.clone());
        Ok(Arc::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connects_after_description_and_candidate() {
        let factory = FakeBackendFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = factory.create(&[], tx).await.expect("create");

        let offer = backend.create_offer().await.expect("offer");
        backend.set_local_description(&offer).await.expect("local");
        assert_eq!(
            rx.recv().await,
            Some(BackendEvent::TransportState(TransportState::Connecting))
        );
        assert!(matches!(rx.recv().await, Some(BackendEvent::LocalCandidate(_))));

        let fake = factory.last().expect("handle");
        assert_eq!(fake.local_description(), Some(offer.clone()));
        assert_eq!(fake.remote_description(), None);
        let early = fake.candidate(9);
        assert!(backend.add_ice_candidate(&early).await.is_err());

        backend
            .set_remote_description(&SessionDescription::answer("v=0"))
            .await
            .expect("remote");
        assert!(rx.try_recv().is_err());

        assert_eq!(fake.remote_description(), Some(SessionDescription::answer("v=0")));

        backend.add_ice_candidate(&early).await.expect("candidate");
        assert_eq!(
            rx.recv().await,
            Some(BackendEvent::TransportState(TransportState::Connected))
        );
        assert!(matches!(rx.recv().await, Some(BackendEvent::RemoteTrack(_))));
        assert!(matches!(rx.recv().await, Some(BackendEvent::RemoteTrack(_))));

        backend.add_ice_candidate(&early).await.expect("second candidate");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn factory_keeps_a_handle_per_backend() {
        let factory = FakeBackendFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        factory.create(&[], tx.clone()).await.expect("first");
        let second = factory.create(&[], tx).await.expect("second");
        second.close().await.expect("close");

        let handles = factory.backends();
        assert_eq!(handles.len(), 2);
        assert!(!handles[0].is_closed());
        assert!(handles[1].is_closed());
    }

    #[tokio::test]
    async fn closed_backend_rejects_work() {
        let factory = FakeBackendFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let backend = factory.create(&[], tx).await.expect("create");
        backend.close().await.expect("close");
        assert!(matches!(backend.create_offer().await, Err(BackendError::Closed)));
        assert!(factory.last().expect("handle").is_closed());
    }

    #[tokio::test]
    async fn answer_requires_remote_offer() {
        let factory = FakeBackendFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let backend = factory.create(&[], tx).await.expect("create");
        assert!(backend.create_answer().await.is_err());
        backend
            .set_remote_description(&SessionDescription::offer("v=0"))
            .await
            .expect("remote");
        assert_eq!(
            backend.create_answer().await.expect("answer").sdp_type,
            SdpType::Answer
        );
    }
}
