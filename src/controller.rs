//! Session lifecycle: one runner task per session owns the negotiation
//! manager and the connect timer, and turns everything that happens to the
//! session into at most one `on_connected` and at most one `on_disconnected`.

use crate::collaborators::{MediaSink, NullSink, Speaker, TranscriptHook};
use crate::config::SessionConfig;
use crate::error::{NegotiationProtocolError, ParleyError, ParleyResult, TransportError};
use crate::peer::connection::{BackendEvent, BackendFactory};
use crate::peer::manager::{ManagerOutcome, PeerConnectionManager};
use crate::peer::media::{CaptureDevice, LocalMedia, LocalMediaState, NoCaptureDevice};
use crate::peer::state::{DisconnectReason, Event, NegotiationState};
use crate::peer::types::MediaKind;
use crate::session::{Role, RoomRegistry, Session};
use crate::signaling::{HttpBus, InMemoryBus, MessageBus, SignalingMessage, SignalingTransport};
use crate::timer::{ConnectionTimer, TimerFired};
use crate::utils::random_id;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

pub type OnConnected = Box<dyn FnOnce() + Send + 'static>;
pub type OnDisconnected = Box<dyn FnOnce(DisconnectReason) + Send + 'static>;

/// Store named by `signal_url`, or a process-local one.
pub fn signal_bus(config: &SessionConfig) -> Result<Arc<dyn MessageBus>, TransportError> {
    match &config.signal_url {
        Some(url) => Ok(Arc::new(HttpBus::new(url)?)),
        None => Ok(Arc::new(InMemoryBus::new())),
    }
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub session: Option<Session>,
    pub state: NegotiationState,
    pub active: bool,
    pub media: LocalMediaState,
}

enum Command {
    Call(oneshot::Sender<ParleyResult<()>>),
    HangUp(oneshot::Sender<()>),
}

struct RunnerHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

pub struct ConnectionLifecycleController {
    config: SessionConfig,
    bus: Arc<dyn MessageBus>,
    factory: Arc<dyn BackendFactory>,
    registry: RoomRegistry,
    capture: Arc<dyn CaptureDevice>,
    sink: Arc<dyn MediaSink>,
    speaker: Option<Arc<dyn Speaker>>,
    transcript: Mutex<Option<TranscriptHook>>,
    media: Arc<Mutex<LocalMedia>>,
    session: Arc<Mutex<Option<Session>>>,
    state: Arc<watch::Sender<NegotiationState>>,
    runner: Option<RunnerHandle>,
}

impl ConnectionLifecycleController {
    pub fn new(
        config: SessionConfig,
        bus: Arc<dyn MessageBus>,
        factory: Arc<dyn BackendFactory>,
    ) -> Self {
        let (state, _) = watch::channel(NegotiationState::Idle);
        Self {
            config,
            bus,
            factory,
            registry: RoomRegistry::new(),
            capture: Arc::new(NoCaptureDevice),
            sink: Arc::new(NullSink),
            speaker: None,
            transcript: Mutex::new(None),
            media: Arc::new(Mutex::new(LocalMedia::new())),
            session: Arc::new(Mutex::new(None)),
            state: Arc::new(state),
            runner: None,
        }
    }

    pub fn with_capture(mut self, capture: Arc<dyn CaptureDevice>) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_speaker(mut self, speaker: Arc<dyn Speaker>) -> Self {
        self.speaker = Some(speaker);
        self
    }

    pub fn with_registry(mut self, registry: RoomRegistry) -> Self {
        self.registry = registry;
        self
    }

    fn is_active(&self) -> bool {
        self.runner
            .as_ref()
            .is_some_and(|runner| !runner.task.is_finished())
    }

    /// New session as initiator. Returns its id.
    pub fn create_session(&mut self) -> ParleyResult<String> {
        if self.is_active() {
            return Err(ParleyError::SessionActive);
        }
        let session = self.registry.create_session();
        info!(session_id = %session.id(), "session created");
        let id = session.id().to_string();
        self.adopt(session);
        Ok(id)
    }

    /// Joins `raw_id` as joiner. The id is not checked for existence.
    pub fn join_session(&mut self, raw_id: &str) -> ParleyResult<String> {
        if self.is_active() {
            return Err(ParleyError::SessionActive);
        }
        let session = self.registry.join_session(raw_id)?;
        info!(session_id = %session.id(), "session joined");
        let id = session.id().to_string();
        self.adopt(session);
        Ok(id)
    }

    fn adopt(&mut self, session: Session) {
        self.runner = None;
        *self.session.lock() = Some(session);
        self.state.send_replace(NegotiationState::Idle);
    }

    /// Adopts `session` and initializes it in one step.
    pub async fn start<C, D>(
        &mut self,
        session: Session,
        on_connected: C,
        on_disconnected: D,
    ) -> ParleyResult<()>
    where
        C: FnOnce() + Send + 'static,
        D: FnOnce(DisconnectReason) + Send + 'static,
    {
        if self.is_active() {
            return Err(ParleyError::SessionActive);
        }
        self.adopt(session);
        self.initialize(on_connected, on_disconnected).await
    }

    /// Acquires media, builds the negotiation object, starts listening for
    /// signals and arms the connect timer for the current session.
    pub async fn initialize<C, D>(&mut self, on_connected: C, on_disconnected: D) -> ParleyResult<()>
    where
        C: FnOnce() + Send + 'static,
        D: FnOnce(DisconnectReason) + Send + 'static,
    {
        if self.is_active() {
            return Err(ParleyError::SessionActive);
        }
        let session = self.session.lock().clone().ok_or(ParleyError::NoSession)?;
        self.config.validate()?;

        let (backend_tx, backend_rx) = mpsc::unbounded_channel();
        let backend = self
            .factory
            .create(&self.config.ice_servers, backend_tx)
            .await?;
        let transport = SignalingTransport::new(self.bus.clone(), random_id(), &self.config);
        let mut manager = PeerConnectionManager::new(
            session.clone(),
            backend,
            transport,
            self.media.clone(),
            self.sink.clone(),
        );

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        if let Err(err) = manager.start(self.capture.as_ref(), signal_tx).await {
            manager.teardown(false).await;
            return Err(err.into());
        }

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let mut timer = ConnectionTimer::new();
        timer.arm(self.config.connect_timeout(), timer_tx);

        self.state.send_replace(manager.state());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let runner = Runner {
            manager,
            timer,
            commands: command_rx,
            signals: signal_rx,
            backend_events: backend_rx,
            timer_fired: timer_rx,
            on_connected: Some(Box::new(on_connected)),
            on_disconnected: Some(Box::new(on_disconnected)),
            state: self.state.clone(),
            session: self.session.clone(),
        };
        let task = tokio::spawn(runner.run());
        self.runner = Some(RunnerHandle { commands, task });
        info!(
            session_id = %session.id(),
            role = ?session.role(),
            timeout_ms = self.config.connect_timeout_ms,
            "session initialized"
        );
        Ok(())
    }

    /// Sends the offer. Only valid for an initiator that has not called yet.
    pub async fn call(&self) -> ParleyResult<()> {
        let runner = self
            .runner
            .as_ref()
            .ok_or(NegotiationProtocolError::NotInitialized)?;
        let (reply, result) = oneshot::channel();
        runner
            .commands
            .send(Command::Call(reply))
            .map_err(|_| NegotiationProtocolError::NotInitialized)?;
        result
            .await
            .map_err(|_| NegotiationProtocolError::NotInitialized)?
    }

    pub fn toggle_audio(&self, enabled: bool) {
        self.media.lock().set_enabled(MediaKind::Audio, enabled);
    }

    pub fn toggle_video(&self, enabled: bool) {
        self.media.lock().set_enabled(MediaKind::Video, enabled);
    }

    /// Ends the session. Safe to call any number of times.
    pub async fn hang_up(&mut self) {
        let Some(runner) = self.runner.take() else {
            if self.session.lock().take().is_some() {
                self.state.send_replace(NegotiationState::Disconnected);
                debug!("dropped session that was never initialized");
            }
            return;
        };
        let (ack, done) = oneshot::channel();
        if runner.commands.send(Command::HangUp(ack)).is_ok() {
            let _ = done.await;
        }
        if let Err(err) = runner.task.await {
            warn!(error = %err, "session runner ended abnormally");
        }
    }

    pub async fn teardown(&mut self) {
        self.hang_up().await;
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.id().to_string())
    }

    pub fn role(&self) -> Option<Role> {
        self.session.lock().as_ref().map(Session::role)
    }

    pub fn share_link(&self, base: &str) -> ParleyResult<Url> {
        let id = self.session_id().ok_or(ParleyError::NoSession)?;
        RoomRegistry::share_link(base, &id)
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    pub fn local_media(&self) -> LocalMediaState {
        self.media.lock().state()
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            session: self.session.lock().clone(),
            state: self.state(),
            active: self.is_active(),
            media: self.local_media(),
        }
    }

    pub fn set_transcript_hook(&self, hook: TranscriptHook) {
        *self.transcript.lock() = Some(hook);
    }

    /// Entry point for an external recogniser.
    pub fn deliver_transcript(&self, text: &str) {
        let hook = self.transcript.lock().clone();
        match hook {
            Some(hook) => hook(text),
            None => debug!("transcript dropped, no hook installed"),
        }
    }

    pub async fn speak(&self, text: &str, language_code: &str) {
        match &self.speaker {
            Some(speaker) => speaker.speak(text, language_code).await,
            None => debug!(language_code, "no speaker configured"),
        }
    }
}

struct Runner {
    manager: PeerConnectionManager,
    timer: ConnectionTimer,
    commands: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::UnboundedReceiver<SignalingMessage>,
    backend_events: mpsc::UnboundedReceiver<BackendEvent>,
    timer_fired: mpsc::UnboundedReceiver<TimerFired>,
    on_connected: Option<OnConnected>,
    on_disconnected: Option<OnDisconnected>,
    state: Arc<watch::Sender<NegotiationState>>,
    session: Arc<Mutex<Option<Session>>>,
}

impl Runner {
    async fn run(mut self) {
        loop {
            let outcomes = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Call(reply)) => match self.manager.apply(Event::Call).await {
                        Ok(outcomes) => {
                            let _ = reply.send(Ok(()));
                            outcomes
                        }
                        Err(err) => {
                            warn!(error = %err, "call rejected");
                            let _ = reply.send(Err(err.into()));
                            Vec::new()
                        }
                    },
                    Some(Command::HangUp(ack)) => {
                        self.shutdown(None).await;
                        let _ = ack.send(());
                        return;
                    }
                    // Controller dropped.
                    None => {
                        self.shutdown(None).await;
                        return;
                    }
                },
                Some(msg) = self.signals.recv() => self.manager.handle_signal(msg).await,
                Some(event) = self.backend_events.recv() => self.manager.handle_backend(event).await,
                Some(fired) = self.timer_fired.recv() => {
                    if self.timer.take_fired(fired) {
                        warn!(session_id = %self.manager.session().id(), "connect timeout elapsed");
                        self.manager.expire().await
                    } else {
                        Vec::new()
                    }
                }
            };
            self.publish_state();
            if let Some(reason) = self.deliver(outcomes) {
                self.shutdown(Some(reason)).await;
                return;
            }
        }
    }

    fn publish_state(&self) {
        let current = self.manager.state();
        self.state.send_if_modified(|state| {
            if *state == current {
                false
            } else {
                *state = current;
                true
            }
        });
    }

    /// Returns the reason when the session has ended.
    fn deliver(&mut self, outcomes: Vec<ManagerOutcome>) -> Option<DisconnectReason> {
        for outcome in outcomes {
            match outcome {
                ManagerOutcome::Connected => {
                    self.timer.cancel();
                    match self.on_connected.take() {
                        Some(callback) => {
                            info!(session_id = %self.manager.session().id(), "connected");
                            callback();
                        }
                        None => debug!("repeated connected signal absorbed"),
                    }
                }
                ManagerOutcome::Disconnected(reason) => {
                    self.notify_disconnected(reason);
                    return Some(reason);
                }
            }
        }
        None
    }

    fn notify_disconnected(&mut self, reason: DisconnectReason) {
        match self.on_disconnected.take() {
            Some(callback) => {
                self.on_connected = None;
                info!(session_id = %self.manager.session().id(), ?reason, "disconnected");
                callback(reason);
            }
            None => debug!(?reason, "repeated disconnect absorbed"),
        }
    }

    /// Ordered teardown. `cause` is set when the session ended on its own.
    async fn shutdown(&mut self, cause: Option<DisconnectReason>) {
        self.timer.cancel();
        // No farewell to a peer that already left.
        let notify_remote = cause != Some(DisconnectReason::RemoteHangUp);
        self.manager.teardown(notify_remote).await;
        *self.session.lock() = None;
        self.publish_state();
        self.notify_disconnected(DisconnectReason::LocalHangUp);
    }
}
