use crate::config::SessionConfig;
use crate::error::TransportError;
use crate::signaling::bus::MessageBus;
use crate::signaling::message::{SignalKey, SignalingMessage};
use crate::utils::now_ms;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Observed {
    session_id: String,
    key: SignalKey,
    own: bool,
}

/// Rolling record of the keys this peer has published or consumed.
///
/// Bounded to `cap` entries. A remote id evicted from the window is
/// retired: it stays seen for as long as the store still lists it, and is
/// forgotten once the store no longer does.
#[derive(Debug)]
struct SeenHistory {
    cap: usize,
    order: VecDeque<Observed>,
    ids: HashSet<String>,
    retired: HashMap<String, HashSet<String>>,
}

impl SeenHistory {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
            retired: HashMap::new(),
        }
    }

    fn contains(&self, session_id: &str, key: &SignalKey) -> bool {
        self.ids.contains(&key.message_id)
            || self
                .retired
                .get(session_id)
                .is_some_and(|retired| retired.contains(&key.message_id))
    }

    fn insert(&mut self, session_id: &str, key: SignalKey, own: bool) -> Option<Observed> {
        if !self.ids.insert(key.message_id.clone()) {
            return None;
        }
        self.order.push_back(Observed {
            session_id: session_id.to_string(),
            key,
            own,
        });
        if self.order.len() <= self.cap {
            return None;
        }
        let evicted = self.order.pop_front()?;
        self.ids.remove(&evicted.key.message_id);
        if !evicted.own {
            self.retired
                .entry(evicted.session_id.clone())
                .or_default()
                .insert(evicted.key.message_id.clone());
        }
        Some(evicted)
    }

    /// Drops retired ids the store no longer lists.
    fn prune_retired(&mut self, session_id: &str, listed: &HashSet<&str>) {
        if let Some(retired) = self.retired.get_mut(session_id) {
            retired.retain(|id| listed.contains(id.as_str()));
            if retired.is_empty() {
                self.retired.remove(session_id);
            }
        }
    }

    fn retired_len(&self, session_id: &str) -> usize {
        self.retired.get(session_id).map_or(0, HashSet::len)
    }

    fn clear_session(&mut self, session_id: &str) {
        let ids = &mut self.ids;
        self.order.retain(|observed| {
            let keep = observed.session_id != session_id;
            if !keep {
                ids.remove(&observed.key.message_id);
            }
            keep
        });
        self.retired.remove(session_id);
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Oldest `sent_at` still inside the retention window.
fn stale_cutoff(now: i64, retention: Duration) -> i64 {
    let retention = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
    now.saturating_sub(retention)
}

/// Session-scoped publish/subscribe over a polled `MessageBus`.
///
/// Delivery is at-least-once from the store's point of view; this type
/// deduplicates by message id so a subscriber sees each message once, and
/// never sees messages this peer published itself.
#[derive(Clone)]
pub struct SignalingTransport {
    bus: Arc<dyn MessageBus>,
    peer_id: String,
    history: Arc<Mutex<SeenHistory>>,
    inflight: Arc<Mutex<Vec<JoinHandle<()>>>>,
    poll_interval: Duration,
    retention: Duration,
}

impl SignalingTransport {
    pub fn new(bus: Arc<dyn MessageBus>, peer_id: impl Into<String>, config: &SessionConfig) -> Self {
        Self {
            bus,
            peer_id: peer_id.into(),
            history: Arc::new(Mutex::new(SeenHistory::new(config.history_cap))),
            inflight: Arc::new(Mutex::new(Vec::new())),
            poll_interval: config.poll_interval(),
            retention: config.retention(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// Fire-and-forget publish; failures are logged and left to the next
    /// attempt of whoever publishes again.
    pub fn publish(&self, message: SignalingMessage) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let kind = message.kind;
            let session_id = message.session_id.clone();
            if let Err(err) = this.publish_now(message).await {
                warn!(%session_id, %kind, error = %err, "signal publish failed");
            }
        });
        let mut inflight = self.inflight.lock();
        inflight.retain(|task| !task.is_finished());
        inflight.push(handle);
    }

    /// Waits for every `publish` issued so far to reach the store.
    pub async fn flush(&self) {
        let pending: Vec<_> = std::mem::take(&mut *self.inflight.lock());
        for task in pending {
            let _ = task.await;
        }
    }

    pub async fn publish_now(&self, message: SignalingMessage) -> Result<(), TransportError> {
        let key = message.key();
        let data = message.encode()?;
        let evicted = self
            .history
            .lock()
            .insert(&message.session_id, key.clone(), true);
        self.bus.append(&message.session_id, key, data).await?;
        debug!(
            session_id = %message.session_id,
            kind = %message.kind,
            message_id = %message.message_id,
            "signal sent"
        );
        if let Some(old) = evicted.filter(|old| old.own) {
            if let Err(err) = self.bus.remove(&old.session_id, &old.key).await {
                debug!(key = %old.key, error = %err, "could not drop evicted signal");
            }
        }
        Ok(())
    }

    /// Starts polling the session every `poll_interval`, handing each unseen
    /// message to `handler`. Dropping or cancelling the returned
    /// `Subscription` stops delivery.
    pub fn subscribe<F>(&self, session_id: &str, handler: F) -> Subscription
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let this = self.clone();
        let session_id = session_id.to_string();
        let task = tokio::spawn(async move {
            this.purge_stale(&session_id).await;
            let mut ticker = tokio::time::interval(this.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = this.poll_with(&session_id, &handler, &flag).await {
                    warn!(%session_id, error = %err, "signal poll failed, retrying next tick");
                }
            }
        });
        Subscription {
            cancelled,
            task: Mutex::new(Some(task)),
        }
    }

    /// One pass over the store. Returns the number of messages delivered.
    pub async fn poll_once<F>(&self, session_id: &str, handler: &F) -> Result<usize, TransportError>
    where
        F: Fn(SignalingMessage) + Send + Sync,
    {
        self.poll_with(session_id, handler, &AtomicBool::new(false))
            .await
    }

    async fn poll_with<F>(
        &self,
        session_id: &str,
        handler: &F,
        cancelled: &AtomicBool,
    ) -> Result<usize, TransportError>
    where
        F: Fn(SignalingMessage) + Send + Sync,
    {
        let entries = self.bus.list(session_id).await?;
        {
            let listed: HashSet<&str> = entries
                .iter()
                .map(|entry| entry.key.message_id.as_str())
                .collect();
            self.history.lock().prune_retired(session_id, &listed);
        }
        let mut delivered = 0;
        for entry in entries {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            {
                let mut history = self.history.lock();
                if history.contains(session_id, &entry.key) {
                    continue;
                }
                history.insert(session_id, entry.key.clone(), false);
            }
            match SignalingMessage::decode(&entry.data) {
                Ok(message) if message.from == self.peer_id => {}
                Ok(message) if message.session_id != session_id => {
                    debug!(
                        key = %entry.key,
                        expected = session_id,
                        got = %message.session_id,
                        "skipping signal for another session"
                    );
                }
                Ok(message) => {
                    debug!(
                        %session_id,
                        kind = %message.kind,
                        message_id = %message.message_id,
                        "signal received"
                    );
                    handler(message);
                    delivered += 1;
                }
                Err(err) => {
                    warn!(%session_id, key = %entry.key, error = %err, "dropping malformed signal");
                }
            }
        }
        Ok(delivered)
    }

    /// Advisory retention sweep; errors are logged and ignored.
    pub async fn purge_stale(&self, session_id: &str) {
        let cutoff = stale_cutoff(now_ms(), self.retention);
        match self.bus.purge_older_than(session_id, cutoff).await {
            Ok(0) => {}
            Ok(removed) => info!(session_id, removed, "removed stale signals"),
            Err(err) => debug!(session_id, error = %err, "stale signal sweep skipped"),
        }
    }

    /// Forgets the session locally and removes its stored signals, keeping
    /// only `retain` (the farewell message, when there is one). Publishes
    /// still in flight land first so none of them outlive the purge.
    pub async fn purge_session(
        &self,
        session_id: &str,
        retain: Option<&SignalKey>,
    ) -> Result<usize, TransportError> {
        self.flush().await;
        self.history.lock().clear_session(session_id);
        let removed = self.bus.purge_session(session_id, retain).await?;
        info!(session_id, removed, "purged session signals");
        Ok(removed)
    }
}

/// Handle returned by `subscribe`. Cancelling is idempotent.
#[derive(Debug)]
pub struct Subscription {
    cancelled: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
