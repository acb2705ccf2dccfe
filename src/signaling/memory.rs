use crate::error::TransportError;
use crate::signaling::bus::{MessageBus, StoredSignal};
use crate::signaling::message::SignalKey;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Process-local signaling store. Every operation completes synchronously
/// under a short lock, which makes it the store of choice for tests and for
/// two peers living in one process.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    sessions: RwLock<HashMap<String, BTreeMap<SignalKey, String>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .get(session_id)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, session_id: &str) -> bool {
        self.len(session_id) == 0
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn append(
        &self,
        session_id: &str,
        key: SignalKey,
        data: String,
    ) -> Result<(), TransportError> {
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_default()
            .insert(key, data);
        Ok(())
    }

    async fn list(&self, session_id: &str) -> Result<Vec<StoredSignal>, TransportError> {
        let guard = self.sessions.read();
        Ok(guard
            .get(session_id)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, data)| StoredSignal {
                        key: key.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove(&self, session_id: &str, key: &SignalKey) -> Result<(), TransportError> {
        if let Some(entries) = self.sessions.write().get_mut(session_id) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn purge_older_than(
        &self,
        session_id: &str,
        cutoff_ms: i64,
    ) -> Result<usize, TransportError> {
        let mut guard = self.sessions.write();
        let Some(entries) = guard.get_mut(session_id) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|key, data| {
            key.time >= cutoff_ms && serde_json::from_str::<serde_json::Value>(data).is_ok()
        });
        Ok(before - entries.len())
    }

    async fn purge_session(
        &self,
        session_id: &str,
        retain: Option<&SignalKey>,
    ) -> Result<usize, TransportError> {
        let mut guard = self.sessions.write();
        let Some(entries) = guard.get_mut(session_id) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|key, _| Some(key) == retain);
        let removed = before - entries.len();
        if entries.is_empty() {
            guard.remove(session_id);
        }
        Ok(removed)
    }
}
