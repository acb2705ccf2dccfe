use crate::error::TransportError;
use crate::signaling::message::SignalKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One raw entry of the shared signaling store. `data` is kept as the
/// published JSON text so that malformed entries reach the consumer and are
/// dropped there, one at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSignal {
    pub key: SignalKey,
    pub data: String,
}

/// Shared key-value store the signaling transport polls, scoped by session.
///
/// Implementations must allow concurrent publish and list from any number of
/// sessions; readers never block writers for longer than a map update.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn append(
        &self,
        session_id: &str,
        key: SignalKey,
        data: String,
    ) -> Result<(), TransportError>;

    /// Every entry of the session, sorted by key.
    async fn list(&self, session_id: &str) -> Result<Vec<StoredSignal>, TransportError>;

    async fn remove(&self, session_id: &str, key: &SignalKey) -> Result<(), TransportError>;

    /// Drops entries stamped before `cutoff_ms` and entries that are not
    /// valid JSON. Returns how many were removed.
    async fn purge_older_than(
        &self,
        session_id: &str,
        cutoff_ms: i64,
    ) -> Result<usize, TransportError>;

    /// Drops every entry of the session except `retain`.
    async fn purge_session(
        &self,
        session_id: &str,
        retain: Option<&SignalKey>,
    ) -> Result<usize, TransportError>;
}
