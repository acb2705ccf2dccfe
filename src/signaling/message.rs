use crate::error::SignalingDecodeError;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::utils::{now_ms, random_id};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Ping,
    Disconnect,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Ping => "ping",
            SignalKind::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage key of a signal: timestamp first so a sorted store replays in
/// best-effort send order, message id to break ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalKey {
    pub time: i64,
    pub message_id: String,
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:013}_{}", self.time, self.message_id)
    }
}

/// Control payload exchanged through the signaling store.
///
/// Wire shape: `{type, payload, sessionId, time, messageId, from}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: Value,
    pub session_id: String,
    #[serde(rename = "time")]
    pub sent_at: i64,
    pub message_id: String,
    /// Publishing peer; a transport skips its own messages.
    #[serde(default)]
    pub from: String,
}

impl SignalingMessage {
    pub fn new(kind: SignalKind, session_id: &str, from: &str, payload: Value) -> Self {
        Self {
            kind,
            payload,
            session_id: session_id.to_string(),
            sent_at: now_ms(),
            message_id: random_id(),
            from: from.to_string(),
        }
    }

    pub fn description(
        session_id: &str,
        from: &str,
        description: &SessionDescription,
    ) -> Result<Self, serde_json::Error> {
        let kind = match description.sdp_type {
            crate::peer::types::SdpType::Offer => SignalKind::Offer,
            crate::peer::types::SdpType::Answer => SignalKind::Answer,
        };
        Ok(Self::new(
            kind,
            session_id,
            from,
            serde_json::to_value(description)?,
        ))
    }

    pub fn candidate(
        session_id: &str,
        from: &str,
        candidate: &IceCandidate,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            SignalKind::Candidate,
            session_id,
            from,
            serde_json::to_value(candidate)?,
        ))
    }

    pub fn ping(session_id: &str, from: &str) -> Self {
        Self::new(
            SignalKind::Ping,
            session_id,
            from,
            Value::String("Looking to connect".into()),
        )
    }

    pub fn disconnect(session_id: &str, from: &str) -> Self {
        Self::new(SignalKind::Disconnect, session_id, from, Value::Null)
    }

    pub fn key(&self) -> SignalKey {
        SignalKey {
            time: self.sent_at,
            message_id: self.message_id.clone(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, SignalingDecodeError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn session_description(&self) -> Result<SessionDescription, SignalingDecodeError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| {
            SignalingDecodeError::Payload {
                kind: self.kind.as_str(),
                source,
            }
        })
    }

    pub fn ice_candidate(&self) -> Result<IceCandidate, SignalingDecodeError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| {
            SignalingDecodeError::Payload {
                kind: self.kind.as_str(),
                source,
            }
        })
    }
}
