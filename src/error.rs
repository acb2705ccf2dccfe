use crate::peer::state::NegotiationState;
use crate::session::Role;
use reqwest::StatusCode;
use thiserror::Error;

/// Hardware capture could not provide local media. Recovered by
/// substituting the synthetic stream, never surfaced to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("no capture device available: {0}")]
    Unavailable(String),
    #[error("capture device returned no tracks")]
    Empty,
}

/// A stored signal that could not be turned into a `SignalingMessage`.
#[derive(Debug, Error)]
pub enum SignalingDecodeError {
    #[error("malformed signaling message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} payload is invalid: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// An operation attempted in a state or role where it is not valid.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationProtocolError {
    #[error("{operation} requires the {expected:?} role, session is {actual:?}")]
    WrongRole {
        operation: &'static str,
        expected: Role,
        actual: Role,
    },
    #[error("{operation} is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: NegotiationState,
    },
    #[error("duplicate offer for a session that is already negotiating ({state:?})")]
    DuplicateOffer { state: NegotiationState },
    #[error("session has not been initialized")]
    NotInitialized,
}

/// Failure of the channel underneath the signaling transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid signaling endpoint: {0}")]
    InvalidUrl(String),
    #[error("signal could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure reported by the negotiation object.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("negotiation object rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },
    #[error("negotiation object is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error(transparent)]
    Protocol(#[from] NegotiationProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),
    #[error("no session: call create_session or join_session first")]
    NoSession,
    #[error("a session is already running, hang up first")]
    SessionActive,
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type ParleyResult<T> = Result<T, ParleyError>;
