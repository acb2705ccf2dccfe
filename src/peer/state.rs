//! Negotiation state machine as a pure function.
//!
//! `transition` never touches the network, the clock or the negotiation
//! object. It returns the next state and the effects the caller must run,
//! so every ordering of offers, answers, candidates, transport reports and
//! timer expiry can be checked without sockets.

use crate::error::NegotiationProtocolError;
use crate::peer::types::{IceCandidate, SessionDescription, TransportState};
use crate::session::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    AwaitingRemoteOffer,
    AwaitingRemoteAnswer,
    IceExchange,
    Connected,
    Disconnected,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Disconnected | NegotiationState::Failed)
    }
}

/// Why `onDisconnected` fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No connection within the connect timeout.
    Timeout,
    /// The other party sent a disconnect signal.
    RemoteHangUp,
    /// The transport reported failed/closed/disconnected.
    TransportLost,
    /// The negotiation object rejected an offer, answer or description.
    NegotiationFailed,
    /// This side hung up before any other outcome was reported.
    LocalHangUp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Joiner starts listening for the initiator's offer.
    Listen,
    /// Initiator places the call.
    Call,
    OfferReceived(SessionDescription),
    AnswerReceived(SessionDescription),
    CandidateReceived(IceCandidate),
    /// Remote party announced itself with a ping.
    PeerPing,
    RemoteHangUp,
    Transport(TransportState),
    RemoteTrack,
    NegotiationFailed,
    TimedOut,
    Teardown,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Listen => "listen",
            Event::Call => "call",
            Event::OfferReceived(_) => "offer",
            Event::AnswerReceived(_) => "answer",
            Event::CandidateReceived(_) => "candidate",
            Event::PeerPing => "ping",
            Event::RemoteHangUp => "remote hang-up",
            Event::Transport(_) => "transport state",
            Event::RemoteTrack => "remote track",
            Event::NegotiationFailed => "negotiation failure",
            Event::TimedOut => "timeout",
            Event::Teardown => "teardown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    CreateOffer,
    ResendOffer,
    AnswerOffer(SessionDescription),
    ApplyAnswer(SessionDescription),
    /// Apply now if the remote description is set, otherwise buffer.
    ApplyCandidate(IceCandidate),
    NotifyConnected,
    NotifyDisconnected(DisconnectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: NegotiationState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(state: NegotiationState) -> Self {
        Self {
            state,
            effects: Vec::new(),
        }
    }

    fn with(state: NegotiationState, effect: Effect) -> Self {
        Self {
            state,
            effects: vec![effect],
        }
    }
}

pub fn transition(
    role: Role,
    state: NegotiationState,
    event: Event,
) -> Result<Transition, NegotiationProtocolError> {
    use NegotiationState::*;

    let invalid = |operation: &'static str| NegotiationProtocolError::InvalidState { operation, state };

    match event {
        Event::Teardown => Ok(Transition::to(Disconnected)),

        Event::Listen => match (role, state) {
            (Role::Joiner, Idle) => Ok(Transition::to(AwaitingRemoteOffer)),
            (Role::Joiner, AwaitingRemoteOffer) => Ok(Transition::to(state)),
            (Role::Initiator, _) => Err(NegotiationProtocolError::WrongRole {
                operation: "listen",
                expected: Role::Joiner,
                actual: role,
            }),
            _ => Err(invalid("listen")),
        },

        Event::Call => match (role, state) {
            (Role::Initiator, Idle) => Ok(Transition::with(AwaitingRemoteAnswer, Effect::CreateOffer)),
            (Role::Joiner, _) => Err(NegotiationProtocolError::WrongRole {
                operation: "create offer",
                expected: Role::Initiator,
                actual: role,
            }),
            _ => Err(invalid("create offer")),
        },

        Event::OfferReceived(offer) => match (role, state) {
            (Role::Joiner, Idle | AwaitingRemoteOffer) => {
                Ok(Transition::with(IceExchange, Effect::AnswerOffer(offer)))
            }
            (Role::Joiner, AwaitingRemoteAnswer | IceExchange | Connected) => {
                Err(NegotiationProtocolError::DuplicateOffer { state })
            }
            (Role::Initiator, _) => Err(NegotiationProtocolError::WrongRole {
                operation: "handle offer",
                expected: Role::Joiner,
                actual: role,
            }),
            _ => Err(invalid("handle offer")),
        },

        Event::AnswerReceived(answer) => match state {
            AwaitingRemoteAnswer => Ok(Transition::with(IceExchange, Effect::ApplyAnswer(answer))),
            _ => Err(invalid("handle answer")),
        },

        // Candidates may overtake the offer on an unordered store, so they
        // are accepted before the remote description exists and buffered.
        Event::CandidateReceived(candidate) => {
            if state.is_terminal() {
                Err(invalid("handle candidate"))
            } else {
                Ok(Transition::with(state, Effect::ApplyCandidate(candidate)))
            }
        }

        Event::PeerPing => match (role, state) {
            (Role::Initiator, AwaitingRemoteAnswer) => {
                Ok(Transition::with(state, Effect::ResendOffer))
            }
            _ => Ok(Transition::to(state)),
        },

        Event::RemoteHangUp => match state {
            AwaitingRemoteAnswer | IceExchange | Connected => Ok(Transition::with(
                Disconnected,
                Effect::NotifyDisconnected(DisconnectReason::RemoteHangUp),
            )),
            _ => Err(invalid("handle remote hang-up")),
        },

        Event::Transport(TransportState::Connected) | Event::RemoteTrack => match state {
            IceExchange => Ok(Transition::with(Connected, Effect::NotifyConnected)),
            Connected => Ok(Transition::to(Connected)),
            _ => Err(invalid("mark connected")),
        },

        Event::Transport(TransportState::Connecting) => Ok(Transition::to(state)),

        Event::Transport(
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed,
        ) => match state {
            IceExchange | Connected => Ok(Transition::with(
                Disconnected,
                Effect::NotifyDisconnected(DisconnectReason::TransportLost),
            )),
            _ => Ok(Transition::to(state)),
        },

        Event::NegotiationFailed => {
            if state.is_terminal() {
                Ok(Transition::to(state))
            } else {
                Ok(Transition::with(
                    Failed,
                    Effect::NotifyDisconnected(DisconnectReason::NegotiationFailed),
                ))
            }
        }

        Event::TimedOut => match state {
            Connected | Disconnected | Failed => Ok(Transition::to(state)),
            _ => Ok(Transition::with(
                Disconnected,
                Effect::NotifyDisconnected(DisconnectReason::Timeout),
            )),
        },
    }
}
