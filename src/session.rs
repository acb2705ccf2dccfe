use crate::error::{ParleyError, ParleyResult};
use crate::utils::random_room_id;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use url::Url;

/// Which side of the two-party negotiation this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Joiner,
}

/// One negotiated (or attempting-to-negotiate) call. Immutable once made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: String,
    role: Role,
}

impl Session {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_initiator(&self) -> bool {
        self.role == Role::Initiator
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.id, self.role)
    }
}

type IdGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Hands out session ids and roles.
///
/// Joining never checks that the id exists: an unknown id simply never
/// receives signals. Collisions in the 6-digit space are not resolved here.
pub struct RoomRegistry {
    generate: IdGenerator,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomRegistry").finish_non_exhaustive()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            generate: Box::new(random_room_id),
        }
    }

    /// Registry with a fixed id source, used to replay known sessions.
    pub fn with_generator(generate: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self {
            generate: Box::new(generate),
        }
    }

    pub fn create_session(&self) -> Session {
        let id = (self.generate)();
        info!(session_id = %id, "created room");
        Session::new(id, Role::Initiator)
    }

    pub fn join_session(&self, raw_id: &str) -> ParleyResult<Session> {
        let id = Self::normalize_id(raw_id)
            .ok_or_else(|| ParleyError::InvalidSessionId(raw_id.to_string()))?;
        info!(session_id = %id, "joining room");
        Ok(Session::new(id, Role::Joiner))
    }

    /// Keeps only the digits of a user-entered id; `None` when nothing is left.
    pub fn normalize_id(raw_id: &str) -> Option<String> {
        let digits: String = raw_id.chars().filter(char::is_ascii_digit).collect();
        (!digits.is_empty()).then_some(digits)
    }

    /// `<base>?room=<id>`, the link handed to the other party.
    pub fn share_link(base: &str, session_id: &str) -> ParleyResult<Url> {
        let mut url = Url::parse(base)
            .map_err(|err| ParleyError::Config(format!("invalid share base {base}: {err}")))?;
        url.query_pairs_mut().append_pair("room", session_id);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_sessions_are_initiators() {
        let registry = RoomRegistry::with_generator(|| "482913".to_string());
        let session = registry.create_session();
        assert_eq!(session.id(), "482913");
        assert_eq!(session.role(), Role::Initiator);
    }

    #[test]
    fn joining_strips_non_digits() {
        let registry = RoomRegistry::new();
        let session = registry.join_session(" 482-913 ").expect("join");
        assert_eq!(session.id(), "482913");
        assert_eq!(session.role(), Role::Joiner);
    }

    #[test]
    fn joining_an_id_without_digits_fails() {
        let registry = RoomRegistry::new();
        assert!(matches!(
            registry.join_session("room"),
            Err(ParleyError::InvalidSessionId(_))
        ));
    }

    #[test]
    fn joining_an_unknown_id_still_succeeds() {
        let registry = RoomRegistry::new();
        assert!(registry.join_session("000001").is_ok());
    }

    #[test]
    fn share_link_carries_room_query() {
        let url = RoomRegistry::share_link("https://call.example.org/", "482913").expect("url");
        assert_eq!(url.as_str(), "https://call.example.org/?room=482913");
    }
}
