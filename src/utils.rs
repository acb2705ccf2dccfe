use crate::peer::types::ServerConfig;
use rand::Rng;

/// Upper bound (exclusive) of the numeric room id space.
pub const ROOM_ID_SPACE: u32 = 1_000_000;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Numeric room id as users type it in, e.g. `"482913"`.
pub fn random_room_id() -> String {
    rand::rng().random_range(0..ROOM_ID_SPACE).to_string()
}

/// Wall-clock epoch milliseconds, the `time` field of every signal.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Adds the protocol scheme to a relay server URL when it is missing
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: &str, url: &str) -> ServerConfig {
        ServerConfig {
            id: "test".into(),
            r#type: kind.into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn scheme_is_added_from_server_type() {
        assert_eq!(
            add_ice_url_scheme(&server("turn", "relay.example.org:3478")),
            "turn:relay.example.org:3478"
        );
        assert_eq!(
            add_ice_url_scheme(&server("stun", "stun.example.org:19302")),
            "stun:stun.example.org:19302"
        );
    }

    #[test]
    fn existing_scheme_is_kept() {
        assert_eq!(
            add_ice_url_scheme(&server("turn", "stun:stun.l.google.com:19302")),
            "stun:stun.l.google.com:19302"
        );
    }

    #[test]
    fn room_ids_are_decimal_and_in_range() {
        for _ in 0..64 {
            let id = random_room_id();
            let value: u32 = id.parse().expect("decimal id");
            assert!(value < ROOM_ID_SPACE);
        }
    }

    #[test]
    fn random_ids_are_hex() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
