pub mod connection;
pub mod fake;
pub mod ice;
pub mod manager;
pub mod media;
pub mod state;
pub mod types;

pub use connection::{BackendEvent, BackendFactory, NegotiationBackend, WebRtcBackendFactory};
pub use manager::{ManagerOutcome, PeerConnectionManager};
pub use media::{CaptureDevice, ExistingStream, LocalMedia, LocalMediaState, NoCaptureDevice};
pub use state::{DisconnectReason, NegotiationState};
pub use types::{
    IceCandidate, MediaKind, MediaTrack, RemoteTrackInfo, ServerConfig, SessionDescription,
    TransportState,
};
