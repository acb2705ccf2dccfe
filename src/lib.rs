pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod timer;
pub mod utils;

pub use collaborators::{MediaSink, NullSink, Speaker, TranscriptHook};
pub use config::SessionConfig;
pub use controller::{signal_bus, ConnectionLifecycleController, ControllerSnapshot};
pub use error::{ParleyError, ParleyResult};
pub use peer::{DisconnectReason, NegotiationState, PeerConnectionManager};
pub use session::{Role, RoomRegistry, Session};
pub use signaling::{HttpBus, InMemoryBus, MessageBus, SignalingMessage, SignalingTransport};
