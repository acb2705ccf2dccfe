pub mod bus;
pub mod http;
pub mod memory;
pub mod message;
pub mod transport;

pub use bus::{MessageBus, StoredSignal};
pub use http::HttpBus;
pub use memory::InMemoryBus;
pub use message::{SignalKey, SignalKind, SignalingMessage};
pub use transport::{SignalingTransport, Subscription};
