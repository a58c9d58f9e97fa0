//! A reconnecting Phoenix channels client: connection manager, socket frame
//! multiplexer, per-channel state machine, push/reply objects, and a
//! presence diff/merge engine.

pub mod channel;
pub mod clock;
pub mod connection_manager;
mod delayed_attempt;
pub mod error;
pub mod logger;
pub mod message;
pub mod options;
pub mod presence;
pub mod push;
pub mod serializer;
pub mod socket;
pub mod transport;

pub use channel::{Channel, ChannelLifecycle};
pub use clock::{Clock, TokioClock};
pub use error::PhoenixError;
pub use logger::{Level, Logger, NoopLogger, PrintLogger};
pub use message::{Message, PushResponse};
pub use options::{ParamsFn, SerializerKind, SocketOptions, SocketOptionsBuilder};
pub use presence::{Presence, PresenceEntry, PresenceOptions};
pub use push::Push;
pub use serializer::{BinarySerializer, Encoded, Frame, JsonSerializer, Serializer};
pub use socket::PhoenixSocket;
pub use transport::{Transport, TransportConnection, TransportFrame, TungsteniteTransport};
