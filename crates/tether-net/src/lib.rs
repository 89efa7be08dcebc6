//! TCP networking: length-prefixed framing, message reassembly, connections,
//! the connection registry, and the online content service protocol.

pub mod codec;
pub mod connection;
pub mod events;
pub mod framing;
pub mod messages;
pub mod platform;
pub mod reassembly;
pub mod registry;
pub mod service;
pub mod service_host;

pub use codec::{CodecError, MessageCodec, PROTOCOL_VERSION, PostcardCodec};
pub use connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionId, ConnectionOptions,
    ConnectionState, ConnectionStateWatch, IdGenerator, WeakConnection,
};
pub use events::{ObserverList, SubscriptionId};
pub use framing::{
    FrameError, MAX_MESSAGE_LENGTH, decode_length, encode_frame, read_frame, write_frame,
    write_length_header,
};
pub use messages::Message;
pub use platform::SocketConfig;
pub use reassembly::{MessageReassembler, PendingMessage};
pub use registry::{
    BroadcastReport, ConnectionRegistry, RegistryConfig, RegistryError, RegistryEvent,
};
pub use service::{
    NoopHandler, OnlineServiceConnection, Readiness, ReadyTimeouts, ServiceError, ServiceEvent,
    ServiceHandler, ServiceSession, SessionState, ready_timeout,
};
pub use service_host::{AcceptAnyKey, Authenticator, OnlineServiceHost};

/// Connection carrying service [`Message`]s.
pub type MessageConnection = Connection<PostcardCodec<Message>>;

/// Registry of connections carrying service [`Message`]s.
pub type MessageRegistry = ConnectionRegistry<PostcardCodec<Message>>;

#[cfg(test)]
#[path = "end_to_end_tests.rs"]
mod end_to_end_tests;
