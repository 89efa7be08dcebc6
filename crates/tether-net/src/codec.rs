//! Object codec: turns application messages into frame payloads and back.
//!
//! The framing layer treats payloads as opaque bytes. A [`MessageCodec`] owns
//! the mapping between a message type and those bytes, and must embed enough
//! type information to rebuild the right variant without outside hints.
//!
//! [`PostcardCodec`] is the default: it prefixes a protocol version byte and
//! encodes a serde enum with [`postcard`], whose variant index doubles as the
//! wire type tag.

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current wire-protocol version. Prepended to every encoded payload.
pub const PROTOCOL_VERSION: u8 = 1;

/// Errors that can occur while encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload was empty (no version byte).
    #[error("empty payload - no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard serialization or deserialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Serialization collaborator used by connections and registries.
pub trait MessageCodec: Send + Sync + 'static {
    /// The closed set of messages this codec understands.
    type Message: Clone + Send + 'static;

    /// Serialize a message into a payload.
    fn encode(&self, message: &Self::Message) -> Result<Vec<u8>, CodecError>;

    /// Rebuild a message from a payload.
    fn decode(&self, payload: &[u8]) -> Result<Self::Message, CodecError>;
}

/// Versioned postcard encoding for any serde message enum.
///
/// Wire format: `[version: u8] [postcard-encoded message]`
pub struct PostcardCodec<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> PostcardCodec<M> {
    /// Create a codec for `M`.
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<M> Default for PostcardCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for PostcardCodec<M> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for PostcardCodec<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostcardCodec")
            .field("version", &PROTOCOL_VERSION)
            .finish()
    }
}

impl<M> MessageCodec for PostcardCodec<M>
where
    M: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    type Message = M;

    fn encode(&self, message: &M) -> Result<Vec<u8>, CodecError> {
        let body = postcard::to_allocvec(message)?;
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(&self, payload: &[u8]) -> Result<M, CodecError> {
        let Some((&version, body)) = payload.split_first() else {
            return Err(CodecError::EmptyPayload);
        };
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        Ok(postcard::from_bytes(body)?)
    }
}
