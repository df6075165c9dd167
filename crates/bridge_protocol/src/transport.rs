use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

use crate::specification::EndpointGroup;

/// Logical channel of a message on the socket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    Backend,
    External,
}

impl Channel {
    /// Channel used to reach a method of `group`. Frontend methods are only
    /// ever answered, never called, so they fall back to the backend channel.
    pub fn for_group(group: EndpointGroup) -> Self {
        match group {
            EndpointGroup::External => Channel::External,
            EndpointGroup::Backend | EndpointGroup::Frontend => Channel::Backend,
        }
    }
}

/// Envelope of one socket text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketFrame {
    pub channel: Channel,
    /// A JSON-RPC message or a chunk, as JSON text.
    pub payload: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("could not connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("send failed: {0}")]
    Send(String),
}

/// Moves serialized payloads to the peer. Implementations never interpret
/// the payload.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, channel: Channel, payload: String) -> Result<(), TransportError>;

    /// Payloads larger than this are fragmented before `send`; `None` means
    /// unbounded.
    fn max_message_size(&self) -> Option<usize> {
        None
    }

    fn is_open(&self) -> bool;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Receives what a transport reads from the peer.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn handle_frame(&self, channel: Channel, text: String);

    /// The underlying connection is gone.
    fn on_disconnect(&self);
}
