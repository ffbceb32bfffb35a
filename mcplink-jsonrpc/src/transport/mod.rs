//! Defines the transport layer.
//!
//! Transports move [`Envelope`]s between the two peers of a connection.  They don't interpret the
//! messages at all; correlation of responses to requests, cancellation and so on live above this
//! layer.
use crate::{Envelope, EnvelopeError};
use std::time::Duration;

mod stdio;
mod stream;

pub use stdio::StdioTransport;
pub use stream::{duplex, DuplexTransport, StreamTransport};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error on transport")]
    Io(#[from] std::io::Error),

    /// The peer sent something that isn't a JSON-RPC envelope.  The transport itself is still
    /// usable.
    #[error("Malformed message from peer")]
    Malformed(#[source] EnvelopeError),

    #[error("Error encoding outgoing message")]
    Encode(#[source] serde_json::Error),

    #[error("Encoded message contains an embedded newline and cannot be framed")]
    EmbeddedNewline,

    #[error("Transport closed")]
    Closed,

    #[error("No message received within {0:?}")]
    Timeout(Duration),

    /// The remote end requires authorization.  The challenge is the `WWW-Authenticate` value, if
    /// the server sent one.
    #[error("Unauthorized")]
    Unauthorized { challenge: Option<String> },

    #[error("HTTP request failed with status {status}")]
    Http { status: u16 },

    #[error("Request to remote endpoint failed")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl TransportError {
    /// Errors after which the transport can keep receiving.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Malformed(_) | TransportError::Timeout(_)
        )
    }
}

/// A bidirectional envelope pipe to the remote peer.
///
/// Implementations must tolerate `send` being called concurrently from multiple tasks while one
/// task is blocked in `receive`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Wait for the next inbound envelope.  `Ok(None)` means the remote end has gone away and no
    /// more messages will ever arrive.
    async fn receive(&self) -> Result<Option<Envelope>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Encode an envelope as one line of newline-delimited JSON, without the trailing newline.
pub(crate) fn encode_line(envelope: &Envelope) -> Result<String, TransportError> {
    let json = envelope.to_json().map_err(TransportError::Encode)?;
    if json.contains('\n') {
        return Err(TransportError::EmbeddedNewline);
    }
    Ok(json)
}
