//! Error types that can occur in this crate.

/// Error thrown when decoding a UDP packet.
#[derive(Debug, thiserror::Error)]
pub enum DecodePacketError {
    /// Failed to RLP decode the packet payload.
    #[error("failed to rlp decode: {0}")]
    Rlp(#[from] alloy_rlp::Error),
    /// Received packet length is shorter than the packet header.
    #[error("received packet length is too short")]
    PacketTooShort,
    /// Header hash does not match the hash of the remaining datagram.
    #[error("header/data hash mismatch")]
    HashMismatch,
    /// Message type byte is not a known discv4 message.
    #[error("message type {0} is not supported")]
    UnknownMessage(u8),
    /// Failed to recover the sender's public key from the signature.
    #[error("failed to recover public key: {0}")]
    Secp256k1(#[from] secp256k1::Error),
}

/// All error variants of the discv4 engine.
///
/// `Expired`, `UnsolicitedReply` and `UnknownNode` are only ever returned from
/// [`Discv4Service::handle_datagram`](crate::Discv4Service::handle_datagram). `Timeout` and
/// `Closed` are delivered to the caller of a request.
#[derive(Debug, thiserror::Error)]
pub enum Discv4Error {
    /// The packet's expiration timestamp lies in the past.
    #[error("packet expired")]
    Expired,
    /// A reply that doesn't belong to any pending request.
    #[error("unsolicited reply")]
    UnsolicitedReply,
    /// A request from a node we haven't bonded with.
    #[error("unknown node")]
    UnknownNode,
    /// No (complete) reply arrived before the request deadline.
    #[error("RPC timeout")]
    Timeout,
    /// The service terminated before the request completed.
    #[error("discv4 service closed")]
    Closed,
    /// Failed to decode the datagram.
    #[error(transparent)]
    Decode(#[from] DecodePacketError),
}

// === impl Discv4Error ===

impl Discv4Error {
    /// Returns true if the request timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Discv4Error::Timeout)
    }

    /// Returns true if the request failed because the service shut down.
    ///
    /// Requests that fail this way should not be retried.
    pub fn is_closed(&self) -> bool {
        matches!(self, Discv4Error::Closed)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Discv4Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Discv4Error::Closed
    }
}
