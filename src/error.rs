use thiserror::Error;

/// Failure to queue a packet for sending. Nothing was queued when this is returned.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("peer is not connected")]
    NotConnected,
    #[error("channel {0} does not exist for this peer")]
    InvalidChannel(u8),
    #[error("packet of {0} bytes is too large")]
    TooLarge(usize),
    #[error("outgoing queue is full")]
    QueueOverflow,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no free peer slot")]
    NoFreePeer,
}

/// Errors surfaced by the service loop. Protocol state that was changed before the error
///  occurred is kept, and events that were already dispatched remain queued.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}
