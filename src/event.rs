use crate::packet::Packet;
use crate::peer::PeerId;

/// Something the application needs to know about, returned by the host's service loop
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection was established, either initiated by this host or accepted. `data` is
    ///  the value the initiating side passed to `connect`.
    Connect { peer: PeerId, data: u32 },
    /// A connection was closed, timed out or failed to be established. `data` is the value
    ///  the remote side passed when disconnecting, or `0`.
    Disconnect { peer: PeerId, data: u32 },
    Receive { peer: PeerId, channel_id: u8, packet: Packet },
}

impl Event {
    pub fn peer(&self) -> PeerId {
        match self {
            Event::Connect { peer, .. } => *peer,
            Event::Disconnect { peer, .. } => *peer,
            Event::Receive { peer, .. } => *peer,
        }
    }
}
