//! Protocol-wide limits. These are part of the wire contract and must be identical on both
//!  sides of a connection.

pub const MINIMUM_MTU: u32 = 576;
pub const MAXIMUM_MTU: u32 = 4096;

/// upper bound for the number of commands packed into a single datagram
pub const MAXIMUM_PACKET_COMMANDS: usize = 32;

pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;

pub const MINIMUM_CHANNEL_COUNT: usize = 1;
pub const MAXIMUM_CHANNEL_COUNT: usize = 255;

pub const MAXIMUM_PEER_ID: u16 = 0xFFF;
pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;

/// Window size is negotiated from bandwidth: one window per this many bytes/s of bandwidth
pub const WINDOW_SIZE_SCALE: u32 = 64 * 1024;

/// Clamps a window size (derived from bandwidth or requested by the remote peer) to the
///  protocol's range
pub fn clamp_window_size(window_size: u32) -> u32 {
    window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
}

/// Derives the window size a peer should use from a bandwidth figure, `0` meaning unlimited
pub fn window_size_for_bandwidth(bandwidth: u32) -> u32 {
    if bandwidth == 0 {
        MAXIMUM_WINDOW_SIZE
    }
    else {
        clamp_window_size((bandwidth / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE)
    }
}

/// The window size for sending to a peer, derived from this host's outgoing bandwidth and the
///  peer's incoming bandwidth: the more restrictive of both if both are limited
pub fn negotiated_window_size(outgoing_bandwidth: u32, peer_incoming_bandwidth: u32) -> u32 {
    match (outgoing_bandwidth, peer_incoming_bandwidth) {
        (0, 0) => MAXIMUM_WINDOW_SIZE,
        (0, b) | (b, 0) => clamp_window_size((b / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE),
        (a, b) => clamp_window_size((a.min(b) / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE),
    }
}

pub fn clamp_mtu(mtu: u32) -> u32 {
    mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU)
}
