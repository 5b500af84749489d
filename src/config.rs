use crate::checksum::Checksum;
use crate::compressor::Compressor;
use crate::protocol::{MAXIMUM_CHANNEL_COUNT, MAXIMUM_MTU, MAXIMUM_PEER_ID, MINIMUM_CHANNEL_COUNT, MINIMUM_MTU};
use anyhow::bail;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MTU: u32 = 1400;
pub const DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;

/// Configuration of a [crate::host::Host]. It is shared with all of the host's peers and does
///  not change after the host is created - values that can be changed at runtime (bandwidth
///  limits, channel limit) are initial values.
#[derive(Clone)]
pub struct HostConfig {
    /// Number of peer slots, i.e. the maximum number of simultaneous connections
    pub peer_count: usize,

    /// Maximum number of channels accepted for incoming connections
    pub channel_limit: usize,

    /// Downstream bandwidth of the host in bytes/second, `0` meaning unlimited. Remote peers
    ///  are told to limit their sending accordingly.
    pub incoming_bandwidth: u32,

    /// Upstream bandwidth of the host in bytes/second, `0` meaning unlimited. This is shared
    ///  between peers by throttling them.
    pub outgoing_bandwidth: u32,

    /// The maximum datagram size this host sends. The effective MTU of a connection is the
    ///  smaller of both sides' values.
    ///
    /// Choosing this value too big causes datagrams to be fragmented at IP level or dropped
    ///  by network hardware. Choosing it too small wastes bandwidth.
    pub mtu: u32,

    /// Upper bound for the size of a single application packet, both sent and received
    pub maximum_packet_size: usize,

    /// Upper bound for data that was received but not yet consumed by the application, per
    ///  peer. When this is exceeded, further data is not acknowledged, so the sender retries
    ///  later.
    ///
    /// This bound is also applied to a peer's queued outgoing data.
    pub maximum_waiting_data: usize,

    /// Maximum number of peers connected from the same remote IP address
    pub duplicate_peers: usize,

    /// An idle peer sends a ping after this interval to keep the connection alive and the
    ///  RTT estimate current
    pub ping_interval: Duration,

    /// Retransmission timeouts double up to this factor before the peer is considered lost
    pub timeout_limit: u32,
    pub timeout_minimum: Duration,
    pub timeout_maximum: Duration,

    pub packet_throttle_interval: Duration,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,

    /// This is the number of datagram buffers that will be pooled at a given time - buffers
    ///  in excess of this number are discarded when they are returned.
    pub buffer_pool_size: usize,

    pub checksum: Option<Arc<dyn Checksum>>,
    pub compressor: Option<Arc<dyn Compressor>>,
}

impl HostConfig {
    pub fn new(peer_count: usize) -> HostConfig {
        HostConfig {
            peer_count,
            channel_limit: MAXIMUM_CHANNEL_COUNT,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            mtu: DEFAULT_MTU,
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: DEFAULT_MAXIMUM_WAITING_DATA,
            duplicate_peers: MAXIMUM_PEER_ID as usize,
            ping_interval: Duration::from_millis(500),
            timeout_limit: 32,
            timeout_minimum: Duration::from_millis(5000),
            timeout_maximum: Duration::from_millis(30000),
            packet_throttle_interval: Duration::from_millis(5000),
            packet_throttle_acceleration: 2,
            packet_throttle_deceleration: 2,
            buffer_pool_size: 64,
            checksum: None,
            compressor: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.peer_count == 0 || self.peer_count > MAXIMUM_PEER_ID as usize {
            bail!("peer count must be in [1, {}], was {}", MAXIMUM_PEER_ID, self.peer_count);
        }
        if self.mtu < MINIMUM_MTU || self.mtu > MAXIMUM_MTU {
            bail!("MTU must be in [{}, {}], was {}", MINIMUM_MTU, MAXIMUM_MTU, self.mtu);
        }
        if self.maximum_packet_size == 0 {
            bail!("maximum packet size must be positive");
        }
        if self.timeout_minimum > self.timeout_maximum {
            bail!("minimum timeout {:?} exceeds maximum timeout {:?}", self.timeout_minimum, self.timeout_maximum);
        }
        if self.timeout_limit == 0 {
            bail!("timeout limit must be positive");
        }
        Ok(())
    }

    /// The channel limit, clamped to the protocol's range
    pub fn effective_channel_limit(&self) -> usize {
        clamp_channel_count(self.channel_limit)
    }

    /// Number of bytes the checksum adds to every datagram's header
    pub fn checksum_len(&self) -> usize {
        if self.checksum.is_some() { 4 } else { 0 }
    }
}

pub fn clamp_channel_count(channel_count: usize) -> usize {
    channel_count.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Crc32Checksum;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        let config = HostConfig::new(32);
        assert!(config.validate().is_ok());
        assert_eq!(config.checksum_len(), 0);
        assert_eq!(config.effective_channel_limit(), 255);
    }

    #[rstest]
    #[case::no_peers(|c: &mut HostConfig| c.peer_count = 0)]
    #[case::too_many_peers(|c: &mut HostConfig| c.peer_count = 0x1000)]
    #[case::mtu_too_small(|c: &mut HostConfig| c.mtu = 500)]
    #[case::mtu_too_big(|c: &mut HostConfig| c.mtu = 5000)]
    #[case::no_packet_size(|c: &mut HostConfig| c.maximum_packet_size = 0)]
    #[case::timeouts_reversed(|c: &mut HostConfig| c.timeout_minimum = Duration::from_secs(60))]
    #[case::no_timeout_limit(|c: &mut HostConfig| c.timeout_limit = 0)]
    fn test_validate_rejects(#[case] modify: fn(&mut HostConfig)) {
        let mut config = HostConfig::new(8);
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_checksum_len() {
        let mut config = HostConfig::new(8);
        config.checksum = Some(Arc::new(Crc32Checksum));
        assert_eq!(config.checksum_len(), 4);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(17, 17)]
    #[case(255, 255)]
    #[case(1000, 255)]
    fn test_clamp_channel_count(#[case] requested: usize, #[case] expected: usize) {
        assert_eq!(clamp_channel_count(requested), expected);
    }
}
