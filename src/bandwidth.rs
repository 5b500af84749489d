//! Host-wide bandwidth allocation.
//!
//! Bandwidth is shared between a host's connected peers by water-filling: peers whose own
//!  bandwidth cap is below their fair share are allocated exactly their cap, and what they
//!  leave unused is shared between the remaining peers. This repeats until no further peer
//!  is capped below the remaining share.
//!
//! The functions here are pure so they can be tested in isolation; the host applies their
//!  results to its peers.

use crate::congestion::PACKET_THROTTLE_SCALE;

/// What a peer consumed of the host's outgoing bandwidth in the last throttle interval, and
///  its own downstream limit
#[derive(Debug, Clone, Copy)]
pub struct PeerDemand {
    /// the peer's advertised incoming bandwidth in bytes/s, `0` meaning unlimited
    pub incoming_bandwidth: u32,
    /// bytes sent to the peer since the last throttle pass
    pub outgoing_data_total: u32,
}

/// Computes every peer's packet throttle limit for the host's outgoing bandwidth.
///
/// Peers with a finite incoming bandwidth that would receive more than that are limited to
///  their own bandwidth first. All other peers get the same limit, scaling the aggregate
///  remaining demand down to the remaining bandwidth.
pub fn packet_throttle_limits(outgoing_bandwidth: u32, elapsed_millis: u32, peers: &[PeerDemand]) -> Vec<u32> {
    let scale = PACKET_THROTTLE_SCALE as u64;
    let elapsed = elapsed_millis as u64;

    // `None` for an unlimited host
    let mut bandwidth = if outgoing_bandwidth == 0 {
        None
    }
    else {
        Some(outgoing_bandwidth as u64 * elapsed / 1000)
    };
    let mut data_total: u64 = peers.iter()
        .map(|p| p.outgoing_data_total as u64)
        .sum();

    let throttle_for = |bandwidth: Option<u64>, data_total: u64| match bandwidth {
        Some(bandwidth) if data_total > bandwidth => bandwidth * scale / data_total,
        _ => scale,
    };

    let mut limits: Vec<Option<u32>> = vec![None; peers.len()];
    let mut peers_remaining = peers.len();
    let mut needs_adjustment = peers.iter().any(|p| p.incoming_bandwidth != 0);

    while peers_remaining > 0 && needs_adjustment {
        needs_adjustment = false;
        let throttle = throttle_for(bandwidth, data_total);

        for (i, peer) in peers.iter().enumerate() {
            if peer.incoming_bandwidth == 0 || limits[i].is_some() {
                continue;
            }

            let peer_bandwidth = peer.incoming_bandwidth as u64 * elapsed / 1000;
            let peer_data = peer.outgoing_data_total as u64;
            if throttle * peer_data / scale <= peer_bandwidth {
                continue;
            }

            let limit = (peer_bandwidth * scale / peer_data).max(1);
            limits[i] = Some(limit as u32);

            needs_adjustment = true;
            peers_remaining -= 1;
            bandwidth = bandwidth.map(|b| b.saturating_sub(peer_bandwidth));
            data_total = data_total.saturating_sub(peer_data);
        }
    }

    let throttle = throttle_for(bandwidth, data_total) as u32;
    limits.into_iter()
        .map(|l| l.unwrap_or(throttle))
        .collect()
}

/// Computes the incoming bandwidth each peer is told to limit its sending to, sharing the
///  host's incoming bandwidth between peers.
///
/// Peers advertising an outgoing bandwidth below the fair share are told their own outgoing
///  bandwidth, the others share the rest equally. An unlimited host (`0`) tells every peer
///  `0`, i.e. unlimited.
pub fn incoming_bandwidth_limits(incoming_bandwidth: u32, peer_outgoing_bandwidths: &[u32]) -> Vec<u32> {
    if incoming_bandwidth == 0 {
        return vec![0; peer_outgoing_bandwidths.len()];
    }

    let mut marked = vec![false; peer_outgoing_bandwidths.len()];
    let mut bandwidth = incoming_bandwidth;
    let mut peers_remaining = peer_outgoing_bandwidths.len() as u32;
    let mut bandwidth_limit = 0;
    let mut needs_adjustment = true;

    while peers_remaining > 0 && needs_adjustment {
        needs_adjustment = false;
        bandwidth_limit = bandwidth / peers_remaining;

        for (i, &outgoing_bandwidth) in peer_outgoing_bandwidths.iter().enumerate() {
            if marked[i] || outgoing_bandwidth == 0 || outgoing_bandwidth >= bandwidth_limit {
                continue;
            }

            marked[i] = true;
            needs_adjustment = true;
            peers_remaining -= 1;
            bandwidth -= outgoing_bandwidth;
        }
    }

    peer_outgoing_bandwidths.iter()
        .zip(marked)
        .map(|(&outgoing_bandwidth, marked)| if marked { outgoing_bandwidth } else { bandwidth_limit })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn demand(incoming_bandwidth: u32, outgoing_data_total: u32) -> PeerDemand {
        PeerDemand { incoming_bandwidth, outgoing_data_total }
    }

    #[rstest]
    #[case::no_peers(8000, vec![], vec![])]
    #[case::unlimited_host(0, vec![demand(0, 100_000), demand(0, 5)], vec![32, 32])]
    #[case::within_bandwidth(8000, vec![demand(0, 2000), demand(0, 2000)], vec![32, 32])]
    #[case::four_equal_peers(8000, vec![demand(0, 4000); 4], vec![16; 4])]
    #[case::uneven_demand(8000, vec![demand(0, 12000), demand(0, 4000)], vec![16, 16])]
    #[case::capped_peer(8000, vec![demand(1000, 4000), demand(0, 8000)], vec![8, 28])]
    #[case::cap_not_binding(8000, vec![demand(100_000, 4000), demand(0, 12000)], vec![16, 16])]
    #[case::unlimited_host_capped_peer(0, vec![demand(1000, 4000), demand(0, 8000)], vec![8, 32])]
    #[case::tiny_cap(8000, vec![demand(10, 100_000)], vec![1])]
    #[case::idle_capped_peer(8000, vec![demand(1000, 0), demand(0, 16000)], vec![16, 16])]
    fn test_packet_throttle_limits(#[case] outgoing_bandwidth: u32, #[case] peers: Vec<PeerDemand>, #[case] expected: Vec<u32>) {
        assert_eq!(packet_throttle_limits(outgoing_bandwidth, 1000, &peers), expected);
    }

    #[test]
    fn test_packet_throttle_limits_scale_with_elapsed_time() {
        let peers = vec![demand(0, 8000); 2];
        assert_eq!(packet_throttle_limits(8000, 1000, &peers), vec![16, 16]);
        assert_eq!(packet_throttle_limits(8000, 2000, &peers), vec![32, 32]);
    }

    #[rstest]
    #[case::unlimited_host(0, vec![100, 0, 5000], vec![0, 0, 0])]
    #[case::equal_share(9000, vec![0, 0, 0], vec![3000, 3000, 3000])]
    #[case::slow_peer(9000, vec![1000, 0, 0], vec![1000, 4000, 4000])]
    #[case::fast_peers(9000, vec![1_000_000, 5000, 0], vec![3000, 3000, 3000])]
    #[case::cascade(10_000, vec![1000, 2500, 0, 0], vec![1000, 2500, 3250, 3250])]
    #[case::all_slow(10_000, vec![100, 200], vec![100, 200])]
    fn test_incoming_bandwidth_limits(#[case] incoming_bandwidth: u32, #[case] peers: Vec<u32>, #[case] expected: Vec<u32>) {
        assert_eq!(incoming_bandwidth_limits(incoming_bandwidth, &peers), expected);
    }

    fn allocated(limit: u32, peer: &PeerDemand) -> u64 {
        limit as u64 * peer.outgoing_data_total as u64 / PACKET_THROTTLE_SCALE as u64
    }

    proptest! {
        #[test]
        fn prop_packet_throttle_limits(
            outgoing_bandwidth in 1u32..10_000_000,
            elapsed_millis in 1000u32..5000,
            peers in prop::collection::vec((prop_oneof![Just(0u32), 1u32..1_000_000], 0u32..10_000_000), 1..32),
        ) {
            let peers = peers.into_iter().map(|(b, d)| demand(b, d)).collect::<Vec<_>>();
            let limits = packet_throttle_limits(outgoing_bandwidth, elapsed_millis, &peers);
            prop_assert_eq!(limits.len(), peers.len());

            for limit in &limits {
                prop_assert!(*limit <= PACKET_THROTTLE_SCALE);
            }

            // peers without a cap of their own are treated alike
            let uncapped = limits.iter().zip(&peers)
                .filter(|(_, p)| p.incoming_bandwidth == 0)
                .map(|(l, _)| *l)
                .collect::<Vec<_>>();
            prop_assert!(uncapped.windows(2).all(|w| w[0] == w[1]));

            // a limit of at least 1 is granted to capped peers even if their cap rounds
            //  down to zero, which is the only way to exceed the host's bandwidth
            let bandwidth = outgoing_bandwidth as u64 * elapsed_millis as u64 / 1000;
            let slack: u64 = limits.iter().zip(&peers)
                .filter(|(l, _)| **l == 1)
                .map(|(_, p)| p.outgoing_data_total as u64 / PACKET_THROTTLE_SCALE as u64)
                .sum();
            let total: u64 = limits.iter().zip(&peers)
                .map(|(l, p)| allocated(*l, p))
                .sum();
            prop_assert!(total <= bandwidth + slack, "allocated {} of {}", total, bandwidth);
        }

        #[test]
        fn prop_incoming_bandwidth_limits(
            incoming_bandwidth in 1u32..100_000_000,
            peers in prop::collection::vec(prop_oneof![Just(0u32), 1u32..10_000_000], 1..32),
        ) {
            let limits = incoming_bandwidth_limits(incoming_bandwidth, &peers);
            prop_assert_eq!(limits.len(), peers.len());

            let total: u64 = limits.iter().map(|l| *l as u64).sum();
            prop_assert!(total <= incoming_bandwidth as u64);

            // a peer told its own bandwidth is really capped below what everybody else gets
            let shared = limits.iter().zip(&peers)
                .filter(|(l, p)| **l != **p || **p == 0)
                .map(|(l, _)| *l)
                .max();
            match shared {
                Some(shared) => for (limit, peer) in limits.iter().zip(&peers) {
                    prop_assert!(*limit == shared || (*limit == *peer && *peer < shared));
                },
                None => for (limit, peer) in limits.iter().zip(&peers) {
                    prop_assert_eq!(*limit, *peer);
                },
            }
        }
    }
}
