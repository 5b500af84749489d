use crate::bandwidth::{incoming_bandwidth_limits, packet_throttle_limits, PeerDemand};
use crate::buffer_pool::BufferPool;
use crate::channel::Channel;
use crate::commands::{CommandBody, CommandFlags, ConnectParams, NO_CHANNEL};
use crate::config::{clamp_channel_count, HostConfig};
use crate::error::{ConnectError, HostError};
use crate::event::Event;
use crate::packet::Packet;
use crate::peer::{Peer, PeerId, PeerState};
use crate::protocol::{window_size_for_bandwidth, MAXIMUM_CHANNEL_COUNT, MAXIMUM_MTU};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::socket::DatagramSocket;
use crate::time::{time_difference, ServiceClock};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Interval of the host-wide bandwidth throttle pass, in milliseconds
pub const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;

/// Traffic counters of a host since its creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStatistics {
    pub total_sent_data: u64,
    pub total_sent_packets: u64,
    pub total_received_data: u64,
    pub total_received_packets: u64,
}

/// A host is a fixed set of peer slots sharing one datagram socket. It initiates and accepts
///  connections, and all protocol processing happens in calls to [Host::service] and
///  [Host::flush] - there is no background task. Applications typically call `service`
///  in a loop, handling the events it returns.
pub struct Host {
    pub(crate) config: Arc<HostConfig>,
    pub(crate) socket: Arc<dyn DatagramSocket>,
    pub(crate) peers: Vec<Peer>,
    pub(crate) buffer_pool: BufferPool,
    pub(crate) receive_buffer: Vec<u8>,
    clock: ServiceClock,
    pub(crate) service_time: u32,

    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) channel_limit: usize,
    bandwidth_throttle_epoch: u32,
    pub(crate) recalculate_bandwidth_limits: bool,

    /// peers with pending events, each queued at most once while its `needs_dispatch` is set
    pub(crate) dispatch_queue: VecDeque<PeerId>,
    /// (address, connect id) of recently accepted connections, oldest first
    pub(crate) accepted_connects: VecDeque<(SocketAddr, u32)>,

    pub(crate) total_sent_data: u64,
    pub(crate) total_sent_packets: u64,
    pub(crate) total_received_data: u64,
    pub(crate) total_received_packets: u64,
}

impl Host {
    pub fn new(config: HostConfig, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<Host> {
        config.validate()?;
        let config = Arc::new(config);

        let peers = (0..config.peer_count)
            .map(|index| Peer::new(PeerId(index), config.clone()))
            .collect();

        Ok(Host {
            buffer_pool: BufferPool::new(config.mtu.safe_cast(), config.buffer_pool_size),
            receive_buffer: vec![0; MAXIMUM_MTU.safe_cast()],
            clock: ServiceClock::new(),
            service_time: 0,
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            channel_limit: config.effective_channel_limit(),
            bandwidth_throttle_epoch: 0,
            recalculate_bandwidth_limits: false,
            dispatch_queue: VecDeque::new(),
            accepted_connects: VecDeque::new(),
            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,
            config,
            socket,
            peers,
        })
    }

    /// Creates a host on a UDP socket bound to `addr`
    pub async fn bind(addr: SocketAddr, config: HostConfig) -> anyhow::Result<Host> {
        let socket = UdpSocket::bind(addr).await?;
        info!("binding host to {:?}", socket.local_addr()?);
        Host::new(config, Arc::new(socket))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn peer(&self, peer: PeerId) -> &Peer {
        &self.peers[peer.0]
    }

    pub fn peer_mut(&mut self, peer: PeerId) -> &mut Peer {
        &mut self.peers[peer.0]
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn statistics(&self) -> HostStatistics {
        HostStatistics {
            total_sent_data: self.total_sent_data,
            total_sent_packets: self.total_sent_packets,
            total_received_data: self.total_received_data,
            total_received_packets: self.total_received_packets,
        }
    }

    /// Initiates a connection in the first free peer slot. The channel count is clamped to
    ///  the protocol's range. The handshake happens in subsequent calls to [Host::service],
    ///  which reports an [Event::Connect] when it completes, or an [Event::Disconnect] if it
    ///  fails.
    pub fn connect(&mut self, address: SocketAddr, channel_count: usize, data: u32) -> Result<PeerId, ConnectError> {
        let channel_count = clamp_channel_count(channel_count);
        let Some(index) = self.peers.iter().position(|p| p.state == PeerState::Disconnected) else {
            return Err(ConnectError::NoFreePeer);
        };

        let (incoming_bandwidth, outgoing_bandwidth) = (self.incoming_bandwidth, self.outgoing_bandwidth);
        let peer = &mut self.peers[index];

        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::Connecting;
        peer.address = Some(address);
        peer.connect_id = rand::random();
        peer.window_size = window_size_for_bandwidth(outgoing_bandwidth);

        let params = ConnectParams {
            outgoing_peer_id: index.prechecked_cast(),
            incoming_session_id: peer.incoming_session_id,
            outgoing_session_id: peer.outgoing_session_id,
            mtu: peer.mtu,
            window_size: peer.window_size,
            channel_count: channel_count.prechecked_cast(),
            incoming_bandwidth,
            outgoing_bandwidth,
            packet_throttle_interval: peer.congestion.packet_throttle_interval,
            packet_throttle_acceleration: peer.congestion.packet_throttle_acceleration,
            packet_throttle_deceleration: peer.congestion.packet_throttle_deceleration,
            connect_id: peer.connect_id,
        };

        info!("connecting peer {:?} to {:?} with {} channels, connect id {:#x}", peer.id, address, channel_count, peer.connect_id);
        peer.queue_command(CommandFlags::ACKNOWLEDGE, NO_CHANNEL, CommandBody::Connect { params, data });
        Ok(PeerId(index))
    }

    /// Requests a graceful disconnect, see [Peer::disconnect]. A peer that is not connected
    ///  yet is flushed and reset right away.
    pub async fn disconnect(&mut self, peer: PeerId, data: u32) -> Result<(), HostError> {
        self.peers[peer.0].disconnect(data);
        if self.peers[peer.0].reset_after_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Disconnects once all queued outgoing data was delivered, see [Peer::disconnect_later]
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) {
        self.peers[peer.0].disconnect_later(data);
    }

    /// Sends an unacknowledged Disconnect and resets the peer immediately. No
    ///  [Event::Disconnect] is reported for the peer.
    pub async fn disconnect_now(&mut self, peer: PeerId, data: u32) -> Result<(), HostError> {
        let state = self.peers[peer.0].state;
        if state == PeerState::Disconnected {
            return Ok(());
        }

        let mut result = Ok(());
        if state != PeerState::Zombie && state != PeerState::Disconnecting {
            let p = &mut self.peers[peer.0];
            p.reset_queues();
            p.queue_command(CommandFlags::UNSEQUENCED, NO_CHANNEL, CommandBody::Disconnect { data });
            result = self.flush().await;
        }

        info!("disconnected peer {:?} from {:?}", peer, self.peers[peer.0].address);
        self.reset_peer(peer);
        result
    }

    /// Resets a peer without telling the remote side, which will eventually time out
    pub fn reset_peer(&mut self, peer: PeerId) {
        if self.peers[peer.0].state >= PeerState::ConnectionPending {
            self.recalculate_bandwidth_limits = true;
        }
        self.peers[peer.0].reset();
    }

    /// Queues a packet for all connected peers. The packet's data is shared, not copied.
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        for peer in &mut self.peers {
            if peer.state != PeerState::Connected {
                continue;
            }
            if let Err(e) = peer.send(channel_id, packet.clone()) {
                debug!("broadcast to peer {:?} failed: {}", peer.id, e);
            }
        }
    }

    /// Changes the host's bandwidth in bytes/s, `0` meaning unlimited. Connected peers are
    ///  told the new limits at the next bandwidth throttle pass.
    pub fn set_bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        self.incoming_bandwidth = incoming_bandwidth;
        self.outgoing_bandwidth = outgoing_bandwidth;
        self.recalculate_bandwidth_limits = true;
    }

    /// Limits the number of channels accepted for incoming connections. `0` means the
    ///  protocol's maximum.
    pub fn set_channel_limit(&mut self, channel_limit: usize) {
        self.channel_limit = if channel_limit == 0 {
            MAXIMUM_CHANNEL_COUNT
        }
        else {
            clamp_channel_count(channel_limit)
        };
    }

    /// Returns the next pending event without any I/O
    pub fn check_events(&mut self) -> Option<Event> {
        self.dispatch_incoming_commands()
    }

    /// Sends all queued commands without receiving or waiting
    pub async fn flush(&mut self) -> Result<(), HostError> {
        self.service_time = self.clock.now();
        self.send_outgoing_commands(false).await
    }

    /// Runs the protocol: sends queued commands and retransmissions, detects timeouts and
    ///  handles received datagrams, returning the first resulting event. If there is none,
    ///  this waits up to `timeout` for incoming datagrams.
    ///
    /// A transport error is returned as is. Protocol state and pending events are kept, so
    ///  `service` can be called again afterwards.
    pub async fn service(&mut self, timeout: Duration) -> Result<Option<Event>, HostError> {
        if let Some(event) = self.dispatch_incoming_commands() {
            return Ok(Some(event));
        }

        let deadline = Instant::now() + timeout;
        loop {
            self.service_time = self.clock.now();
            if time_difference(self.service_time, self.bandwidth_throttle_epoch) >= BANDWIDTH_THROTTLE_INTERVAL {
                self.bandwidth_throttle();
            }

            self.send_outgoing_commands(true).await?;
            self.receive_incoming_commands()?;
            self.send_outgoing_commands(true).await?;

            if let Some(event) = self.dispatch_incoming_commands() {
                return Ok(Some(event));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            match tokio::time::timeout(deadline - now, self.socket.wait_readable()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("error waiting for datagrams: {}", e);
                    return Err(HostError::Transport(e));
                }
                Err(_) => return Ok(None),
            }
        }
    }

    /// Queues a peer for dispatch if its code asked for it
    pub(crate) fn collect_dispatch(&mut self, index: usize) {
        let peer = &mut self.peers[index];
        if !peer.dispatch_requested {
            return;
        }
        peer.dispatch_requested = false;

        if !peer.needs_dispatch {
            peer.needs_dispatch = true;
            self.dispatch_queue.push_back(peer.id);
        }
    }

    /// A handshake completed: the initiating side reports the connection as succeeded, the
    ///  accepting side as pending. Both become Connected when the event is dispatched.
    pub(crate) fn notify_connect(&mut self, index: usize) {
        self.recalculate_bandwidth_limits = true;

        let peer = &mut self.peers[index];
        let state = if peer.state == PeerState::Connecting {
            PeerState::ConnectionSucceeded
        }
        else {
            PeerState::ConnectionPending
        };
        peer.dispatch_state(state);
    }

    /// A connection ended. Peers the application never saw as connected are reset silently,
    ///  the others become zombies until their Disconnect event is dispatched.
    pub(crate) fn notify_disconnect(&mut self, index: usize) {
        let peer = &mut self.peers[index];
        if peer.state >= PeerState::ConnectionPending {
            self.recalculate_bandwidth_limits = true;
        }

        if peer.state != PeerState::Connecting && peer.state < PeerState::ConnectionSucceeded {
            debug!("peer {:?}: connection from {:?} failed before it was established", peer.id, peer.address);
            peer.reset();
        }
        else {
            peer.event_data = 0;
            peer.dispatch_state(PeerState::Zombie);
        }
    }

    fn dispatch_incoming_commands(&mut self) -> Option<Event> {
        while let Some(id) = self.dispatch_queue.pop_front() {
            let peer = &mut self.peers[id.0];
            if !peer.needs_dispatch {
                // reset since it was queued
                continue;
            }
            peer.needs_dispatch = false;

            match peer.state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    peer.state = PeerState::Connected;
                    info!("peer {:?} connected to {:?}", id, peer.address);
                    return Some(Event::Connect { peer: id, data: peer.event_data });
                }
                PeerState::Zombie => {
                    self.recalculate_bandwidth_limits = true;
                    let data = peer.event_data;
                    info!("peer {:?} disconnected from {:?}", id, peer.address);
                    peer.reset();
                    return Some(Event::Disconnect { peer: id, data });
                }
                PeerState::Connected => {
                    let Some((channel_id, packet)) = peer.receive() else {
                        continue;
                    };
                    if !peer.dispatched_commands.is_empty() {
                        peer.needs_dispatch = true;
                        self.dispatch_queue.push_back(id);
                    }
                    return Some(Event::Receive { peer: id, channel_id, packet });
                }
                _ => {}
            }
        }
        None
    }

    /// Shares the host's bandwidth between connected peers: packet throttle limits for
    ///  outgoing traffic, and - if bandwidth changed - new incoming limits that are sent to
    ///  the peers
    fn bandwidth_throttle(&mut self) {
        let elapsed = time_difference(self.service_time, self.bandwidth_throttle_epoch);
        self.bandwidth_throttle_epoch = self.service_time;

        let established = self.peers.iter()
            .filter(|p| matches!(p.state, PeerState::Connected | PeerState::DisconnectLater))
            .map(|p| p.id.index())
            .collect::<Vec<_>>();
        if established.is_empty() {
            return;
        }

        let demands = established.iter()
            .map(|&i| PeerDemand {
                incoming_bandwidth: self.peers[i].incoming_bandwidth,
                outgoing_data_total: self.peers[i].outgoing_data_total,
            })
            .collect::<Vec<_>>();
        let limits = packet_throttle_limits(self.outgoing_bandwidth, elapsed, &demands);
        for (&i, limit) in established.iter().zip(limits) {
            trace!("peer {:?}: packet throttle limit {}", self.peers[i].id, limit);
            self.peers[i].congestion.set_limit(limit);
        }

        for peer in &mut self.peers {
            peer.incoming_data_total = 0;
            peer.outgoing_data_total = 0;
        }

        if !self.recalculate_bandwidth_limits {
            return;
        }
        self.recalculate_bandwidth_limits = false;

        let peer_outgoing_bandwidths = established.iter()
            .map(|&i| self.peers[i].outgoing_bandwidth)
            .collect::<Vec<_>>();
        let limits = incoming_bandwidth_limits(self.incoming_bandwidth, &peer_outgoing_bandwidths);
        let outgoing_bandwidth = self.outgoing_bandwidth;
        for (&i, incoming_bandwidth) in established.iter().zip(limits) {
            debug!("peer {:?}: sending bandwidth limits {} in, {} out", self.peers[i].id, incoming_bandwidth, outgoing_bandwidth);
            self.peers[i].queue_command(CommandFlags::ACKNOWLEDGE, NO_CHANNEL, CommandBody::BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            });
        }
    }
}
