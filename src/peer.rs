//! A peer is the local end of one connection to a remote host.
//!
//! Peers live in a fixed number of slots owned by the [crate::host::Host]; a slot is
//!  `Disconnected` when it is free. All state of a connection is here: its channels, the
//!  queues of outgoing and sent commands, pending acknowledgements, received commands waiting
//!  to be handed to the application, RTT and throttle statistics.
//!
//! Peers do not do any I/O themselves. Sending a packet queues commands that the host packs
//!  into datagrams when it is serviced or flushed, and received commands are fed into the
//!  peer by the host.

use crate::channel::Channel;
use crate::commands::{Command, CommandBody, CommandFlags, CommandHeader, CommandKind, FragmentParams, NO_CHANNEL};
use crate::config::HostConfig;
use crate::congestion::Congestion;
use crate::error::SendError;
use crate::fragment::{fragment_count, fragment_ranges};
use crate::packet::{Packet, PacketFlags};
use crate::protocol::{MAXIMUM_FRAGMENT_COUNT, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE};
use crate::protocol_header::ProtocolHeader;
use crate::queued_command::{Acknowledgement, IncomingCommand, IncomingData, OutgoingCommand};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::time::duration_to_millis;
use anyhow::bail;
use bit_set::BitSet;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Number of unsequenced groups tracked by the receiver's duplicate detection bitmap
pub const UNSEQUENCED_WINDOW_SIZE: u16 = 1024;
pub const UNSEQUENCED_WINDOWS: u32 = 64;
pub const FREE_UNSEQUENCED_WINDOWS: u32 = 32;

/// Unreliable sequence numbers are not reused within a reliable sequence number: once they
///  are exhausted, unreliable packets go out as reliable ones
const MAXIMUM_UNRELIABLE_SEQUENCE_NUMBER: u16 = 0xFFFF;

/// Index of a peer slot in its host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub(crate) usize);

impl PeerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// The order of the states is significant: the protocol logic compares states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerState {
    Disconnected,
    /// Connect was sent, waiting for VerifyConnect
    Connecting,
    /// Connect was received and VerifyConnect sent, waiting for its acknowledgement
    AcknowledgingConnect,
    /// the connection is established, but the application was not notified yet
    ConnectionPending,
    ConnectionSucceeded,
    Connected,
    /// a disconnect was requested, but queued outgoing data is sent first
    DisconnectLater,
    Disconnecting,
    AcknowledgingDisconnect,
    /// the connection is gone, but the application was not notified yet
    Zombie,
}

pub struct Peer {
    pub(crate) config: Arc<HostConfig>,
    pub(crate) id: PeerId,
    /// the id of this connection in the remote host's peer table, [MAXIMUM_PEER_ID] if it is
    ///  not known yet
    pub(crate) outgoing_peer_id: u16,
    pub(crate) incoming_session_id: u8,
    pub(crate) outgoing_session_id: u8,
    pub(crate) connect_id: u32,
    pub(crate) state: PeerState,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) channels: Vec<Channel>,

    /// the remote side's downstream bandwidth in bytes/s, `0` for unlimited
    pub(crate) incoming_bandwidth: u32,
    /// the remote side's upstream bandwidth in bytes/s, `0` for unlimited
    pub(crate) outgoing_bandwidth: u32,
    /// bytes received from the peer since the last bandwidth throttle pass
    pub(crate) incoming_data_total: u32,
    /// bytes queued for the peer since the last bandwidth throttle pass
    pub(crate) outgoing_data_total: u32,

    pub(crate) last_send_time: u32,
    pub(crate) last_receive_time: u32,
    /// time at which the oldest sent reliable command times out
    pub(crate) next_timeout: u32,
    /// send time of the oldest unacknowledged reliable command that timed out, `0` if none
    pub(crate) earliest_timeout: u32,

    pub(crate) packet_loss_epoch: u32,
    pub(crate) packets_sent: u32,
    pub(crate) packets_lost: u32,
    /// mean packet loss of reliable commands, scaled by 65536
    pub(crate) packet_loss: u32,
    pub(crate) packet_loss_variance: u32,

    pub(crate) congestion: Congestion,
    pub(crate) ping_interval: u32,
    pub(crate) timeout_limit: u32,
    pub(crate) timeout_minimum: u32,
    pub(crate) timeout_maximum: u32,

    pub(crate) mtu: u32,
    pub(crate) window_size: u32,
    pub(crate) reliable_data_in_transit: u32,
    /// sequence number for commands that are not scoped to a channel
    pub(crate) outgoing_reliable_sequence_number: u16,

    pub(crate) acknowledgements: VecDeque<Acknowledgement>,
    /// commands that were sent, waiting for their acknowledgement
    pub(crate) sent_reliable_commands: VecDeque<OutgoingCommand>,
    /// commands that were not sent yet, including reliable commands to be resent
    pub(crate) outgoing_commands: VecDeque<OutgoingCommand>,
    /// received commands ready to be handed to the application
    pub(crate) dispatched_commands: VecDeque<IncomingCommand>,

    /// the peer is in the host's dispatch queue
    pub(crate) needs_dispatch: bool,
    /// the peer has something for the host's dispatch queue
    pub(crate) dispatch_requested: bool,
    /// the peer had more to send than fit into a datagram
    pub(crate) continue_sending: bool,
    /// the peer is reset once its queued commands are flushed
    pub(crate) reset_after_flush: bool,

    pub(crate) incoming_unsequenced_group: u16,
    pub(crate) outgoing_unsequenced_group: u16,
    pub(crate) unsequenced_window: BitSet,

    /// application data of the pending Connect or Disconnect event
    pub(crate) event_data: u32,
    /// received data not yet consumed by the application
    pub(crate) total_waiting_data: usize,
}

impl Peer {
    pub(crate) fn new(id: PeerId, config: Arc<HostConfig>) -> Peer {
        let congestion = Congestion::new(
            duration_to_millis(config.packet_throttle_interval),
            config.packet_throttle_acceleration,
            config.packet_throttle_deceleration,
        );

        Peer {
            id,
            outgoing_peer_id: MAXIMUM_PEER_ID,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            connect_id: 0,
            state: PeerState::Disconnected,
            address: None,
            channels: Vec::new(),
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            packet_loss_epoch: 0,
            packets_sent: 0,
            packets_lost: 0,
            packet_loss: 0,
            packet_loss_variance: 0,
            congestion,
            ping_interval: duration_to_millis(config.ping_interval),
            timeout_limit: config.timeout_limit,
            timeout_minimum: duration_to_millis(config.timeout_minimum),
            timeout_maximum: duration_to_millis(config.timeout_maximum),
            mtu: config.mtu,
            window_size: MAXIMUM_WINDOW_SIZE,
            reliable_data_in_transit: 0,
            outgoing_reliable_sequence_number: 0,
            acknowledgements: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            outgoing_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),
            needs_dispatch: false,
            dispatch_requested: false,
            continue_sending: false,
            reset_after_flush: false,
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: BitSet::with_capacity(UNSEQUENCED_WINDOW_SIZE.safe_cast()),
            event_data: 0,
            total_waiting_data: 0,
            config,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn incoming_bandwidth(&self) -> u32 {
        self.incoming_bandwidth
    }

    pub fn outgoing_bandwidth(&self) -> u32 {
        self.outgoing_bandwidth
    }

    pub fn round_trip_time(&self) -> u32 {
        self.congestion.round_trip_time
    }

    pub fn round_trip_time_variance(&self) -> u32 {
        self.congestion.round_trip_time_variance
    }

    pub fn packet_throttle(&self) -> u32 {
        self.congestion.packet_throttle
    }

    pub fn packet_throttle_limit(&self) -> u32 {
        self.congestion.packet_throttle_limit
    }

    pub fn packet_loss(&self) -> u32 {
        self.packet_loss
    }

    pub fn packet_loss_variance(&self) -> u32 {
        self.packet_loss_variance
    }

    pub fn reliable_data_in_transit(&self) -> u32 {
        self.reliable_data_in_transit
    }

    pub fn total_waiting_data(&self) -> usize {
        self.total_waiting_data
    }

    pub fn has_outgoing_commands(&self) -> bool {
        !self.outgoing_commands.is_empty() || !self.sent_reliable_commands.is_empty()
    }

    /// Maximum payload of a single command, i.e. the threshold above which packets are sent
    ///  in fragments
    pub(crate) fn fragment_length(&self) -> usize {
        let mtu: usize = self.mtu.safe_cast();
        mtu - ProtocolHeader::MAX_SERIALIZED_LEN - CommandKind::SendFragment.size() - self.config.checksum_len()
    }

    /// payload bytes queued for sending or waiting for acknowledgement
    fn queued_outgoing_data(&self) -> usize {
        self.outgoing_commands.iter()
            .chain(self.sent_reliable_commands.iter())
            .map(|c| -> usize { c.fragment_length.safe_cast() })
            .sum()
    }

    /// Queues a packet for sending on a channel. The packet's flags determine how it is
    ///  delivered, and packets that do not fit into a single datagram are split into
    ///  fragments.
    ///
    /// Nothing is queued if an error is returned.
    pub fn send(&mut self, channel_id: u8, packet: Packet) -> Result<(), SendError> {
        if self.state != PeerState::Connected {
            return Err(SendError::NotConnected);
        }
        if channel_id as usize >= self.channels.len() {
            return Err(SendError::InvalidChannel(channel_id));
        }
        if packet.len() > self.config.maximum_packet_size {
            return Err(SendError::TooLarge(packet.len()));
        }
        if self.queued_outgoing_data() + packet.len() > self.config.maximum_waiting_data {
            debug!("peer {:?}: outgoing queue is full, rejecting packet of {} bytes", self.id, packet.len());
            return Err(SendError::QueueOverflow);
        }

        let fragment_length = self.fragment_length();
        if packet.len() > fragment_length {
            let fragment_count = fragment_count(packet.len(), fragment_length);
            let maximum_fragment_count: usize = MAXIMUM_FRAGMENT_COUNT.safe_cast();
            if fragment_count > maximum_fragment_count {
                return Err(SendError::TooLarge(packet.len()));
            }
            self.queue_fragments(channel_id, packet, fragment_length, fragment_count);
            return Ok(());
        }

        let flags = packet.flags();
        let data_length: u16 = packet.len().prechecked_cast();
        let channel = &self.channels[channel_id as usize];

        let command = if flags & (PacketFlags::RELIABLE | PacketFlags::UNSEQUENCED) == PacketFlags::UNSEQUENCED {
            Command::new(CommandFlags::UNSEQUENCED, channel_id, CommandBody::SendUnsequenced { unsequenced_group: 0, data_length })
        }
        else if flags.contains(PacketFlags::RELIABLE) || channel.outgoing_unreliable_sequence_number >= MAXIMUM_UNRELIABLE_SEQUENCE_NUMBER {
            Command::new(CommandFlags::ACKNOWLEDGE, channel_id, CommandBody::SendReliable { data_length })
        }
        else {
            Command::new(CommandFlags::empty(), channel_id, CommandBody::SendUnreliable { unreliable_sequence_number: 0, data_length })
        };

        trace!("peer {:?}: queueing {:?} with {} bytes on channel {}", self.id, command.kind(), data_length, channel_id);
        self.setup_outgoing_command(OutgoingCommand::new(command, Some(packet), 0, data_length));
        Ok(())
    }

    fn queue_fragments(&mut self, channel_id: u8, packet: Packet, fragment_length: usize, fragment_count: usize) {
        let channel = &self.channels[channel_id as usize];
        let unreliable = packet.flags() & (PacketFlags::RELIABLE | PacketFlags::UNRELIABLE_FRAGMENT) == PacketFlags::UNRELIABLE_FRAGMENT
            && channel.outgoing_unreliable_sequence_number < MAXIMUM_UNRELIABLE_SEQUENCE_NUMBER;

        // all fragments carry the sequence number the first fragment will get
        let start_sequence_number = if unreliable {
            channel.outgoing_unreliable_sequence_number.wrapping_add(1)
        }
        else {
            channel.outgoing_reliable_sequence_number.wrapping_add(1)
        };

        trace!("peer {:?}: queueing packet of {} bytes in {} fragments on channel {}", self.id, packet.len(), fragment_count, channel_id);

        let total_length: u32 = packet.len().prechecked_cast();
        let fragment_count: u32 = fragment_count.prechecked_cast();
        for (fragment_number, (offset, length)) in fragment_ranges(packet.len(), fragment_length).enumerate() {
            let params = FragmentParams {
                start_sequence_number,
                data_length: length.prechecked_cast(),
                fragment_count,
                fragment_number: fragment_number.prechecked_cast(),
                total_length,
                fragment_offset: offset.prechecked_cast(),
            };
            let command = if unreliable {
                Command::new(CommandFlags::empty(), channel_id, CommandBody::SendUnreliableFragment(params))
            }
            else {
                Command::new(CommandFlags::ACKNOWLEDGE, channel_id, CommandBody::SendFragment(params))
            };
            self.setup_outgoing_command(OutgoingCommand::new(command, Some(packet.clone()), params.fragment_offset, params.data_length));
        }
    }

    /// Assigns sequence numbers to a command and appends it to the outgoing queue
    pub(crate) fn setup_outgoing_command(&mut self, mut outgoing: OutgoingCommand) {
        let command_size: u32 = outgoing.command.serialized_len().prechecked_cast();
        let fragment_length: u32 = outgoing.fragment_length.safe_cast();
        self.outgoing_data_total = self.outgoing_data_total.wrapping_add(command_size + fragment_length);

        let channel_id = outgoing.channel_id();
        if channel_id == NO_CHANNEL {
            self.outgoing_reliable_sequence_number = self.outgoing_reliable_sequence_number.wrapping_add(1);
            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        }
        else if outgoing.is_reliable() {
            let channel = &mut self.channels[channel_id as usize];
            channel.outgoing_reliable_sequence_number = channel.outgoing_reliable_sequence_number.wrapping_add(1);
            channel.outgoing_unreliable_sequence_number = 0;
            outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        }
        else if outgoing.command.header.flags.contains(CommandFlags::UNSEQUENCED) {
            self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
            outgoing.reliable_sequence_number = 0;
            outgoing.unreliable_sequence_number = 0;
        }
        else {
            let channel = &mut self.channels[channel_id as usize];
            // fragments of an unreliable packet share one unreliable sequence number
            if outgoing.fragment_offset == 0 {
                channel.outgoing_unreliable_sequence_number = channel.outgoing_unreliable_sequence_number.wrapping_add(1);
            }
            outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
        }

        outgoing.send_attempts = 0;
        outgoing.sent_time = 0;
        outgoing.round_trip_timeout = 0;
        outgoing.round_trip_timeout_limit = 0;
        outgoing.command.header.reliable_sequence_number = outgoing.reliable_sequence_number;

        match &mut outgoing.command.body {
            CommandBody::SendUnreliable { unreliable_sequence_number, .. } => *unreliable_sequence_number = outgoing.unreliable_sequence_number,
            CommandBody::SendUnsequenced { unsequenced_group, .. } => *unsequenced_group = self.outgoing_unsequenced_group,
            _ => {}
        }

        self.outgoing_commands.push_back(outgoing);
    }

    /// Queues a protocol command without application data
    pub(crate) fn queue_command(&mut self, flags: CommandFlags, channel_id: u8, body: CommandBody) {
        self.setup_outgoing_command(OutgoingCommand::new(Command::new(flags, channel_id, body), None, 0, 0));
    }

    /// Takes the next received packet and the channel it was received on. The host's service
    ///  loop does this and returns it as [crate::event::Event::Receive], so applications
    ///  usually do not need to call this directly.
    pub fn receive(&mut self) -> Option<(u8, Packet)> {
        let command = self.dispatched_commands.pop_front()?;
        self.total_waiting_data -= self.total_waiting_data.min(command.data_length());
        Some((command.header.channel_id, command.into_packet()))
    }

    /// Sends a ping. Pings are sent automatically to idle peers, so this is only needed to
    ///  refresh RTT statistics more often.
    pub fn ping(&mut self) {
        if self.state != PeerState::Connected {
            return;
        }
        self.queue_command(CommandFlags::ACKNOWLEDGE, NO_CHANNEL, CommandBody::Ping);
    }

    /// `Duration::ZERO` restores the host's default
    pub fn set_ping_interval(&mut self, ping_interval: Duration) {
        self.ping_interval = if ping_interval.is_zero() {
            duration_to_millis(self.config.ping_interval)
        }
        else {
            duration_to_millis(ping_interval)
        };
    }

    /// Sets the timeout parameters of this peer. A value of zero restores the host's default.
    ///
    /// Retransmission timeouts double up to `limit` times the initial timeout. A peer is
    ///  disconnected when that ceiling is reached and `minimum` has passed since the oldest
    ///  unacknowledged command was sent, or when `maximum` has passed.
    pub fn set_timeout(&mut self, limit: u32, minimum: Duration, maximum: Duration) {
        self.timeout_limit = if limit == 0 { self.config.timeout_limit } else { limit };
        self.timeout_minimum = duration_to_millis(if minimum.is_zero() { self.config.timeout_minimum } else { minimum });
        self.timeout_maximum = duration_to_millis(if maximum.is_zero() { self.config.timeout_maximum } else { maximum });
    }

    /// Configures the packet throttle for this peer and tells the remote side to use the
    ///  same values.
    pub fn throttle_configure(&mut self, interval: Duration, acceleration: u32, deceleration: u32) {
        let interval = duration_to_millis(interval);
        self.congestion.configure(interval, acceleration, deceleration);

        if self.state == PeerState::Connected {
            self.queue_command(CommandFlags::ACKNOWLEDGE, NO_CHANNEL, CommandBody::ThrottleConfigure {
                packet_throttle_interval: interval,
                packet_throttle_acceleration: acceleration,
                packet_throttle_deceleration: deceleration,
            });
        }
    }

    /// Requests a graceful disconnect: queued data is discarded, and a Disconnect is sent
    ///  that the remote side acknowledges. The host reports a
    ///  [crate::event::Event::Disconnect] when that happens.
    ///
    /// If the connection is not established yet, the Disconnect is sent without expecting
    ///  an acknowledgement, and the peer is reset without an event when it was flushed.
    pub fn disconnect(&mut self, data: u32) {
        if matches!(self.state, PeerState::Disconnecting | PeerState::Disconnected | PeerState::AcknowledgingDisconnect | PeerState::Zombie) {
            return;
        }

        debug!("peer {:?}: disconnecting from {:?}", self.id, self.address);
        self.reset_queues();

        let established = matches!(self.state, PeerState::Connected | PeerState::DisconnectLater);
        let flags = if established { CommandFlags::ACKNOWLEDGE } else { CommandFlags::UNSEQUENCED };
        self.queue_command(flags, NO_CHANNEL, CommandBody::Disconnect { data });

        if established {
            self.state = PeerState::Disconnecting;
        }
        else {
            self.reset_after_flush = true;
        }
    }

    /// Disconnects after all queued outgoing data was sent and acknowledged
    pub fn disconnect_later(&mut self, data: u32) {
        if matches!(self.state, PeerState::Connected | PeerState::DisconnectLater) && self.has_outgoing_commands() {
            self.state = PeerState::DisconnectLater;
            self.event_data = data;
        }
        else {
            self.disconnect(data);
        }
    }

    /// Returns the peer slot to its initial state. Session ids survive so that a new
    ///  connection on this slot can be told apart from the previous one.
    pub(crate) fn reset(&mut self) {
        *self = Peer {
            incoming_session_id: self.incoming_session_id,
            outgoing_session_id: self.outgoing_session_id,
            ..Peer::new(self.id, self.config.clone())
        };
    }

    pub(crate) fn reset_queues(&mut self) {
        self.needs_dispatch = false;
        self.dispatch_requested = false;
        self.acknowledgements.clear();
        self.sent_reliable_commands.clear();
        self.outgoing_commands.clear();
        self.dispatched_commands.clear();
        self.channels.clear();
        self.total_waiting_data = 0;
    }

    /// Changes state and asks the host to report it to the application
    pub(crate) fn dispatch_state(&mut self, state: PeerState) {
        self.state = state;
        self.dispatch_requested = true;
    }

    /// Removes a sent command after it was acknowledged, returning its kind if it was found.
    ///
    /// A reliable command may still be in the outgoing queue for retransmission after it
    ///  timed out, so that queue is searched as well.
    pub(crate) fn remove_sent_reliable_command(&mut self, reliable_sequence_number: u16, channel_id: u8) -> Option<CommandKind> {
        let matches = |c: &OutgoingCommand| c.reliable_sequence_number == reliable_sequence_number && c.channel_id() == channel_id;

        let (command, was_sent) = match self.sent_reliable_commands.iter().position(|c| matches(c)) {
            Some(index) => (self.sent_reliable_commands.remove(index)?, true),
            None => {
                let mut found = None;
                for (index, c) in self.outgoing_commands.iter().enumerate() {
                    if !c.is_reliable() {
                        continue;
                    }
                    if c.send_attempts < 1 {
                        break;
                    }
                    if matches(c) {
                        found = Some(index);
                        break;
                    }
                }
                (self.outgoing_commands.remove(found?)?, false)
            }
        };

        if (channel_id as usize) < self.channels.len() {
            self.channels[channel_id as usize].release_reliable_window(reliable_sequence_number);
        }

        if let Some(packet) = &command.packet {
            if was_sent {
                self.reliable_data_in_transit = self.reliable_data_in_transit.saturating_sub(command.fragment_length.safe_cast());
            }
            packet.mark_sent();
        }

        if let Some(front) = self.sent_reliable_commands.front() {
            self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }

        Some(command.kind())
    }

    pub(crate) fn queue_acknowledgement(&mut self, header: CommandHeader, sent_time: u16) {
        let channel_id = header.channel_id as usize;
        if channel_id < self.channels.len() && self.channels[channel_id].is_acknowledgement_suppressed(header.reliable_sequence_number) {
            trace!("peer {:?}: not acknowledging stale command {} on channel {}", self.id, header.reliable_sequence_number, channel_id);
            return;
        }

        let ack_size: u32 = CommandKind::Acknowledge.size().prechecked_cast();
        self.outgoing_data_total = self.outgoing_data_total.wrapping_add(ack_size);
        self.acknowledgements.push_back(Acknowledgement { header, sent_time });
    }

    /// Queues a received command for dispatch to the application, reordering it into the
    ///  channel's incoming commands. Commands that are duplicates or out of the acceptable
    ///  window are discarded silently, except for fragments: the caller needs to know that
    ///  the reassembly it created was not queued.
    pub(crate) fn queue_incoming_command(&mut self, header: CommandHeader, unreliable_sequence_number: u16, data: IncomingData, flags: PacketFlags) -> anyhow::Result<()> {
        let is_fragment = matches!(data, IncomingData::Fragments(_));
        let channel_id = header.channel_id as usize;
        let reliable_sequence_number = header.reliable_sequence_number;

        let position = if self.state == PeerState::DisconnectLater {
            None
        }
        else {
            let channel = &self.channels[channel_id];
            if header.kind != CommandKind::SendUnsequenced && !channel.is_in_incoming_window(reliable_sequence_number) {
                None
            }
            else {
                match header.kind {
                    CommandKind::SendReliable | CommandKind::SendFragment => reliable_insert_position(channel, reliable_sequence_number),
                    CommandKind::SendUnreliable | CommandKind::SendUnreliableFragment => unreliable_insert_position(channel, reliable_sequence_number, unreliable_sequence_number),
                    _ => Some(0),
                }
            }
        };

        let Some(position) = position else {
            if is_fragment {
                bail!("fragment {:?} {} on channel {} can not be queued", header.kind, reliable_sequence_number, channel_id);
            }
            trace!("peer {:?}: discarding duplicate or out-of-window {:?} {} on channel {}", self.id, header.kind, reliable_sequence_number, channel_id);
            return Ok(());
        };

        if self.total_waiting_data >= self.config.maximum_waiting_data {
            bail!("peer {:?} has {} bytes of data waiting for the application", self.id, self.total_waiting_data);
        }

        let command = IncomingCommand {
            header,
            reliable_sequence_number,
            unreliable_sequence_number,
            flags,
            data,
        };
        self.total_waiting_data += command.data_length();

        match header.kind {
            CommandKind::SendReliable | CommandKind::SendFragment => {
                self.channels[channel_id].incoming_reliable_commands.insert(position, command);
                self.dispatch_incoming_reliable_commands(channel_id);
            }
            _ => {
                self.channels[channel_id].incoming_unreliable_commands.insert(position, command);
                self.dispatch_incoming_unreliable_commands(channel_id, Some(position));
            }
        }
        Ok(())
    }

    /// Moves the contiguous run of complete reliable commands following the last dispatched
    ///  sequence number to the dispatched queue
    pub(crate) fn dispatch_incoming_reliable_commands(&mut self, channel_id: usize) {
        let channel = &mut self.channels[channel_id];

        let mut num_ready = 0;
        for command in &channel.incoming_reliable_commands {
            if command.fragments_remaining() > 0 || command.reliable_sequence_number != channel.incoming_reliable_sequence_number.wrapping_add(1) {
                break;
            }
            channel.incoming_reliable_sequence_number = command.reliable_sequence_number;
            // a fragmented packet consumes one sequence number per fragment
            if command.fragment_count() > 0 {
                channel.incoming_reliable_sequence_number = channel.incoming_reliable_sequence_number
                    .wrapping_add((command.fragment_count() - 1) as u16);
            }
            num_ready += 1;
        }

        if num_ready == 0 {
            return;
        }

        channel.incoming_unreliable_sequence_number = 0;
        self.dispatched_commands.extend(channel.incoming_reliable_commands.drain(..num_ready));
        self.dispatch_requested = true;

        if !channel.incoming_unreliable_commands.is_empty() {
            self.dispatch_incoming_unreliable_commands(channel_id, None);
        }
    }

    /// Dispatches unreliable commands that belong to the current reliable sequence number,
    ///  and drops those that became stale because reliable commands after them were
    ///  dispatched. `exclude` is a command that was just queued and must not be dropped.
    pub(crate) fn dispatch_incoming_unreliable_commands(&mut self, channel_id: usize, exclude: Option<usize>) {
        let channel = &mut self.channels[channel_id];
        let incoming_reliable_sequence_number = channel.incoming_reliable_sequence_number;

        let mut ready = BitSet::new();
        let mut start = 0;
        let mut dropped = 0;
        let mut i = 0;
        let len = channel.incoming_unreliable_commands.len();

        while i < len {
            let command = &channel.incoming_unreliable_commands[i];
            let (kind, reliable_sequence_number, unreliable_sequence_number, complete) =
                (command.kind(), command.reliable_sequence_number, command.unreliable_sequence_number, command.fragments_remaining() == 0);

            if kind == CommandKind::SendUnsequenced {
                i += 1;
                continue;
            }

            if reliable_sequence_number == incoming_reliable_sequence_number {
                if complete {
                    channel.incoming_unreliable_sequence_number = unreliable_sequence_number;
                    i += 1;
                    continue;
                }

                // an incomplete fragmented packet blocks everything after it
                if start != i {
                    ready.extend(start..i);
                    dropped = i;
                }
                else if dropped != i {
                    dropped = i - 1;
                }
            }
            else {
                if channel.is_in_incoming_window(reliable_sequence_number) {
                    break;
                }
                // belongs to a reliable sequence number that was passed already
                dropped = i + 1;
                if start != i {
                    ready.extend(start..i);
                }
            }
            start = i + 1;
            i += 1;
        }

        if start != i {
            ready.extend(start..i);
            dropped = i;
        }

        let mut any_ready = false;
        for (index, command) in std::mem::take(&mut channel.incoming_unreliable_commands).into_iter().enumerate() {
            if ready.contains(index) {
                self.dispatched_commands.push_back(command);
                any_ready = true;
            }
            else if index < dropped && Some(index) != exclude {
                trace!("peer {:?}: dropping stale unreliable command {}/{} on channel {}", self.id, command.reliable_sequence_number, command.unreliable_sequence_number, channel_id);
                self.total_waiting_data -= self.total_waiting_data.min(command.data_length());
            }
            else {
                channel.incoming_unreliable_commands.push_back(command);
            }
        }

        if any_ready {
            self.dispatch_requested = true;
        }
    }
}

/// Where a reliable command goes in the channel's sorted list of received reliable commands,
///  `None` if it is a duplicate. Sequence numbers below the next expected one are
///  interpreted as having wrapped around, i.e. they sort after all others.
fn reliable_insert_position(channel: &Channel, reliable_sequence_number: u16) -> Option<usize> {
    let incoming = channel.incoming_reliable_sequence_number;
    if reliable_sequence_number == incoming {
        return None;
    }

    for (index, existing) in channel.incoming_reliable_commands.iter().enumerate().rev() {
        let existing_sequence_number = existing.reliable_sequence_number;
        if reliable_sequence_number >= incoming {
            if existing_sequence_number < incoming {
                continue;
            }
        }
        else if existing_sequence_number >= incoming {
            return Some(index + 1);
        }

        if existing_sequence_number <= reliable_sequence_number {
            if existing_sequence_number < reliable_sequence_number {
                return Some(index + 1);
            }
            return None;
        }
    }
    Some(0)
}

/// Where an unreliable command goes in the channel's list of received unreliable commands,
///  sorted by reliable and then unreliable sequence number. `None` if it is a duplicate or
///  was superseded already.
fn unreliable_insert_position(channel: &Channel, reliable_sequence_number: u16, unreliable_sequence_number: u16) -> Option<usize> {
    let incoming = channel.incoming_reliable_sequence_number;
    if reliable_sequence_number == incoming && unreliable_sequence_number <= channel.incoming_unreliable_sequence_number {
        return None;
    }

    for (index, existing) in channel.incoming_unreliable_commands.iter().enumerate().rev() {
        if existing.kind() == CommandKind::SendUnsequenced {
            continue;
        }

        let existing_sequence_number = existing.reliable_sequence_number;
        if reliable_sequence_number >= incoming {
            if existing_sequence_number < incoming {
                continue;
            }
        }
        else if existing_sequence_number >= incoming {
            return Some(index + 1);
        }

        if existing_sequence_number < reliable_sequence_number {
            return Some(index + 1);
        }
        if existing_sequence_number > reliable_sequence_number {
            continue;
        }

        if existing.unreliable_sequence_number <= unreliable_sequence_number {
            if existing.unreliable_sequence_number < unreliable_sequence_number {
                return Some(index + 1);
            }
            return None;
        }
    }
    Some(0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fragment::Reassembly;
    use bytes::Bytes;
    use rstest::rstest;

    pub(crate) fn peer_with_config(config: HostConfig, channel_count: usize) -> Peer {
        let mut peer = Peer::new(PeerId(0), Arc::new(config));
        peer.state = PeerState::Connected;
        peer.address = Some(SocketAddr::from(([127, 0, 0, 1], 9000)));
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer
    }

    pub(crate) fn connected_peer(channel_count: usize) -> Peer {
        peer_with_config(HostConfig::new(8), channel_count)
    }

    fn header(kind: CommandKind, channel_id: u8, reliable_sequence_number: u16) -> CommandHeader {
        let flags = match kind {
            CommandKind::SendReliable | CommandKind::SendFragment => CommandFlags::ACKNOWLEDGE,
            CommandKind::SendUnsequenced => CommandFlags::UNSEQUENCED,
            _ => CommandFlags::empty(),
        };
        CommandHeader { kind, flags, channel_id, reliable_sequence_number }
    }

    fn data(payload: &[u8]) -> IncomingData {
        IncomingData::Complete(Packet::received(Bytes::copy_from_slice(payload), PacketFlags::empty()))
    }

    fn queue_reliable(peer: &mut Peer, reliable_sequence_number: u16) {
        peer.queue_incoming_command(header(CommandKind::SendReliable, 0, reliable_sequence_number), 0, data(&reliable_sequence_number.to_be_bytes()), PacketFlags::RELIABLE)
            .unwrap();
    }

    fn queue_unreliable(peer: &mut Peer, reliable_sequence_number: u16, unreliable_sequence_number: u16) {
        peer.queue_incoming_command(header(CommandKind::SendUnreliable, 0, reliable_sequence_number), unreliable_sequence_number, data(&unreliable_sequence_number.to_be_bytes()), PacketFlags::empty())
            .unwrap();
    }

    fn received(peer: &mut Peer) -> Vec<u16> {
        let mut result = Vec::new();
        while let Some((_, packet)) = peer.receive() {
            result.push(u16::from_be_bytes([packet.data()[0], packet.data()[1]]));
        }
        result
    }

    #[rstest]
    #[case::in_order(vec![1, 2, 3, 4], vec![1, 2, 3, 4])]
    #[case::reversed(vec![4, 3, 2, 1], vec![1, 2, 3, 4])]
    #[case::shuffled(vec![3, 1, 4, 2], vec![1, 2, 3, 4])]
    #[case::duplicates(vec![2, 1, 2, 1, 3, 3], vec![1, 2, 3])]
    #[case::gap(vec![1, 2, 4, 5], vec![1, 2])]
    fn test_reliable_ordering(#[case] arrival_order: Vec<u16>, #[case] expected: Vec<u16>) {
        let mut peer = connected_peer(1);
        for rsn in arrival_order {
            queue_reliable(&mut peer, rsn);
        }
        assert_eq!(received(&mut peer), expected);
        assert!(peer.dispatch_requested);
    }

    #[test]
    fn test_reliable_ordering_across_wraparound() {
        let mut peer = connected_peer(1);
        peer.channels[0].incoming_reliable_sequence_number = 65533;

        for rsn in [1, 65535, 0, 65534, 2] {
            queue_reliable(&mut peer, rsn);
        }
        assert_eq!(received(&mut peer), vec![65534, 65535, 0, 1, 2]);
        assert_eq!(peer.channels[0].incoming_reliable_sequence_number, 2);
        assert!(peer.channels[0].incoming_reliable_commands.is_empty());
    }

    #[test]
    fn test_reliable_already_dispatched_is_discarded() {
        let mut peer = connected_peer(1);
        queue_reliable(&mut peer, 1);
        queue_reliable(&mut peer, 2);
        assert_eq!(received(&mut peer), vec![1, 2]);

        queue_reliable(&mut peer, 2);
        // behind the expected sequence number, so it is interpreted as far ahead
        queue_reliable(&mut peer, 1);
        assert!(received(&mut peer).is_empty());
        assert!(peer.channels[0].incoming_reliable_commands.is_empty());
        assert_eq!(peer.total_waiting_data, 0);
    }

    #[test]
    fn test_waiting_data_accounting() {
        let mut peer = connected_peer(1);
        queue_reliable(&mut peer, 2);
        assert_eq!(peer.total_waiting_data, 2);
        queue_reliable(&mut peer, 1);
        assert_eq!(peer.total_waiting_data, 4);
        peer.receive();
        assert_eq!(peer.total_waiting_data, 2);
        peer.receive();
        assert_eq!(peer.total_waiting_data, 0);
    }

    #[test]
    fn test_maximum_waiting_data() {
        let mut config = HostConfig::new(8);
        config.maximum_waiting_data = 4;
        let mut peer = peer_with_config(config, 1);

        queue_reliable(&mut peer, 1);
        queue_reliable(&mut peer, 2);
        assert!(peer.queue_incoming_command(header(CommandKind::SendReliable, 0, 3), 0, data(b"xx"), PacketFlags::RELIABLE).is_err());

        peer.receive();
        assert!(peer.queue_incoming_command(header(CommandKind::SendReliable, 0, 3), 0, data(b"xx"), PacketFlags::RELIABLE).is_ok());
    }

    #[test]
    fn test_unreliable_in_order() {
        let mut peer = connected_peer(1);
        queue_unreliable(&mut peer, 0, 1);
        queue_unreliable(&mut peer, 0, 2);
        queue_unreliable(&mut peer, 0, 5);
        assert_eq!(received(&mut peer), vec![1, 2, 5]);
        assert_eq!(peer.channels[0].incoming_unreliable_sequence_number, 5);
    }

    #[test]
    fn test_unreliable_late_arrival_is_discarded() {
        let mut peer = connected_peer(1);
        queue_unreliable(&mut peer, 0, 5);
        queue_unreliable(&mut peer, 0, 3);
        queue_unreliable(&mut peer, 0, 5);
        assert_eq!(received(&mut peer), vec![5]);
    }

    #[test]
    fn test_unreliable_waits_for_its_reliable_predecessor() {
        let mut peer = connected_peer(1);
        // sent after reliable command 1, which did not arrive yet
        queue_unreliable(&mut peer, 1, 1);
        assert!(received(&mut peer).is_empty());

        queue_reliable(&mut peer, 1);
        assert_eq!(received(&mut peer), vec![1, 1]);
    }

    #[test]
    fn test_stale_unreliable_is_dropped() {
        let mut peer = connected_peer(1);
        queue_reliable(&mut peer, 1);
        received(&mut peer);

        // an unreliable command belonging to reliable sequence number 2 and one from far
        //  in the past, queued while 2 is outstanding
        queue_unreliable(&mut peer, 2, 1);
        peer.channels[0].incoming_unreliable_commands.push_front(IncomingCommand {
            header: header(CommandKind::SendUnreliable, 0, 0),
            reliable_sequence_number: 0,
            unreliable_sequence_number: 9,
            flags: PacketFlags::empty(),
            data: data(&[0, 9]),
        });
        peer.total_waiting_data += 2;

        queue_reliable(&mut peer, 2);
        assert_eq!(received(&mut peer), vec![2, 1]);
        assert!(peer.channels[0].incoming_unreliable_commands.is_empty());
        assert_eq!(peer.total_waiting_data, 0);
    }

    #[test]
    fn test_unsequenced_is_dispatched_immediately() {
        let mut peer = connected_peer(1);
        peer.queue_incoming_command(header(CommandKind::SendUnsequenced, 0, 0), 0, data(&[0, 7]), PacketFlags::UNSEQUENCED).unwrap();
        assert_eq!(received(&mut peer), vec![7]);
    }

    #[test]
    fn test_discard_in_disconnect_later() {
        let mut peer = connected_peer(1);
        peer.state = PeerState::DisconnectLater;
        queue_reliable(&mut peer, 1);
        assert!(received(&mut peer).is_empty());

        let fragments = IncomingData::Fragments(Reassembly::new(2, 10));
        assert!(peer.queue_incoming_command(header(CommandKind::SendFragment, 0, 1), 0, fragments, PacketFlags::RELIABLE).is_err());
    }

    #[test]
    fn test_out_of_window_is_discarded() {
        let mut peer = connected_peer(1);
        queue_reliable(&mut peer, 7 * 4096);
        assert!(peer.channels[0].incoming_reliable_commands.is_empty());
    }

    #[test]
    fn test_incomplete_fragment_blocks_dispatch() {
        let mut peer = connected_peer(1);
        let mut reassembly = Reassembly::new(2, 4);
        reassembly.add_fragment(0, 0, &[1, 2]).unwrap();
        peer.queue_incoming_command(header(CommandKind::SendFragment, 0, 1), 0, IncomingData::Fragments(reassembly), PacketFlags::RELIABLE).unwrap();
        queue_reliable(&mut peer, 3);
        assert!(received(&mut peer).is_empty());

        let IncomingData::Fragments(reassembly) = &mut peer.channels[0].incoming_reliable_commands[0].data else {
            panic!("expected fragments");
        };
        reassembly.add_fragment(1, 2, &[3, 4]).unwrap();
        peer.dispatch_incoming_reliable_commands(0);

        let (_, packet) = peer.receive().unwrap();
        assert_eq!(packet.data(), &[1, 2, 3, 4]);
        assert_eq!(received(&mut peer), vec![3]);
        assert_eq!(peer.channels[0].incoming_reliable_sequence_number, 3);
    }

    #[rstest]
    #[case::not_connected(PeerState::Connecting, 0, 10, SendError::NotConnected)]
    #[case::invalid_channel(PeerState::Connected, 2, 10, SendError::InvalidChannel(2))]
    #[case::too_large(PeerState::Connected, 0, 2000, SendError::TooLarge(2000))]
    #[case::queue_overflow(PeerState::Connected, 0, 1001, SendError::QueueOverflow)]
    fn test_send_errors(#[case] state: PeerState, #[case] channel_id: u8, #[case] len: usize, #[case] expected: SendError) {
        let mut config = HostConfig::new(8);
        config.maximum_packet_size = 1500;
        config.maximum_waiting_data = 1000;
        let mut peer = peer_with_config(config, 2);
        peer.state = state;

        let result = peer.send(channel_id, Packet::new(&vec![0; len], PacketFlags::RELIABLE));
        assert_eq!(format!("{:?}", result), format!("{:?}", Err::<(), _>(expected)));
        assert!(peer.outgoing_commands.is_empty());
    }

    #[test]
    fn test_send_sequence_numbers() {
        let mut peer = connected_peer(2);
        peer.send(0, Packet::new(b"a", PacketFlags::RELIABLE)).unwrap();
        peer.send(0, Packet::new(b"b", PacketFlags::empty())).unwrap();
        peer.send(0, Packet::new(b"c", PacketFlags::empty())).unwrap();
        peer.send(1, Packet::new(b"d", PacketFlags::RELIABLE)).unwrap();
        peer.send(0, Packet::new(b"e", PacketFlags::RELIABLE)).unwrap();
        peer.send(0, Packet::new(b"f", PacketFlags::UNSEQUENCED)).unwrap();

        let sequence_numbers = peer.outgoing_commands.iter()
            .map(|c| (c.kind(), c.reliable_sequence_number, c.unreliable_sequence_number))
            .collect::<Vec<_>>();
        assert_eq!(sequence_numbers, vec![
            (CommandKind::SendReliable, 1, 0),
            (CommandKind::SendUnreliable, 1, 1),
            (CommandKind::SendUnreliable, 1, 2),
            (CommandKind::SendReliable, 1, 0),
            (CommandKind::SendReliable, 2, 0),
            (CommandKind::SendUnsequenced, 0, 0),
        ]);

        assert_eq!(peer.outgoing_commands[2].command.body, CommandBody::SendUnreliable { unreliable_sequence_number: 2, data_length: 1 });
        assert_eq!(peer.outgoing_commands[5].command.body, CommandBody::SendUnsequenced { unsequenced_group: 1, data_length: 1 });
    }

    #[test]
    fn test_unreliable_falls_back_to_reliable_when_sequence_numbers_are_exhausted() {
        let mut peer = connected_peer(1);
        peer.channels[0].outgoing_unreliable_sequence_number = 0xFFFF;
        peer.send(0, Packet::new(b"a", PacketFlags::empty())).unwrap();
        assert_eq!(peer.outgoing_commands[0].kind(), CommandKind::SendReliable);
    }

    #[rstest]
    #[case::reliable(PacketFlags::RELIABLE, CommandKind::SendFragment, 1)]
    #[case::unreliable(PacketFlags::empty(), CommandKind::SendFragment, 1)]
    #[case::unreliable_fragment(PacketFlags::UNRELIABLE_FRAGMENT, CommandKind::SendUnreliableFragment, 1)]
    fn test_send_fragments(#[case] flags: PacketFlags, #[case] expected_kind: CommandKind, #[case] expected_start: u16) {
        let mut peer = connected_peer(1);
        let fragment_length = peer.fragment_length();
        assert_eq!(fragment_length, 1400 - 4 - 24);

        let data = (0..3000).map(|i| i as u8).collect::<Vec<_>>();
        peer.send(0, Packet::new(&data, flags)).unwrap();
        assert_eq!(peer.outgoing_commands.len(), 3);

        let mut reassembled = Vec::new();
        for (n, command) in peer.outgoing_commands.iter().enumerate() {
            assert_eq!(command.kind(), expected_kind);
            let (CommandBody::SendFragment(params) | CommandBody::SendUnreliableFragment(params)) = command.command.body else {
                panic!("expected a fragment");
            };
            assert_eq!(params.start_sequence_number, expected_start);
            assert_eq!(params.fragment_count, 3);
            assert_eq!(params.fragment_number, n as u32);
            assert_eq!(params.total_length, 3000);
            reassembled.extend_from_slice(command.payload());
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_reliable_fragments_consume_sequence_numbers() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::new(&[0; 3000], PacketFlags::RELIABLE)).unwrap();
        let sequence_numbers = peer.outgoing_commands.iter().map(|c| c.reliable_sequence_number).collect::<Vec<_>>();
        assert_eq!(sequence_numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_unreliable_fragments_share_sequence_number() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::new(&[0; 3000], PacketFlags::UNRELIABLE_FRAGMENT)).unwrap();
        let sequence_numbers = peer.outgoing_commands.iter()
            .map(|c| (c.reliable_sequence_number, c.unreliable_sequence_number))
            .collect::<Vec<_>>();
        assert_eq!(sequence_numbers, vec![(0, 1), (0, 1), (0, 1)]);
    }

    #[test]
    fn test_remove_sent_reliable_command() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::new(&[0; 100], PacketFlags::RELIABLE)).unwrap();
        let mut command = peer.outgoing_commands.pop_front().unwrap();
        command.send_attempts = 1;
        command.sent_time = 10;
        peer.channels[0].acquire_reliable_window(command.reliable_sequence_number);
        peer.reliable_data_in_transit = 100;
        let packet = command.packet.clone().unwrap();
        peer.sent_reliable_commands.push_back(command);

        assert_eq!(peer.remove_sent_reliable_command(2, 0), None);
        assert_eq!(peer.remove_sent_reliable_command(1, 1), None);
        assert_eq!(peer.remove_sent_reliable_command(1, 0), Some(CommandKind::SendReliable));
        assert_eq!(peer.reliable_data_in_transit, 0);
        assert_eq!(peer.channels[0].used_reliable_windows, 0);
        assert!(packet.flags().contains(PacketFlags::SENT));
        assert!(!peer.has_outgoing_commands());
    }

    #[test]
    fn test_remove_resend_candidate_from_outgoing_queue() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::new(b"a", PacketFlags::RELIABLE)).unwrap();
        peer.send(0, Packet::new(b"b", PacketFlags::RELIABLE)).unwrap();

        // never sent: an acknowledgement for it can not be genuine
        assert_eq!(peer.remove_sent_reliable_command(1, 0), None);

        peer.outgoing_commands[0].send_attempts = 1;
        assert_eq!(peer.remove_sent_reliable_command(1, 0), Some(CommandKind::SendReliable));
        assert_eq!(peer.outgoing_commands.len(), 1);
    }

    #[test]
    fn test_disconnect_connected() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::new(b"a", PacketFlags::RELIABLE)).unwrap();
        peer.disconnect(42);

        assert_eq!(peer.state, PeerState::Disconnecting);
        assert_eq!(peer.outgoing_commands.len(), 1);
        assert_eq!(peer.outgoing_commands[0].command.body, CommandBody::Disconnect { data: 42 });
        assert!(peer.outgoing_commands[0].is_reliable());
        assert!(!peer.reset_after_flush);

        // idempotent
        peer.disconnect(43);
        assert_eq!(peer.outgoing_commands.len(), 1);
    }

    #[test]
    fn test_disconnect_while_connecting() {
        let mut peer = connected_peer(1);
        peer.state = PeerState::Connecting;
        peer.disconnect(0);

        assert_eq!(peer.state, PeerState::Connecting);
        assert!(peer.outgoing_commands[0].command.header.flags.contains(CommandFlags::UNSEQUENCED));
        assert!(peer.reset_after_flush);
    }

    #[test]
    fn test_disconnect_later() {
        let mut peer = connected_peer(1);
        peer.send(0, Packet::new(b"a", PacketFlags::RELIABLE)).unwrap();
        peer.disconnect_later(5);
        assert_eq!(peer.state, PeerState::DisconnectLater);
        assert_eq!(peer.event_data, 5);
        assert_eq!(peer.outgoing_commands.len(), 1);

        let mut idle = connected_peer(1);
        idle.disconnect_later(5);
        assert_eq!(idle.state, PeerState::Disconnecting);
    }

    #[test]
    fn test_reset_keeps_session_ids() {
        let mut peer = connected_peer(1);
        peer.incoming_session_id = 2;
        peer.outgoing_session_id = 3;
        peer.connect_id = 99;
        peer.send(0, Packet::new(b"a", PacketFlags::RELIABLE)).unwrap();

        peer.reset();
        assert_eq!(peer.state, PeerState::Disconnected);
        assert_eq!((peer.incoming_session_id, peer.outgoing_session_id), (2, 3));
        assert_eq!(peer.connect_id, 0);
        assert_eq!(peer.outgoing_peer_id, MAXIMUM_PEER_ID);
        assert!(peer.channels.is_empty());
        assert!(!peer.has_outgoing_commands());
    }

    #[test]
    fn test_acknowledgement_suppressed_for_stale_commands() {
        let mut peer = connected_peer(1);
        peer.queue_acknowledgement(header(CommandKind::SendReliable, 0, 1), 10);
        peer.queue_acknowledgement(header(CommandKind::SendReliable, 0, 7 * 4096), 10);
        peer.queue_acknowledgement(header(CommandKind::Ping, NO_CHANNEL, 7 * 4096), 10);
        assert_eq!(peer.acknowledgements.len(), 2);
        assert_eq!(peer.outgoing_data_total, 16);
    }

    #[test]
    fn test_timeout_settings() {
        let mut peer = connected_peer(1);
        peer.set_timeout(4, Duration::from_millis(100), Duration::ZERO);
        assert_eq!((peer.timeout_limit, peer.timeout_minimum, peer.timeout_maximum), (4, 100, 30000));
        peer.set_timeout(0, Duration::ZERO, Duration::ZERO);
        assert_eq!((peer.timeout_limit, peer.timeout_minimum, peer.timeout_maximum), (32, 5000, 30000));

        peer.set_ping_interval(Duration::from_millis(50));
        assert_eq!(peer.ping_interval, 50);
        peer.set_ping_interval(Duration::ZERO);
        assert_eq!(peer.ping_interval, 500);
    }

    #[test]
    fn test_throttle_configure() {
        let mut peer = connected_peer(1);
        peer.throttle_configure(Duration::from_millis(1000), 4, 8);
        assert_eq!(peer.congestion.packet_throttle_interval, 1000);
        assert_eq!(peer.outgoing_commands[0].command.body, CommandBody::ThrottleConfigure {
            packet_throttle_interval: 1000,
            packet_throttle_acceleration: 4,
            packet_throttle_deceleration: 8,
        });
    }
}
