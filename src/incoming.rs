//! Processing of received datagrams: header and checksum validation, and a handler per
//!  command kind.
//!
//! Handlers that only touch a single peer are implemented on [Peer], those that involve the
//!  host's peer table or its state reporting on [Host]. A handler returning an error stops
//!  processing of the rest of the datagram, which the remote side will resend if it was
//!  reliable.

use crate::channel::{reliable_window, Channel, FREE_RELIABLE_WINDOWS, RELIABLE_WINDOWS};
use crate::commands::{Command, CommandBody, CommandFlags, CommandHeader, CommandKind, ConnectParams, FragmentParams, NO_CHANNEL};
use crate::error::HostError;
use crate::fragment::Reassembly;
use crate::host::Host;
use crate::packet::{Packet, PacketFlags};
use crate::peer::{Peer, PeerState, FREE_UNSEQUENCED_WINDOWS, UNSEQUENCED_WINDOW_SIZE};
use crate::protocol::{clamp_mtu, clamp_window_size, negotiated_window_size, window_size_for_bandwidth, MAXIMUM_CHANNEL_COUNT, MAXIMUM_FRAGMENT_COUNT, MAXIMUM_MTU, MAXIMUM_PEER_ID, MINIMUM_CHANNEL_COUNT};
use crate::protocol_header::ProtocolHeader;
use crate::queued_command::IncomingData;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::time::{expand_sent_time, time_difference, time_less};
use anyhow::bail;
use bytes::{Buf, Bytes};
use std::io;
use std::net::SocketAddr;
use tracing::{debug, span, trace, warn, Level};
use uuid::Uuid;

/// Upper bound for datagrams processed in a single receive pass, so that a flood of incoming
///  datagrams can not starve sending
pub const MAXIMUM_DATAGRAMS_PER_RECEIVE: usize = 256;

/// Number of accepted connections per peer slot whose connect ids are remembered for
///  rejecting stale Connect commands
pub const ACCEPTED_CONNECTS_PER_PEER: usize = 4;

const SESSION_ID_MASK: u8 = (ProtocolHeader::SESSION_MASK >> ProtocolHeader::SESSION_SHIFT) as u8;

/// The next session id after `session_id`, skipping `excluded`
fn next_session_id(session_id: u8, excluded: u8) -> u8 {
    let next = session_id.wrapping_add(1) & SESSION_ID_MASK;
    if next == excluded {
        next.wrapping_add(1) & SESSION_ID_MASK
    }
    else {
        next
    }
}

impl Host {
    /// Drains datagrams available on the socket without waiting
    pub(crate) fn receive_incoming_commands(&mut self) -> Result<(), HostError> {
        for _ in 0..MAXIMUM_DATAGRAMS_PER_RECEIVE {
            let (len, from) = match self.socket.try_receive_datagram(&mut self.receive_buffer) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!("error receiving datagram: {}", e);
                    return Err(HostError::Transport(e));
                }
            };

            self.total_received_data += len as u64;
            self.total_received_packets += 1;

            let datagram = Bytes::copy_from_slice(&self.receive_buffer[..len]);
            self.handle_datagram(datagram, from);
        }
        Ok(())
    }

    pub(crate) fn handle_datagram(&mut self, datagram: Bytes, from: SocketAddr) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        let _entered = span.enter();

        trace!("received datagram of {} bytes from {:?}", datagram.len(), from);

        let mut peer_index = None;
        let result = self.handle_datagram_commands(datagram, from, &mut peer_index);
        if let Some(index) = peer_index {
            self.collect_dispatch(index);
        }
        if let Err(e) = result {
            debug!("datagram from {:?}: {} - dropping", from, e);
        }
    }

    fn handle_datagram_commands(&mut self, datagram: Bytes, from: SocketAddr, peer_index: &mut Option<usize>) -> anyhow::Result<()> {
        let mut buf = &datagram[..];
        let header = ProtocolHeader::deser(&mut buf)?;
        let header_len = header.serialized_len();

        let checksum_len = self.config.checksum_len();
        if datagram.len() < header_len + checksum_len {
            bail!("datagram too short for checksum");
        }

        if header.peer_id != MAXIMUM_PEER_ID {
            let index: usize = header.peer_id.safe_cast();
            let Some(peer) = self.peers.get(index) else {
                bail!("datagram for unknown peer id {}", header.peer_id);
            };
            if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie) {
                bail!("datagram for peer {:?} in state {:?}", peer.id, peer.state);
            }
            if peer.address != Some(from) {
                bail!("datagram for peer {:?} from unexpected address {:?}", peer.id, from);
            }
            if peer.outgoing_peer_id < MAXIMUM_PEER_ID && header.session_id != peer.incoming_session_id {
                bail!("datagram for peer {:?} with stale session id {}", peer.id, header.session_id);
            }
            *peer_index = Some(index);
        }

        let mut commands = datagram.slice(header_len + checksum_len..);
        if header.compressed {
            let Some(compressor) = &self.config.compressor else {
                bail!("compressed datagram, but no compressor is configured");
            };
            let Some(decompressed) = compressor.decompress(&commands, MAXIMUM_MTU as usize - header_len - checksum_len) else {
                bail!("datagram could not be decompressed");
            };
            commands = Bytes::from(decompressed);
        }

        if let Some(checksum) = &self.config.checksum {
            let received = (&datagram[header_len..]).get_u32();
            let seed = peer_index.map(|i| self.peers[i].connect_id).unwrap_or(0).to_be_bytes();
            let calculated = checksum.checksum(&[&datagram[..header_len], &seed[..], &commands[..]]);
            if received != calculated {
                bail!("checksum mismatch");
            }
        }

        if let Some(index) = *peer_index {
            let peer = &mut self.peers[index];
            peer.address = Some(from);
            let len: u32 = datagram.len().prechecked_cast();
            peer.incoming_data_total = peer.incoming_data_total.wrapping_add(len);
        }

        while commands.has_remaining() {
            let command = Command::deser(&mut commands)?;
            let payload = commands.split_to(command.data_length());

            let index = match (*peer_index, command.body) {
                (None, CommandBody::Connect { params, data }) => {
                    let index = self.handle_connect(from, params, data)?;
                    *peer_index = Some(index);
                    index
                }
                (Some(_), CommandBody::Connect { .. }) => bail!("Connect on an established connection"),
                (None, _) => bail!("{:?} without a connection", command.kind()),
                (Some(index), _) => {
                    self.handle_command(index, &command, payload)?;
                    index
                }
            };

            if command.header.is_acknowledge_requested() {
                let Some(sent_time) = header.sent_time else {
                    bail!("{:?} requests an acknowledgement, but the datagram has no sent time", command.kind());
                };

                let peer = &mut self.peers[index];
                match peer.state {
                    PeerState::Disconnecting
                    | PeerState::AcknowledgingConnect
                    | PeerState::Disconnected
                    | PeerState::Zombie => {}
                    PeerState::AcknowledgingDisconnect => {
                        if command.kind() == CommandKind::Disconnect {
                            peer.queue_acknowledgement(command.header, sent_time);
                        }
                    }
                    _ => peer.queue_acknowledgement(command.header, sent_time),
                }
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, index: usize, command: &Command, payload: Bytes) -> anyhow::Result<()> {
        let header = command.header;
        match command.body {
            CommandBody::Acknowledge { received_reliable_sequence_number, received_sent_time } =>
                self.handle_acknowledge(index, header, received_reliable_sequence_number, received_sent_time),
            CommandBody::Connect { .. } => bail!("Connect on an established connection"),
            CommandBody::VerifyConnect(params) => self.handle_verify_connect(index, params),
            CommandBody::Disconnect { data } => self.handle_disconnect(index, header, data),
            CommandBody::Ping => self.peers[index].handle_ping(),
            CommandBody::SendReliable { .. } => self.peers[index].handle_send_reliable(header, payload),
            CommandBody::SendUnreliable { unreliable_sequence_number, .. } =>
                self.peers[index].handle_send_unreliable(header, unreliable_sequence_number, payload),
            CommandBody::SendUnsequenced { unsequenced_group, .. } =>
                self.peers[index].handle_send_unsequenced(header, unsequenced_group, payload),
            CommandBody::SendFragment(params) => self.peers[index].handle_send_fragment(header, params, payload),
            CommandBody::SendUnreliableFragment(params) => self.peers[index].handle_send_unreliable_fragment(header, params, payload),
            CommandBody::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth } => {
                let host_outgoing_bandwidth = self.outgoing_bandwidth;
                self.peers[index].handle_bandwidth_limit(incoming_bandwidth, outgoing_bandwidth, host_outgoing_bandwidth)
            }
            CommandBody::ThrottleConfigure { packet_throttle_interval, packet_throttle_acceleration, packet_throttle_deceleration } =>
                self.peers[index].handle_throttle_configure(packet_throttle_interval, packet_throttle_acceleration, packet_throttle_deceleration),
        }
    }

    /// Accepts an incoming connection into the first free peer slot, returning the slot
    fn handle_connect(&mut self, from: SocketAddr, params: ConnectParams, data: u32) -> anyhow::Result<usize> {
        let channel_count: usize = params.channel_count.safe_cast();
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count) {
            bail!("Connect with invalid channel count {}", channel_count);
        }

        let mut free_slot = None;
        let mut duplicate_peers = 0;
        for peer in &self.peers {
            if peer.state == PeerState::Disconnected {
                if free_slot.is_none() {
                    free_slot = Some(peer.id.index());
                }
            }
            else if peer.state != PeerState::Connecting && peer.address.map(|a| a.ip()) == Some(from.ip()) {
                if peer.address.map(|a| a.port()) == Some(from.port()) && peer.connect_id == params.connect_id {
                    bail!("repeated Connect {:#x} from {:?}", params.connect_id, from);
                }
                duplicate_peers += 1;
            }
        }

        let Some(index) = free_slot else {
            bail!("no free peer slot for a connection from {:?}", from);
        };
        if duplicate_peers >= self.config.duplicate_peers {
            bail!("too many connections from {}", from.ip());
        }
        if self.accepted_connects.contains(&(from, params.connect_id)) {
            bail!("stale Connect {:#x} from {:?} of an earlier connection", params.connect_id, from);
        }

        self.accepted_connects.push_back((from, params.connect_id));
        if self.accepted_connects.len() > self.peers.len() * ACCEPTED_CONNECTS_PER_PEER {
            self.accepted_connects.pop_front();
        }

        let channel_count = channel_count.min(self.channel_limit);
        let (host_incoming_bandwidth, host_outgoing_bandwidth) = (self.incoming_bandwidth, self.outgoing_bandwidth);
        let peer = &mut self.peers[index];

        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::AcknowledgingConnect;
        peer.connect_id = params.connect_id;
        peer.address = Some(from);
        peer.outgoing_peer_id = params.outgoing_peer_id;
        peer.incoming_bandwidth = params.incoming_bandwidth;
        peer.outgoing_bandwidth = params.outgoing_bandwidth;
        peer.congestion.configure(params.packet_throttle_interval, params.packet_throttle_acceleration, params.packet_throttle_deceleration);
        peer.event_data = data;

        let incoming_session_id = if params.incoming_session_id == 0xFF { peer.outgoing_session_id } else { params.incoming_session_id };
        let incoming_session_id = next_session_id(incoming_session_id, peer.outgoing_session_id);
        peer.outgoing_session_id = incoming_session_id;

        let outgoing_session_id = if params.outgoing_session_id == 0xFF { peer.incoming_session_id } else { params.outgoing_session_id };
        let outgoing_session_id = next_session_id(outgoing_session_id, peer.incoming_session_id);
        peer.incoming_session_id = outgoing_session_id;

        peer.mtu = peer.mtu.min(clamp_mtu(params.mtu));
        peer.window_size = negotiated_window_size(host_outgoing_bandwidth, peer.incoming_bandwidth);

        let window_size = clamp_window_size(window_size_for_bandwidth(host_incoming_bandwidth).min(params.window_size));

        debug!("accepting connection {:#x} from {:?} as peer {:?} with {} channels", params.connect_id, from, peer.id, channel_count);

        let verify = ConnectParams {
            outgoing_peer_id: index.prechecked_cast(),
            incoming_session_id,
            outgoing_session_id,
            mtu: peer.mtu,
            window_size,
            channel_count: channel_count.prechecked_cast(),
            incoming_bandwidth: host_incoming_bandwidth,
            outgoing_bandwidth: host_outgoing_bandwidth,
            packet_throttle_interval: peer.congestion.packet_throttle_interval,
            packet_throttle_acceleration: peer.congestion.packet_throttle_acceleration,
            packet_throttle_deceleration: peer.congestion.packet_throttle_deceleration,
            connect_id: peer.connect_id,
        };
        peer.queue_command(CommandFlags::ACKNOWLEDGE, NO_CHANNEL, CommandBody::VerifyConnect(verify));
        Ok(index)
    }

    fn handle_verify_connect(&mut self, index: usize, params: ConnectParams) -> anyhow::Result<()> {
        let peer = &mut self.peers[index];
        if peer.state != PeerState::Connecting {
            return Ok(());
        }

        let channel_count: usize = params.channel_count.safe_cast();
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count)
            || params.packet_throttle_interval != peer.congestion.packet_throttle_interval
            || params.packet_throttle_acceleration != peer.congestion.packet_throttle_acceleration
            || params.packet_throttle_deceleration != peer.congestion.packet_throttle_deceleration
            || params.connect_id != peer.connect_id
        {
            peer.event_data = 0;
            peer.dispatch_state(PeerState::Zombie);
            bail!("VerifyConnect does not match the Connect of peer {:?}", peer.id);
        }

        peer.remove_sent_reliable_command(1, NO_CHANNEL);

        peer.channels.truncate(channel_count);
        peer.outgoing_peer_id = params.outgoing_peer_id;
        peer.incoming_session_id = params.incoming_session_id;
        peer.outgoing_session_id = params.outgoing_session_id;
        peer.mtu = peer.mtu.min(clamp_mtu(params.mtu));
        peer.window_size = peer.window_size.min(clamp_window_size(params.window_size));
        peer.incoming_bandwidth = params.incoming_bandwidth;
        peer.outgoing_bandwidth = params.outgoing_bandwidth;

        debug!("connection {:#x} of peer {:?} to {:?} verified", peer.connect_id, peer.id, peer.address);
        self.notify_connect(index);
        Ok(())
    }

    fn handle_acknowledge(&mut self, index: usize, header: CommandHeader, received_reliable_sequence_number: u16, received_sent_time: u16) -> anyhow::Result<()> {
        let service_time = self.service_time;
        let peer = &mut self.peers[index];
        if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie) {
            return Ok(());
        }

        let sent_time = expand_sent_time(service_time, received_sent_time);
        if time_less(service_time, sent_time) {
            return Ok(());
        }

        let round_trip_time = time_difference(service_time, sent_time);
        peer.congestion.on_round_trip_sample(round_trip_time, peer.last_receive_time == 0, service_time);
        peer.last_receive_time = service_time.max(1);
        peer.earliest_timeout = 0;

        let acknowledged = peer.remove_sent_reliable_command(received_reliable_sequence_number, header.channel_id);

        let state = peer.state;
        match state {
            PeerState::AcknowledgingConnect => {
                if acknowledged != Some(CommandKind::VerifyConnect) {
                    bail!("expected acknowledgement of VerifyConnect, was {:?}", acknowledged);
                }
                self.notify_connect(index);
            }
            PeerState::Disconnecting => {
                if acknowledged != Some(CommandKind::Disconnect) {
                    bail!("expected acknowledgement of Disconnect, was {:?}", acknowledged);
                }
                self.notify_disconnect(index);
            }
            PeerState::DisconnectLater => {
                if !peer.has_outgoing_commands() {
                    peer.disconnect(peer.event_data);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_disconnect(&mut self, index: usize, header: CommandHeader, data: u32) -> anyhow::Result<()> {
        let peer = &mut self.peers[index];
        if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect) {
            return Ok(());
        }

        debug!("peer {:?} at {:?} disconnected in state {:?}", peer.id, peer.address, peer.state);
        peer.reset_queues();

        match peer.state {
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting => {
                peer.dispatch_state(PeerState::Zombie);
            }
            PeerState::Connected | PeerState::DisconnectLater => {
                if header.is_acknowledge_requested() {
                    peer.state = PeerState::AcknowledgingDisconnect;
                }
                else {
                    peer.dispatch_state(PeerState::Zombie);
                }
            }
            state => {
                if state == PeerState::ConnectionPending {
                    self.recalculate_bandwidth_limits = true;
                }
                peer.reset();
            }
        }

        if peer.state != PeerState::Disconnected {
            peer.event_data = data;
        }
        Ok(())
    }
}

impl Peer {
    fn check_established(&self, kind: CommandKind) -> anyhow::Result<()> {
        if !matches!(self.state, PeerState::Connected | PeerState::DisconnectLater) {
            bail!("{:?} for peer {:?} in state {:?}", kind, self.id, self.state);
        }
        Ok(())
    }

    /// Validates a command carrying application data, returning its channel index
    fn check_data_command(&self, header: &CommandHeader, data_length: usize) -> anyhow::Result<usize> {
        let channel_id: usize = header.channel_id.into();
        if channel_id >= self.channels.len() {
            bail!("{:?} for invalid channel {}", header.kind, channel_id);
        }
        self.check_established(header.kind)?;
        if data_length > self.config.maximum_packet_size {
            bail!("{:?} with {} bytes exceeds the maximum packet size", header.kind, data_length);
        }
        Ok(channel_id)
    }

    fn handle_ping(&mut self) -> anyhow::Result<()> {
        self.check_established(CommandKind::Ping)
    }

    fn handle_bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32, host_outgoing_bandwidth: u32) -> anyhow::Result<()> {
        self.check_established(CommandKind::BandwidthLimit)?;

        self.incoming_bandwidth = incoming_bandwidth;
        self.outgoing_bandwidth = outgoing_bandwidth;
        self.window_size = negotiated_window_size(host_outgoing_bandwidth, incoming_bandwidth);
        trace!("peer {:?}: bandwidth limit {} in, {} out, window size {}", self.id, incoming_bandwidth, outgoing_bandwidth, self.window_size);
        Ok(())
    }

    fn handle_throttle_configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) -> anyhow::Result<()> {
        self.check_established(CommandKind::ThrottleConfigure)?;
        self.congestion.configure(interval, acceleration, deceleration);
        Ok(())
    }

    fn handle_send_reliable(&mut self, header: CommandHeader, payload: Bytes) -> anyhow::Result<()> {
        self.check_data_command(&header, payload.len())?;
        let packet = Packet::received(payload, PacketFlags::RELIABLE);
        self.queue_incoming_command(header, 0, IncomingData::Complete(packet), PacketFlags::RELIABLE)
    }

    fn handle_send_unreliable(&mut self, header: CommandHeader, unreliable_sequence_number: u16, payload: Bytes) -> anyhow::Result<()> {
        self.check_data_command(&header, payload.len())?;
        let packet = Packet::received(payload, PacketFlags::empty());
        self.queue_incoming_command(header, unreliable_sequence_number, IncomingData::Complete(packet), PacketFlags::empty())
    }

    fn handle_send_unsequenced(&mut self, header: CommandHeader, unsequenced_group: u16, payload: Bytes) -> anyhow::Result<()> {
        self.check_data_command(&header, payload.len())?;

        let window_size = UNSEQUENCED_WINDOW_SIZE as u32;
        let incoming_group = self.incoming_unsequenced_group as u32;
        let index = unsequenced_group as u32 % window_size;

        let mut group = unsequenced_group as u32;
        if group < incoming_group {
            group += 0x10000;
        }
        if group >= incoming_group + FREE_UNSEQUENCED_WINDOWS * window_size {
            trace!("peer {:?}: unsequenced group {} is out of window", self.id, unsequenced_group);
            return Ok(());
        }

        let group = group & 0xFFFF;
        let window_start = group - index;
        if window_start != incoming_group {
            self.incoming_unsequenced_group = window_start.prechecked_cast();
            self.unsequenced_window.clear();
        }
        else if self.unsequenced_window.contains(index.safe_cast()) {
            trace!("peer {:?}: duplicate unsequenced group {}", self.id, unsequenced_group);
            return Ok(());
        }

        let packet = Packet::received(payload, PacketFlags::UNSEQUENCED);
        self.queue_incoming_command(header, 0, IncomingData::Complete(packet), PacketFlags::UNSEQUENCED)?;
        self.unsequenced_window.insert(index.safe_cast());
        Ok(())
    }

    fn check_fragment(&self, params: &FragmentParams, payload: &Bytes) -> anyhow::Result<()> {
        let maximum_packet_size: usize = self.config.maximum_packet_size;
        let total_length: usize = params.total_length.safe_cast();
        if params.fragment_count == 0
            || params.fragment_count > MAXIMUM_FRAGMENT_COUNT
            || params.fragment_number >= params.fragment_count
            || params.total_length < params.fragment_count
            || total_length > maximum_packet_size
            || params.fragment_offset >= params.total_length
            || payload.len() as u64 > (params.total_length - params.fragment_offset) as u64
        {
            bail!("invalid fragment {}/{} at offset {} of {} bytes", params.fragment_number, params.fragment_count, params.fragment_offset, params.total_length);
        }
        Ok(())
    }

    fn handle_send_fragment(&mut self, header: CommandHeader, params: FragmentParams, payload: Bytes) -> anyhow::Result<()> {
        let channel_id = self.check_data_command(&header, payload.len())?;
        let channel = &self.channels[channel_id];

        let start_sequence_number = params.start_sequence_number;
        let incoming = channel.incoming_reliable_sequence_number;
        let mut start_window = reliable_window(start_sequence_number);
        let current_window = reliable_window(incoming);
        if start_sequence_number < incoming {
            start_window += RELIABLE_WINDOWS;
        }
        if start_window < current_window || start_window >= current_window + FREE_RELIABLE_WINDOWS - 1 {
            trace!("peer {:?}: fragment of {} is out of window", self.id, start_sequence_number);
            return Ok(());
        }

        self.check_fragment(&params, &payload)?;

        let mut existing = None;
        for (index, command) in channel.incoming_reliable_commands.iter().enumerate().rev() {
            if start_sequence_number >= incoming {
                if command.reliable_sequence_number < incoming {
                    continue;
                }
            }
            else if command.reliable_sequence_number >= incoming {
                break;
            }

            if command.reliable_sequence_number <= start_sequence_number {
                if command.reliable_sequence_number < start_sequence_number {
                    break;
                }
                if command.kind() != CommandKind::SendFragment
                    || command.data_length() != params.total_length as usize
                    || command.fragment_count() != params.fragment_count
                {
                    bail!("fragment does not match the packet started at {}", start_sequence_number);
                }
                existing = Some(index);
                break;
            }
        }

        match existing {
            Some(index) => {
                let IncomingData::Fragments(reassembly) = &mut self.channels[channel_id].incoming_reliable_commands[index].data else {
                    bail!("packet started at {} is not fragmented", start_sequence_number);
                };
                if reassembly.add_fragment(params.fragment_number, params.fragment_offset, &payload)? && reassembly.is_complete() {
                    self.dispatch_incoming_reliable_commands(channel_id);
                }
            }
            None => {
                let mut reassembly = Reassembly::new(params.fragment_count, params.total_length);
                reassembly.add_fragment(params.fragment_number, params.fragment_offset, &payload)?;

                let mut start_header = header;
                start_header.reliable_sequence_number = start_sequence_number;
                self.queue_incoming_command(start_header, 0, IncomingData::Fragments(reassembly), PacketFlags::RELIABLE)?;
            }
        }
        Ok(())
    }

    fn handle_send_unreliable_fragment(&mut self, header: CommandHeader, params: FragmentParams, payload: Bytes) -> anyhow::Result<()> {
        let channel_id = self.check_data_command(&header, payload.len())?;
        let channel = &self.channels[channel_id];

        let reliable_sequence_number = header.reliable_sequence_number;
        let start_sequence_number = params.start_sequence_number;
        let incoming = channel.incoming_reliable_sequence_number;

        let mut window = reliable_window(reliable_sequence_number);
        let current_window = reliable_window(incoming);
        if reliable_sequence_number < incoming {
            window += RELIABLE_WINDOWS;
        }
        if window < current_window || window >= current_window + FREE_RELIABLE_WINDOWS - 1 {
            trace!("peer {:?}: unreliable fragment after {} is out of window", self.id, reliable_sequence_number);
            return Ok(());
        }
        if reliable_sequence_number == incoming && start_sequence_number <= channel.incoming_unreliable_sequence_number {
            trace!("peer {:?}: unreliable fragment {}/{} is stale", self.id, reliable_sequence_number, start_sequence_number);
            return Ok(());
        }

        self.check_fragment(&params, &payload)?;

        let mut existing = None;
        for (index, command) in channel.incoming_unreliable_commands.iter().enumerate().rev() {
            if command.kind() == CommandKind::SendUnsequenced {
                continue;
            }
            if reliable_sequence_number >= incoming {
                if command.reliable_sequence_number < incoming {
                    continue;
                }
            }
            else if command.reliable_sequence_number >= incoming {
                break;
            }

            if command.reliable_sequence_number < reliable_sequence_number {
                break;
            }
            if command.reliable_sequence_number > reliable_sequence_number {
                continue;
            }

            if command.unreliable_sequence_number <= start_sequence_number {
                if command.unreliable_sequence_number < start_sequence_number {
                    break;
                }
                if command.kind() != CommandKind::SendUnreliableFragment
                    || command.data_length() != params.total_length as usize
                    || command.fragment_count() != params.fragment_count
                {
                    bail!("unreliable fragment does not match the packet started at {}/{}", reliable_sequence_number, start_sequence_number);
                }
                existing = Some(index);
                break;
            }
        }

        match existing {
            Some(index) => {
                let IncomingData::Fragments(reassembly) = &mut self.channels[channel_id].incoming_unreliable_commands[index].data else {
                    bail!("packet started at {}/{} is not fragmented", reliable_sequence_number, start_sequence_number);
                };
                if reassembly.add_fragment(params.fragment_number, params.fragment_offset, &payload)? && reassembly.is_complete() {
                    self.dispatch_incoming_unreliable_commands(channel_id, None);
                }
            }
            None => {
                let mut reassembly = Reassembly::new(params.fragment_count, params.total_length);
                reassembly.add_fragment(params.fragment_number, params.fragment_offset, &payload)?;
                self.queue_incoming_command(header, start_sequence_number, IncomingData::Fragments(reassembly), PacketFlags::UNRELIABLE_FRAGMENT)?;
            }
        }
        Ok(())
    }
}
