//! Assembly and sending of outgoing datagrams.
//!
//! Every service pass builds at most one datagram per peer and send pass: pending
//!  acknowledgements go first, then queued commands as long as they fit into the peer's MTU
//!  and its reliable window. Reliable commands move to the peer's sent queue until they are
//!  acknowledged or time out, unreliable commands are done once they are handed to the socket.

use crate::commands::{Command, CommandKind};
use crate::error::HostError;
use crate::host::Host;
use crate::peer::{Peer, PeerState};
use crate::protocol::{MAXIMUM_PACKET_COMMANDS, MAXIMUM_PEER_ID};
use crate::protocol_header::ProtocolHeader;
use crate::queued_command::OutgoingCommand;
use crate::safe_converter::SafeCast;
use crate::time::{time_difference, time_greater_equal, time_less};
use bytes::{BufMut, BytesMut};
use tracing::{info, trace, warn};

/// Packet loss statistics are updated in this interval (ms)
pub const PACKET_LOSS_INTERVAL: u32 = 10_000;
/// Packet loss is a fraction scaled by this value
pub const PACKET_LOSS_SCALE: u32 = 1 << 16;

/// The commands of a datagram being assembled for one peer
pub(crate) struct Datagram {
    pub(crate) commands: BytesMut,
    /// size of the datagram on the wire including its header, without compression
    pub(crate) size: usize,
    pub(crate) command_count: usize,
    /// at least one command requests an acknowledgement, so the sent time goes into the header
    pub(crate) has_sent_time: bool,
    /// unreliable commands in this datagram, released when it was sent
    pub(crate) sent_unreliable: Vec<OutgoingCommand>,
}

impl Datagram {
    pub(crate) fn new(commands: BytesMut, checksum_len: usize) -> Datagram {
        Datagram {
            commands,
            size: ProtocolHeader::MAX_SERIALIZED_LEN + checksum_len,
            command_count: 0,
            has_sent_time: false,
            sent_unreliable: Vec::new(),
        }
    }

    fn available(&self, mtu: u32) -> usize {
        let mtu: usize = mtu.safe_cast();
        mtu.saturating_sub(self.size)
    }

    fn push(&mut self, command: &Command, payload: &[u8]) {
        command.ser(&mut self.commands);
        self.commands.put_slice(payload);
        self.size += command.serialized_len() + payload.len();
        self.command_count += 1;
    }
}

impl Peer {
    pub(crate) fn send_acknowledgements(&mut self, datagram: &mut Datagram) {
        while !self.acknowledgements.is_empty() {
            if datagram.command_count >= MAXIMUM_PACKET_COMMANDS || datagram.available(self.mtu) < CommandKind::Acknowledge.size() {
                self.continue_sending = true;
                break;
            }

            let Some(acknowledgement) = self.acknowledgements.pop_front() else {
                break;
            };
            trace!("peer {:?}: acknowledging {:?} {} on channel {}", self.id, acknowledgement.header.kind, acknowledgement.header.reliable_sequence_number, acknowledgement.header.channel_id);
            datagram.push(&acknowledgement.to_command(), &[]);

            if acknowledgement.header.kind == CommandKind::Disconnect {
                self.dispatch_state(PeerState::Zombie);
            }
        }
    }

    /// Moves sent reliable commands whose retransmission timeout expired back to the outgoing
    ///  queue. Returns `true` if the peer should be considered disconnected instead.
    pub(crate) fn check_timeouts(&mut self, service_time: u32) -> bool {
        let mut insert_at = 0;
        let mut index = 0;

        while index < self.sent_reliable_commands.len() {
            let command = &self.sent_reliable_commands[index];
            if time_difference(service_time, command.sent_time) < command.round_trip_timeout {
                index += 1;
                continue;
            }

            if self.earliest_timeout == 0 || time_less(command.sent_time, self.earliest_timeout) {
                self.earliest_timeout = command.sent_time;
            }

            let since_earliest_timeout = time_difference(service_time, self.earliest_timeout);
            if since_earliest_timeout >= self.timeout_maximum
                || (command.round_trip_timeout >= command.round_trip_timeout_limit && since_earliest_timeout >= self.timeout_minimum)
            {
                return true;
            }

            let Some(mut command) = self.sent_reliable_commands.remove(index) else {
                break;
            };
            self.packets_lost += 1;
            command.round_trip_timeout = (command.round_trip_timeout * 2).min(command.round_trip_timeout_limit);
            if command.packet.is_some() {
                self.reliable_data_in_transit = self.reliable_data_in_transit.saturating_sub(command.fragment_length.safe_cast());
            }
            trace!("peer {:?}: resending {:?} {}, next timeout {} ms", self.id, command.kind(), command.reliable_sequence_number, command.round_trip_timeout);

            self.outgoing_commands.insert(insert_at, command);
            insert_at += 1;
        }

        if let Some(front) = self.sent_reliable_commands.front() {
            self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }
        false
    }

    /// Moves as many queued commands into the datagram as fit. Returns `false` if a reliable
    ///  command is in flight now, which makes a ping redundant.
    pub(crate) fn check_outgoing_commands(&mut self, datagram: &mut Datagram, service_time: u32) -> bool {
        let mut window_wrap = false;
        let mut window_exceeded = false;
        let mut can_ping = true;

        let mut index = 0;
        while index < self.outgoing_commands.len() {
            let command = &self.outgoing_commands[index];
            let channel_id: usize = command.channel_id().into();
            let has_channel = channel_id < self.channels.len();
            let is_reliable = command.is_reliable();
            let has_packet = command.packet.is_some();
            let fragment_length: u32 = command.fragment_length.safe_cast();
            let command_size = command.command.serialized_len();

            if is_reliable {
                if has_channel {
                    if !window_wrap && command.send_attempts < 1 && self.channels[channel_id].is_window_wrapped(command.reliable_sequence_number) {
                        window_wrap = true;
                    }
                    if window_wrap {
                        index += 1;
                        continue;
                    }
                }

                if has_packet {
                    if !window_exceeded {
                        let window_size = self.congestion.throttled_window(self.window_size);
                        if self.reliable_data_in_transit + fragment_length > window_size.max(self.mtu) {
                            window_exceeded = true;
                        }
                    }
                    if window_exceeded {
                        index += 1;
                        continue;
                    }
                }
                can_ping = false;
            }

            let available = datagram.available(self.mtu);
            if datagram.command_count >= MAXIMUM_PACKET_COMMANDS
                || available < command_size
                || (has_packet && available < command_size + fragment_length as usize)
            {
                self.continue_sending = true;
                break;
            }

            if is_reliable {
                let Some(mut command) = self.outgoing_commands.remove(index) else {
                    break;
                };
                if has_channel && command.send_attempts < 1 {
                    self.channels[channel_id].acquire_reliable_window(command.reliable_sequence_number);
                }
                command.send_attempts += 1;
                if command.round_trip_timeout == 0 {
                    command.round_trip_timeout = self.congestion.retransmit_timeout();
                    command.round_trip_timeout_limit = self.timeout_limit.saturating_mul(command.round_trip_timeout);
                }
                if self.sent_reliable_commands.is_empty() {
                    self.next_timeout = service_time.wrapping_add(command.round_trip_timeout);
                }
                command.sent_time = service_time;
                datagram.has_sent_time = true;
                self.reliable_data_in_transit += fragment_length;

                datagram.push(&command.command, command.payload());
                self.sent_reliable_commands.push_back(command);
            }
            else {
                if has_packet && self.outgoing_commands[index].fragment_offset == 0 && self.congestion.should_drop_unreliable() {
                    // drop the packet, including all of its fragments
                    let Some(dropped) = self.outgoing_commands.remove(index) else {
                        break;
                    };
                    trace!("peer {:?}: throttling unreliable {:?} {}/{}", self.id, dropped.kind(), dropped.reliable_sequence_number, dropped.unreliable_sequence_number);
                    while let Some(next) = self.outgoing_commands.get(index) {
                        if next.channel_id() != dropped.channel_id()
                            || next.reliable_sequence_number != dropped.reliable_sequence_number
                            || next.unreliable_sequence_number != dropped.unreliable_sequence_number
                        {
                            break;
                        }
                        self.outgoing_commands.remove(index);
                    }
                    continue;
                }

                let Some(command) = self.outgoing_commands.remove(index) else {
                    break;
                };
                datagram.push(&command.command, command.payload());
                if has_packet {
                    datagram.sent_unreliable.push(command);
                }
            }

            self.packets_sent += 1;
        }

        if self.state == PeerState::DisconnectLater
            && self.outgoing_commands.is_empty()
            && self.sent_reliable_commands.is_empty()
            && datagram.sent_unreliable.is_empty()
        {
            self.disconnect(self.event_data);
        }

        can_ping
    }

    pub(crate) fn update_packet_loss(&mut self, service_time: u32) {
        if self.packet_loss_epoch == 0 {
            self.packet_loss_epoch = service_time;
        }
        else if time_difference(service_time, self.packet_loss_epoch) >= PACKET_LOSS_INTERVAL && self.packets_sent > 0 {
            let packet_loss = (self.packets_lost as u64 * PACKET_LOSS_SCALE as u64 / self.packets_sent as u64)
                .min(PACKET_LOSS_SCALE as u64) as u32;

            self.packet_loss_variance = (self.packet_loss_variance * 3 + packet_loss.abs_diff(self.packet_loss)) / 4;
            self.packet_loss = (self.packet_loss * 7 + packet_loss) / 8;
            trace!("peer {:?}: packet loss {}/{} (variance {})", self.id, self.packet_loss, PACKET_LOSS_SCALE, self.packet_loss_variance);

            self.packet_loss_epoch = service_time;
            self.packets_sent = 0;
            self.packets_lost = 0;
        }
    }

    /// Called after a datagram was handed to the socket
    fn release_sent_unreliable(&mut self, sent_unreliable: Vec<OutgoingCommand>) {
        for command in sent_unreliable {
            if let Some(packet) = &command.packet {
                packet.mark_sent();
            }
        }

        if self.state == PeerState::DisconnectLater && !self.has_outgoing_commands() {
            self.disconnect(self.event_data);
        }
    }

    fn protocol_header(&self, datagram: &Datagram, service_time: u32) -> ProtocolHeader {
        ProtocolHeader {
            peer_id: self.outgoing_peer_id,
            session_id: if self.outgoing_peer_id < MAXIMUM_PEER_ID { self.outgoing_session_id } else { 0 },
            compressed: false,
            sent_time: datagram.has_sent_time.then_some((service_time & 0xFFFF) as u16),
        }
    }

    /// the value the checksum field holds while the checksum is calculated
    pub(crate) fn checksum_seed(&self) -> u32 {
        if self.outgoing_peer_id < MAXIMUM_PEER_ID { self.connect_id } else { 0 }
    }
}

impl Host {
    /// Sends a datagram to every peer that has something to send, repeating while peers have
    ///  more than fits into a single datagram.
    pub(crate) async fn send_outgoing_commands(&mut self, check_for_timeouts: bool) -> Result<(), HostError> {
        let service_time = self.service_time;

        let mut continue_sending = true;
        while continue_sending {
            continue_sending = false;

            for index in 0..self.peers.len() {
                let peer = &mut self.peers[index];
                if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie) {
                    continue;
                }
                peer.continue_sending = false;

                let mut datagram = Datagram::new(self.buffer_pool.get_from_pool(), self.config.checksum_len());

                if !peer.acknowledgements.is_empty() {
                    peer.send_acknowledgements(&mut datagram);
                }

                if check_for_timeouts
                    && !peer.sent_reliable_commands.is_empty()
                    && time_greater_equal(service_time, peer.next_timeout)
                    && peer.check_timeouts(service_time)
                {
                    info!("peer {:?} at {:?} timed out", peer.id, peer.address);
                    self.buffer_pool.return_to_pool(datagram.commands);
                    self.notify_disconnect(index);
                    self.collect_dispatch(index);
                    continue;
                }

                let can_ping = peer.outgoing_commands.is_empty() || peer.check_outgoing_commands(&mut datagram, service_time);
                if can_ping
                    && peer.sent_reliable_commands.is_empty()
                    && time_difference(service_time, peer.last_receive_time) >= peer.ping_interval
                    && datagram.available(peer.mtu) >= CommandKind::Ping.size()
                {
                    peer.ping();
                    peer.check_outgoing_commands(&mut datagram, service_time);
                }

                continue_sending |= peer.continue_sending;

                if datagram.command_count > 0 {
                    let result = self.send_datagram(index, datagram).await;
                    if let Err(e) = result {
                        self.collect_dispatch(index);
                        return Err(e);
                    }
                }
                else {
                    self.buffer_pool.return_to_pool(datagram.commands);
                }

                let peer = &mut self.peers[index];
                if peer.reset_after_flush && peer.outgoing_commands.is_empty() {
                    peer.reset();
                }
                self.collect_dispatch(index);
            }
        }
        Ok(())
    }

    async fn send_datagram(&mut self, index: usize, datagram: Datagram) -> Result<(), HostError> {
        let service_time = self.service_time;
        let peer = &mut self.peers[index];
        peer.update_packet_loss(service_time);

        let mut header = peer.protocol_header(&datagram, service_time);
        let compressed = self.config.compressor.as_ref()
            .and_then(|compressor| compressor.compress(&datagram.commands, datagram.commands.len()))
            .filter(|compressed| compressed.len() < datagram.commands.len());
        header.compressed = compressed.is_some();

        let mut buf = self.buffer_pool.get_from_pool();
        header.ser(&mut buf);
        let header_len = buf.len();

        if let Some(checksum) = &self.config.checksum {
            let seed = peer.checksum_seed().to_be_bytes();
            let value = checksum.checksum(&[&buf[..header_len], &seed[..], &datagram.commands[..]]);
            buf.put_u32(value);
        }

        match &compressed {
            Some(compressed) => buf.put_slice(compressed),
            None => buf.put_slice(&datagram.commands),
        }

        let Some(address) = peer.address else {
            warn!("peer {:?} has commands to send but no address - dropping", peer.id);
            self.buffer_pool.return_to_pool(buf);
            self.buffer_pool.return_to_pool(datagram.commands);
            return Ok(());
        };

        peer.last_send_time = service_time;
        trace!("sending datagram of {} bytes with {} commands to {:?}", buf.len(), datagram.command_count, address);
        let result = self.socket.send_datagram(address, &buf).await;

        let peer = &mut self.peers[index];
        peer.release_sent_unreliable(datagram.sent_unreliable);

        let sent_len = buf.len();
        self.buffer_pool.return_to_pool(buf);
        self.buffer_pool.return_to_pool(datagram.commands);

        match result {
            Ok(_) => {
                self.total_sent_data += sent_len as u64;
                self.total_sent_packets += 1;
                Ok(())
            }
            Err(e) => {
                warn!("error sending datagram to {:?}: {}", address, e);
                Err(HostError::Transport(e))
            }
        }
    }
}
