use crate::commands::{Command, CommandBody, CommandFlags, CommandHeader, CommandKind};
use crate::fragment::Reassembly;
use crate::packet::{Packet, PacketFlags};
use crate::safe_converter::SafeCast;

/// A command queued for sending. Commands carrying application data hold a handle to the
///  packet, and for fragments the range of the packet's data they carry.
pub struct OutgoingCommand {
    pub command: Command,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub sent_time: u32,
    pub round_trip_timeout: u32,
    pub round_trip_timeout_limit: u32,
    pub send_attempts: u16,
    pub fragment_offset: u32,
    pub fragment_length: u16,
    pub packet: Option<Packet>,
}

impl OutgoingCommand {
    pub fn new(command: Command, packet: Option<Packet>, fragment_offset: u32, fragment_length: u16) -> OutgoingCommand {
        OutgoingCommand {
            command,
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
            send_attempts: 0,
            fragment_offset,
            fragment_length,
            packet,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }

    pub fn channel_id(&self) -> u8 {
        self.command.header.channel_id
    }

    pub fn is_reliable(&self) -> bool {
        self.command.header.is_acknowledge_requested()
    }

    /// the slice of the packet's data this command carries
    pub fn payload(&self) -> &[u8] {
        match &self.packet {
            Some(packet) => {
                let offset: usize = self.fragment_offset.safe_cast();
                let len: usize = self.fragment_length.safe_cast();
                &packet.data()[offset..offset + len]
            }
            None => &[],
        }
    }
}

/// Payload of a received command
pub enum IncomingData {
    Complete(Packet),
    Fragments(Reassembly),
}

/// A received command waiting to be dispatched to the application, either because it
///  arrived out of order or because it is a fragmented packet that is not complete yet
pub struct IncomingCommand {
    pub header: CommandHeader,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub flags: PacketFlags,
    pub data: IncomingData,
}

impl IncomingCommand {
    pub fn kind(&self) -> CommandKind {
        self.header.kind
    }

    pub fn fragments_remaining(&self) -> u32 {
        match &self.data {
            IncomingData::Complete(_) => 0,
            IncomingData::Fragments(reassembly) => reassembly.fragments_remaining(),
        }
    }

    pub fn fragment_count(&self) -> u32 {
        match &self.data {
            IncomingData::Complete(_) => 0,
            IncomingData::Fragments(reassembly) => reassembly.fragment_count(),
        }
    }

    /// data length counted against a peer's waiting data limit
    pub fn data_length(&self) -> usize {
        match &self.data {
            IncomingData::Complete(packet) => packet.len(),
            IncomingData::Fragments(reassembly) => reassembly.total_length(),
        }
    }

    pub fn into_packet(self) -> Packet {
        match self.data {
            IncomingData::Complete(packet) => packet,
            IncomingData::Fragments(reassembly) => Packet::received(reassembly.into_bytes(), self.flags),
        }
    }
}

/// A received command that needs to be acknowledged
#[derive(Debug, Clone, Copy)]
pub struct Acknowledgement {
    pub header: CommandHeader,
    pub sent_time: u16,
}

impl Acknowledgement {
    /// The acknowledgement as it goes on the wire: it echoes the acknowledged command's
    ///  channel and sequence number, and the sender's timestamp for RTT measurement
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(
            CommandFlags::empty(),
            self.header.channel_id,
            CommandBody::Acknowledge {
                received_reliable_sequence_number: self.header.reliable_sequence_number,
                received_sent_time: self.sent_time,
            },
        );
        command.header.reliable_sequence_number = self.header.reliable_sequence_number;
        command
    }
}
