use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The command tag, stored in the lower four bits of a command's first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommandKind {
    Acknowledge = 1,
    Connect = 2,
    VerifyConnect = 3,
    Disconnect = 4,
    Ping = 5,
    SendReliable = 6,
    SendUnreliable = 7,
    SendFragment = 8,
    SendUnsequenced = 9,
    BandwidthLimit = 10,
    ThrottleConfigure = 11,
    SendUnreliableFragment = 12,
}

impl CommandKind {
    pub const MASK: u8 = 0x0F;

    /// Serialized size of a command of this kind, including its header but excluding any
    ///  payload data that follows it
    pub fn size(&self) -> usize {
        match self {
            CommandKind::Acknowledge => 8,
            CommandKind::Connect => 48,
            CommandKind::VerifyConnect => 44,
            CommandKind::Disconnect => 8,
            CommandKind::Ping => 4,
            CommandKind::SendReliable => 6,
            CommandKind::SendUnreliable => 8,
            CommandKind::SendFragment => 24,
            CommandKind::SendUnsequenced => 8,
            CommandKind::BandwidthLimit => 12,
            CommandKind::ThrottleConfigure => 16,
            CommandKind::SendUnreliableFragment => 24,
        }
    }

    pub fn carries_payload(&self) -> bool {
        matches!(self,
            CommandKind::SendReliable
            | CommandKind::SendUnreliable
            | CommandKind::SendFragment
            | CommandKind::SendUnsequenced
            | CommandKind::SendUnreliableFragment)
    }
}

bitflags! {
    /// Flags in the upper bits of a command's first byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandFlags: u8 {
        const ACKNOWLEDGE = 1 << 7;
        const UNSEQUENCED = 1 << 6;
    }
}

/// Channel id for commands that are not scoped to a channel (connect, ping, ...)
pub const NO_CHANNEL: u8 = 0xFF;

/// ```ascii
/// 0: command tag (4 bits) | flags (upper 2 bits)
/// 1: channel id (u8)
/// 2: reliable sequence number (u16)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub kind: CommandKind,
    pub flags: CommandFlags,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
}

impl CommandHeader {
    pub const SERIALIZED_LEN: usize = 4;

    pub fn is_acknowledge_requested(&self) -> bool {
        self.flags.contains(CommandFlags::ACKNOWLEDGE)
    }

    fn ser(&self, buf: &mut impl BufMut) {
        let kind: u8 = self.kind.into();
        buf.put_u8(kind | self.flags.bits());
        buf.put_u8(self.channel_id);
        buf.put_u16(self.reliable_sequence_number);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<CommandHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("truncated command header");
        }
        let raw = buf.get_u8();
        let kind = match CommandKind::try_from(raw & CommandKind::MASK) {
            Ok(kind) => kind,
            Err(_) => bail!("unknown command tag {}", raw & CommandKind::MASK),
        };

        Ok(CommandHeader {
            kind,
            flags: CommandFlags::from_bits_truncate(raw),
            channel_id: buf.get_u8(),
            reliable_sequence_number: buf.get_u16(),
        })
    }
}

/// Connection parameters shared by Connect and VerifyConnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
}

impl ConnectParams {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.outgoing_peer_id);
        buf.put_u8(self.incoming_session_id);
        buf.put_u8(self.outgoing_session_id);
        buf.put_u32(self.mtu);
        buf.put_u32(self.window_size);
        buf.put_u32(self.channel_count);
        buf.put_u32(self.incoming_bandwidth);
        buf.put_u32(self.outgoing_bandwidth);
        buf.put_u32(self.packet_throttle_interval);
        buf.put_u32(self.packet_throttle_acceleration);
        buf.put_u32(self.packet_throttle_deceleration);
        buf.put_u32(self.connect_id);
    }

    fn deser(buf: &mut impl Buf) -> ConnectParams {
        ConnectParams {
            outgoing_peer_id: buf.get_u16(),
            incoming_session_id: buf.get_u8(),
            outgoing_session_id: buf.get_u8(),
            mtu: buf.get_u32(),
            window_size: buf.get_u32(),
            channel_count: buf.get_u32(),
            incoming_bandwidth: buf.get_u32(),
            outgoing_bandwidth: buf.get_u32(),
            packet_throttle_interval: buf.get_u32(),
            packet_throttle_acceleration: buf.get_u32(),
            packet_throttle_deceleration: buf.get_u32(),
            connect_id: buf.get_u32(),
        }
    }
}

/// Fields of SendFragment and SendUnreliableFragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentParams {
    pub start_sequence_number: u16,
    pub data_length: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub total_length: u32,
    pub fragment_offset: u32,
}

impl FragmentParams {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.start_sequence_number);
        buf.put_u16(self.data_length);
        buf.put_u32(self.fragment_count);
        buf.put_u32(self.fragment_number);
        buf.put_u32(self.total_length);
        buf.put_u32(self.fragment_offset);
    }

    fn deser(buf: &mut impl Buf) -> FragmentParams {
        FragmentParams {
            start_sequence_number: buf.get_u16(),
            data_length: buf.get_u16(),
            fragment_count: buf.get_u32(),
            fragment_number: buf.get_u32(),
            total_length: buf.get_u32(),
            fragment_offset: buf.get_u32(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBody {
    Acknowledge { received_reliable_sequence_number: u16, received_sent_time: u16 },
    Connect { params: ConnectParams, data: u32 },
    VerifyConnect(ConnectParams),
    Disconnect { data: u32 },
    Ping,
    SendReliable { data_length: u16 },
    SendUnreliable { unreliable_sequence_number: u16, data_length: u16 },
    SendFragment(FragmentParams),
    SendUnsequenced { unsequenced_group: u16, data_length: u16 },
    BandwidthLimit { incoming_bandwidth: u32, outgoing_bandwidth: u32 },
    ThrottleConfigure { packet_throttle_interval: u32, packet_throttle_acceleration: u32, packet_throttle_deceleration: u32 },
    SendUnreliableFragment(FragmentParams),
}

impl CommandBody {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandBody::Acknowledge { .. } => CommandKind::Acknowledge,
            CommandBody::Connect { .. } => CommandKind::Connect,
            CommandBody::VerifyConnect(_) => CommandKind::VerifyConnect,
            CommandBody::Disconnect { .. } => CommandKind::Disconnect,
            CommandBody::Ping => CommandKind::Ping,
            CommandBody::SendReliable { .. } => CommandKind::SendReliable,
            CommandBody::SendUnreliable { .. } => CommandKind::SendUnreliable,
            CommandBody::SendFragment(_) => CommandKind::SendFragment,
            CommandBody::SendUnsequenced { .. } => CommandKind::SendUnsequenced,
            CommandBody::BandwidthLimit { .. } => CommandKind::BandwidthLimit,
            CommandBody::ThrottleConfigure { .. } => CommandKind::ThrottleConfigure,
            CommandBody::SendUnreliableFragment(_) => CommandKind::SendUnreliableFragment,
        }
    }
}

/// A single protocol command. Commands are packed back to back into a datagram after the
///  [crate::protocol_header::ProtocolHeader]; commands carrying application data are
///  immediately followed by `data_length` bytes of payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub header: CommandHeader,
    pub body: CommandBody,
}

impl Command {
    pub fn new(flags: CommandFlags, channel_id: u8, body: CommandBody) -> Command {
        Command {
            header: CommandHeader {
                kind: body.kind(),
                flags,
                channel_id,
                reliable_sequence_number: 0,
            },
            body,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.header.kind
    }

    pub fn serialized_len(&self) -> usize {
        self.kind().size()
    }

    /// Length of the application data following this command on the wire
    pub fn data_length(&self) -> usize {
        match &self.body {
            CommandBody::SendReliable { data_length }
            | CommandBody::SendUnreliable { data_length, .. }
            | CommandBody::SendUnsequenced { data_length, .. } => *data_length as usize,
            CommandBody::SendFragment(params)
            | CommandBody::SendUnreliableFragment(params) => params.data_length as usize,
            _ => 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.header.ser(buf);

        match &self.body {
            CommandBody::Acknowledge { received_reliable_sequence_number, received_sent_time } => {
                buf.put_u16(*received_reliable_sequence_number);
                buf.put_u16(*received_sent_time);
            }
            CommandBody::Connect { params, data } => {
                params.ser(buf);
                buf.put_u32(*data);
            }
            CommandBody::VerifyConnect(params) => params.ser(buf),
            CommandBody::Disconnect { data } => buf.put_u32(*data),
            CommandBody::Ping => {}
            CommandBody::SendReliable { data_length } => buf.put_u16(*data_length),
            CommandBody::SendUnreliable { unreliable_sequence_number, data_length } => {
                buf.put_u16(*unreliable_sequence_number);
                buf.put_u16(*data_length);
            }
            CommandBody::SendFragment(params) => params.ser(buf),
            CommandBody::SendUnsequenced { unsequenced_group, data_length } => {
                buf.put_u16(*unsequenced_group);
                buf.put_u16(*data_length);
            }
            CommandBody::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth } => {
                buf.put_u32(*incoming_bandwidth);
                buf.put_u32(*outgoing_bandwidth);
            }
            CommandBody::ThrottleConfigure { packet_throttle_interval, packet_throttle_acceleration, packet_throttle_deceleration } => {
                buf.put_u32(*packet_throttle_interval);
                buf.put_u32(*packet_throttle_acceleration);
                buf.put_u32(*packet_throttle_deceleration);
            }
            CommandBody::SendUnreliableFragment(params) => params.ser(buf),
        }
    }

    /// Parses a single command. The command's full fixed-size layout must be present in the
    ///  buffer, and so must the application data it announces - the data itself is left in
    ///  the buffer for the caller to consume.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Command> {
        let available = buf.remaining();
        let header = CommandHeader::deser(buf)?;
        if available < header.kind.size() {
            bail!("command {:?} requires {} bytes, only {} left in datagram", header.kind, header.kind.size(), available);
        }

        let body = match header.kind {
            CommandKind::Acknowledge => CommandBody::Acknowledge {
                received_reliable_sequence_number: buf.get_u16(),
                received_sent_time: buf.get_u16(),
            },
            CommandKind::Connect => CommandBody::Connect {
                params: ConnectParams::deser(buf),
                data: buf.get_u32(),
            },
            CommandKind::VerifyConnect => CommandBody::VerifyConnect(ConnectParams::deser(buf)),
            CommandKind::Disconnect => CommandBody::Disconnect { data: buf.get_u32() },
            CommandKind::Ping => CommandBody::Ping,
            CommandKind::SendReliable => CommandBody::SendReliable { data_length: buf.get_u16() },
            CommandKind::SendUnreliable => CommandBody::SendUnreliable {
                unreliable_sequence_number: buf.get_u16(),
                data_length: buf.get_u16(),
            },
            CommandKind::SendFragment => CommandBody::SendFragment(FragmentParams::deser(buf)),
            CommandKind::SendUnsequenced => CommandBody::SendUnsequenced {
                unsequenced_group: buf.get_u16(),
                data_length: buf.get_u16(),
            },
            CommandKind::BandwidthLimit => CommandBody::BandwidthLimit {
                incoming_bandwidth: buf.get_u32(),
                outgoing_bandwidth: buf.get_u32(),
            },
            CommandKind::ThrottleConfigure => CommandBody::ThrottleConfigure {
                packet_throttle_interval: buf.get_u32(),
                packet_throttle_acceleration: buf.get_u32(),
                packet_throttle_deceleration: buf.get_u32(),
            },
            CommandKind::SendUnreliableFragment => CommandBody::SendUnreliableFragment(FragmentParams::deser(buf)),
        };

        let command = Command { header, body };
        if command.data_length() > buf.remaining() {
            bail!("command {:?} announces {} bytes of data, only {} left in datagram", header.kind, command.data_length(), buf.remaining());
        }
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn connect_params() -> ConnectParams {
        ConnectParams {
            outgoing_peer_id: 3,
            incoming_session_id: 1,
            outgoing_session_id: 2,
            mtu: 1400,
            window_size: 32768,
            channel_count: 4,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 8000,
            packet_throttle_interval: 5000,
            packet_throttle_acceleration: 2,
            packet_throttle_deceleration: 2,
            connect_id: 0xCAFE_BABE,
        }
    }

    fn fragment_params() -> FragmentParams {
        FragmentParams {
            start_sequence_number: 0xFFFF,
            data_length: 3,
            fragment_count: 5,
            fragment_number: 2,
            total_length: 13,
            fragment_offset: 6,
        }
    }

    #[rstest]
    #[case::acknowledge(CommandBody::Acknowledge { received_reliable_sequence_number: 65535, received_sent_time: 1234 })]
    #[case::connect(CommandBody::Connect { params: connect_params(), data: 99 })]
    #[case::verify_connect(CommandBody::VerifyConnect(connect_params()))]
    #[case::disconnect(CommandBody::Disconnect { data: 7 })]
    #[case::ping(CommandBody::Ping)]
    #[case::send_reliable(CommandBody::SendReliable { data_length: 3 })]
    #[case::send_unreliable(CommandBody::SendUnreliable { unreliable_sequence_number: 17, data_length: 3 })]
    #[case::send_fragment(CommandBody::SendFragment(fragment_params()))]
    #[case::send_unsequenced(CommandBody::SendUnsequenced { unsequenced_group: 1025, data_length: 3 })]
    #[case::bandwidth_limit(CommandBody::BandwidthLimit { incoming_bandwidth: 100_000, outgoing_bandwidth: 0 })]
    #[case::throttle_configure(CommandBody::ThrottleConfigure { packet_throttle_interval: 1000, packet_throttle_acceleration: 3, packet_throttle_deceleration: 4 })]
    #[case::send_unreliable_fragment(CommandBody::SendUnreliableFragment(fragment_params()))]
    fn test_ser_deser(#[case] body: CommandBody) {
        let mut command = Command::new(CommandFlags::ACKNOWLEDGE, 2, body);
        command.header.reliable_sequence_number = 0x1234;

        let mut buf = BytesMut::new();
        command.ser(&mut buf);
        assert_eq!(buf.len(), command.serialized_len());
        buf.extend_from_slice(&[1, 2, 3]);

        let mut b: &[u8] = &buf;
        let deser = Command::deser(&mut b).unwrap();
        assert_eq!(deser, command);
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn test_header_layout() {
        let mut command = Command::new(CommandFlags::ACKNOWLEDGE | CommandFlags::UNSEQUENCED, 1, CommandBody::SendReliable { data_length: 0x0102 });
        command.header.reliable_sequence_number = 0xABCD;

        let mut buf = BytesMut::new();
        command.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0xC6, 1, 0xAB, 0xCD, 0x01, 0x02]);
    }

    #[rstest]
    #[case::zero_tag(vec![0, 0, 0, 0])]
    #[case::tag_13(vec![13, 0, 0, 0])]
    #[case::tag_15(vec![0x8F, 0, 0, 0])]
    #[case::truncated_header(vec![5, 0])]
    #[case::truncated_body(vec![1, 0xFF, 0, 0, 0, 0])]
    #[case::missing_data(vec![6, 0, 0, 1, 0, 5, 1, 2])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(Command::deser(&mut b).is_err());
    }
}
