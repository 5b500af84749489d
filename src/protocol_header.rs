use anyhow::bail;
use bytes::{Buf, BufMut};

/// The header at the start of every datagram. The peer id field doubles as a flag carrier:
///
/// ```ascii
/// bit 15:     sent time present
/// bit 14:     command payload is compressed
/// bit 12-13:  session id
/// bit 0-11:   peer id (0xFFF if the sender does not know the receiver's peer id yet)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub peer_id: u16,
    pub session_id: u8,
    pub compressed: bool,
    pub sent_time: Option<u16>,
}

impl ProtocolHeader {
    pub const FLAG_COMPRESSED: u16 = 1 << 14;
    pub const FLAG_SENT_TIME: u16 = 1 << 15;
    pub const SESSION_MASK: u16 = 3 << 12;
    pub const SESSION_SHIFT: u16 = 12;
    pub const PEER_ID_MASK: u16 = !(Self::FLAG_COMPRESSED | Self::FLAG_SENT_TIME | Self::SESSION_MASK);

    pub const MIN_SERIALIZED_LEN: usize = 2;
    pub const MAX_SERIALIZED_LEN: usize = 4;

    pub fn serialized_len(&self) -> usize {
        if self.sent_time.is_some() {
            Self::MAX_SERIALIZED_LEN
        }
        else {
            Self::MIN_SERIALIZED_LEN
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut raw = self.peer_id & Self::PEER_ID_MASK;
        raw |= ((self.session_id as u16) << Self::SESSION_SHIFT) & Self::SESSION_MASK;
        if self.compressed {
            raw |= Self::FLAG_COMPRESSED;
        }
        if self.sent_time.is_some() {
            raw |= Self::FLAG_SENT_TIME;
        }

        buf.put_u16(raw);
        if let Some(sent_time) = self.sent_time {
            buf.put_u16(sent_time);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ProtocolHeader> {
        if buf.remaining() < Self::MIN_SERIALIZED_LEN {
            bail!("datagram too short for protocol header");
        }
        let raw = buf.get_u16();

        let sent_time = if raw & Self::FLAG_SENT_TIME != 0 {
            if buf.remaining() < 2 {
                bail!("datagram too short for sent time");
            }
            Some(buf.get_u16())
        }
        else {
            None
        };

        Ok(ProtocolHeader {
            peer_id: raw & Self::PEER_ID_MASK,
            session_id: ((raw & Self::SESSION_MASK) >> Self::SESSION_SHIFT) as u8,
            compressed: raw & Self::FLAG_COMPRESSED != 0,
            sent_time,
        })
    }
}
