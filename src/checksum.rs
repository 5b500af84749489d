use crc::{Crc, CRC_32_ISO_HDLC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Integrity check over a datagram. When a host is configured with a checksum, its value is
///  stored after the protocol header, and datagrams with a mismatching checksum are dropped.
///  Both sides of a connection must use the same checksum.
pub trait Checksum: Send + Sync + 'static {
    fn checksum(&self, buffers: &[&[u8]]) -> u32;
}

pub struct Crc32Checksum;

impl Checksum for Crc32Checksum {
    fn checksum(&self, buffers: &[&[u8]]) -> u32 {
        let mut digest = CRC32.digest();
        for buf in buffers {
            digest.update(buf);
        }
        digest.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(Crc32Checksum.checksum(&[b"123456789"]), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_split_buffers() {
        assert_eq!(
            Crc32Checksum.checksum(&[b"1234", b"", b"56789"]),
            Crc32Checksum.checksum(&[b"123456789"]),
        );
    }
}
