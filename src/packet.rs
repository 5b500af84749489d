use bitflags::bitflags;
use bytes::Bytes;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u32 {
        /// must be received by the target peer and resent until it is acknowledged
        const RELIABLE = 1 << 0;
        /// not sequenced with other packets, delivered as soon as it arrives
        const UNSEQUENCED = 1 << 1;
        /// the packet shares the application's buffer instead of copying it
        const NO_ALLOCATE = 1 << 2;
        /// if the packet needs fragmenting and is unreliable, send the fragments unreliably
        ///  instead of falling back to reliable fragments
        const UNRELIABLE_FRAGMENT = 1 << 3;
        /// the packet was handed to the socket at least once
        const SENT = 1 << 8;
    }
}

type FreeCallback = Box<dyn FnOnce(&Bytes) + Send + Sync>;

struct PacketData {
    data: Bytes,
    flags: PacketFlags,
    sent: AtomicBool,
    free_callback: Option<FreeCallback>,
}

impl Drop for PacketData {
    fn drop(&mut self) {
        if let Some(callback) = self.free_callback.take() {
            callback(&self.data);
        }
    }
}

/// An application message. Packets are cheap to clone: all clones share the same buffer, and
///  a packet is freed (and its free callback invoked) only when the last clone is dropped,
///  e.g. when it was broadcast to several peers and the last peer's queue releases it.
#[derive(Clone)]
pub struct Packet {
    inner: Arc<PacketData>,
}

impl Packet {
    /// Creates a packet holding a copy of `data`
    pub fn new(data: &[u8], flags: PacketFlags) -> Packet {
        Self::build(Bytes::copy_from_slice(data), flags - PacketFlags::NO_ALLOCATE, None)
    }

    /// Creates a packet sharing the application's buffer without copying
    pub fn from_bytes(data: Bytes, flags: PacketFlags) -> Packet {
        Self::build(data, flags | PacketFlags::NO_ALLOCATE, None)
    }

    /// Creates a packet that notifies the application when it is freed, i.e. when all
    ///  queues referencing it released it
    pub fn with_free_callback(data: Bytes, flags: PacketFlags, callback: impl FnOnce(&Bytes) + Send + Sync + 'static) -> Packet {
        Self::build(data, flags | PacketFlags::NO_ALLOCATE, Some(Box::new(callback)))
    }

    /// A packet received from a remote peer, owning its buffer
    pub(crate) fn received(data: Bytes, flags: PacketFlags) -> Packet {
        Self::build(data, flags - PacketFlags::NO_ALLOCATE, None)
    }

    fn build(data: Bytes, flags: PacketFlags, free_callback: Option<FreeCallback>) -> Packet {
        Packet {
            inner: Arc::new(PacketData {
                data,
                flags: flags - PacketFlags::SENT,
                sent: AtomicBool::new(false),
                free_callback,
            }),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    pub fn bytes(&self) -> &Bytes {
        &self.inner.data
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    pub fn flags(&self) -> PacketFlags {
        if self.inner.sent.load(Ordering::Acquire) {
            self.inner.flags | PacketFlags::SENT
        }
        else {
            self.inner.flags
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.inner.flags.contains(PacketFlags::RELIABLE)
    }

    pub(crate) fn mark_sent(&self) {
        self.inner.sent.store(true, Ordering::Release);
    }

    /// number of handles (application and queue entries) currently referencing this packet
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_new_copies() {
        let raw = vec![1u8, 2, 3];
        let packet = Packet::new(&raw, PacketFlags::RELIABLE | PacketFlags::NO_ALLOCATE | PacketFlags::SENT);
        assert_eq!(packet.data(), &[1, 2, 3]);
        assert_eq!(packet.flags(), PacketFlags::RELIABLE);
        assert!(packet.is_reliable());
    }

    #[test]
    fn test_from_bytes_shares() {
        let raw = Bytes::from_static(b"abc");
        let packet = Packet::from_bytes(raw.clone(), PacketFlags::empty());
        assert_eq!(packet.bytes().as_ptr(), raw.as_ptr());
        assert!(packet.flags().contains(PacketFlags::NO_ALLOCATE));
    }

    #[test]
    fn test_sent_flag() {
        let packet = Packet::new(b"x", PacketFlags::empty());
        let queued = packet.clone();
        assert!(!packet.flags().contains(PacketFlags::SENT));
        queued.mark_sent();
        assert!(packet.flags().contains(PacketFlags::SENT));
    }

    #[test]
    fn test_free_callback_runs_once_after_last_release() {
        let freed = Arc::new(AtomicUsize::new(0));
        let freed_in_callback = freed.clone();
        let packet = Packet::with_free_callback(Bytes::from_static(b"abc"), PacketFlags::RELIABLE, move |data| {
            assert_eq!(data.as_ref(), b"abc");
            freed_in_callback.fetch_add(1, Ordering::SeqCst);
        });

        let queue_a = packet.clone();
        let queue_b = packet.clone();
        assert_eq!(packet.reference_count(), 3);

        drop(packet);
        drop(queue_a);
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        drop(queue_b);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }
}
