//! Splitting of packets that do not fit into a single datagram, and bookkeeping for their
//!  reassembly on the receiving side.
//!
//! All fragments of a packet carry the packet's total length, the number of fragments and
//!  the sequence number of the first fragment, so the receiver can allocate the full buffer
//!  when the first fragment (in arrival order) comes in, and fill it in any order.

use crate::safe_converter::SafeCast;
use anyhow::bail;
use bit_set::BitSet;
use bytes::{Bytes, BytesMut};

/// Number of fragments needed for a packet of `total_length` bytes, `fragment_length` being
///  the maximum payload per fragment
pub fn fragment_count(total_length: usize, fragment_length: usize) -> usize {
    total_length.div_ceil(fragment_length)
}

/// `(offset, length)` of each fragment of a packet, in order
pub fn fragment_ranges(total_length: usize, fragment_length: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..fragment_count(total_length, fragment_length))
        .map(move |n| {
            let offset = n * fragment_length;
            (offset, fragment_length.min(total_length - offset))
        })
}

/// A packet being reassembled from fragments
pub struct Reassembly {
    buffer: BytesMut,
    received: BitSet,
    fragment_count: u32,
    fragments_remaining: u32,
}

impl Reassembly {
    pub fn new(fragment_count: u32, total_length: u32) -> Reassembly {
        Reassembly {
            buffer: BytesMut::zeroed(total_length.safe_cast()),
            received: BitSet::with_capacity(fragment_count.safe_cast()),
            fragment_count,
            fragments_remaining: fragment_count,
        }
    }

    pub fn fragment_count(&self) -> u32 {
        self.fragment_count
    }

    pub fn fragments_remaining(&self) -> u32 {
        self.fragments_remaining
    }

    pub fn total_length(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_complete(&self) -> bool {
        self.fragments_remaining == 0
    }

    /// Copies a fragment's data into place. Returns `false` without touching the buffer if
    ///  this fragment was received before.
    pub fn add_fragment(&mut self, fragment_number: u32, fragment_offset: u32, data: &[u8]) -> anyhow::Result<bool> {
        if fragment_number >= self.fragment_count {
            bail!("fragment number {} exceeds fragment count {}", fragment_number, self.fragment_count);
        }
        let offset: usize = fragment_offset.safe_cast();
        if offset >= self.buffer.len() || data.len() > self.buffer.len() - offset {
            bail!("fragment at offset {} with {} bytes exceeds total length {}", offset, data.len(), self.buffer.len());
        }

        if !self.received.insert(fragment_number.safe_cast()) {
            return Ok(false);
        }
        self.fragments_remaining -= 1;
        self.buffer[offset..offset + data.len()].copy_from_slice(data);
        Ok(true)
    }

    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }
}
