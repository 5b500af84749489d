use bytes::BytesMut;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Recycles the buffers outgoing datagrams are assembled in. Every buffer has room for a
///  datagram of the host's MTU, and at most `max_pooled` idle buffers are kept.
pub struct BufferPool {
    buf_size: usize,
    max_pooled: usize,
    pooled: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pooled: usize) -> Self {
        BufferPool {
            buf_size,
            max_pooled,
            pooled: Mutex::new(Vec::new()),
        }
    }

    /// Returns an empty buffer with a capacity of at least one datagram
    pub fn get_from_pool(&self) -> BytesMut {
        let pooled = self.pooled.lock().unwrap().pop();
        match pooled {
            Some(buf) => {
                trace!("reusing pooled datagram buffer");
                buf
            }
            None => {
                debug!("datagram buffer pool is empty: allocating {} bytes", self.buf_size);
                BytesMut::with_capacity(self.buf_size)
            }
        }
    }

    pub fn return_to_pool(&self, mut buf: BytesMut) {
        if buf.capacity() < self.buf_size {
            debug!("datagram buffer shrank to {} bytes - discarding", buf.capacity());
            return;
        }
        buf.clear();

        let mut pooled = self.pooled.lock().unwrap();
        if pooled.len() < self.max_pooled {
            pooled.push(buf);
        }
        else {
            trace!("datagram buffer pool is full - discarding buffer");
        }
    }
}
