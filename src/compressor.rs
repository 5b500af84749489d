/// Compression of a datagram's command payload (everything after the protocol header). A
///  host sends the compressed form only if it is smaller than the original, flagging this in
///  the protocol header. Both sides of a connection must use the same compressor.
pub trait Compressor: Send + Sync + 'static {
    /// Returns `None` if the input can not be compressed into at most `limit` bytes
    fn compress(&self, input: &[u8], limit: usize) -> Option<Vec<u8>>;

    /// Returns `None` if the input is corrupt or expands to more than `limit` bytes
    fn decompress(&self, input: &[u8], limit: usize) -> Option<Vec<u8>>;
}
