//! A reliable, connection-oriented protocol on top of UDP datagrams.
//!
//! A [host::Host] owns a datagram socket and a fixed number of peer slots. Each connection
//!  to a remote host is a [peer::Peer] with a number of independent channels. Packets are
//!  sent on a channel either reliably (acknowledged, retransmitted and delivered in order),
//!  unreliably (sequenced, late packets are dropped), or unsequenced (neither acknowledged
//!  nor ordered, duplicates are dropped). Packets too big for a datagram are fragmented and
//!  reassembled transparently.
//!
//! Protocol processing happens in calls to [host::Host::service] and
//!  [host::Host::flush], there are no background tasks. `service` returns
//!  [event::Event]s for established and closed connections and for received packets.
//!
//! Round trip times are measured per peer and drive retransmission timeouts and a packet
//!  throttle that adapts the amount of data in flight to the connection. A host can be
//!  configured with bandwidth limits, which are shared between its peers.
//!
//! The socket is abstracted by [socket::DatagramSocket], so hosts can run on a simulated
//!  network for testing (see [test_util]).

pub mod bandwidth;
pub mod buffer_pool;
pub mod channel;
pub mod checksum;
pub mod commands;
pub mod compressor;
pub mod config;
pub mod congestion;
pub mod error;
pub mod event;
pub mod fragment;
pub mod host;
mod incoming;
mod outgoing;
pub mod packet;
pub mod peer;
pub mod protocol;
pub mod protocol_header;
pub mod queued_command;
pub mod safe_converter;
pub mod socket;
pub mod test_util;
pub mod time;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
