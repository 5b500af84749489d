use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for the datagram socket a host runs on, introduced to facilitate
///  mocking the I/O part away for testing and running hosts on a simulated network.
///
/// Receiving is non-blocking: the host drains all available datagrams with
///  [DatagramSocket::try_receive_datagram] and waits with [DatagramSocket::wait_readable]
///  only when it has nothing else to do.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<usize>;

    /// returns [io::ErrorKind::WouldBlock] if no datagram is available
    fn try_receive_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// completes when a datagram may be available for receiving
    async fn wait_readable(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<usize> {
        trace!("UDP socket: sending datagram of {} bytes to {:?}", datagram.len(), to);
        self.send_to(datagram, to).await
    }

    fn try_receive_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.try_recv_from(buf)
    }

    async fn wait_readable(&self) -> io::Result<()> {
        self.readable().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
