use std::net::SocketAddr;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

/// This is an abstraction for putting a datagram on the wire, introduced to facilitate mocking
///  the I/O part away for testing.
///
/// Sending does not wait: genes are sent while holding their transmission's lock, and a
///  datagram the socket can not take right now is treated like one lost on the network.
#[cfg_attr(test, automock)]
pub trait NetSender: Send + Sync + 'static {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);
}

impl NetSender for UdpSocket {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);

        match self.try_send_to(datagram, to) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("socket buffer full - datagram to {:?} is dropped and will be retransmitted", to);
            }
            Err(e) => {
                error!("error sending UDP datagram to {:?}: {}", to, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_udp_socket_sends_datagram() {
        let sender: Arc<dyn NetSender> = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender.send_datagram(receiver.local_addr().unwrap(), b"gene");

        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"gene");
    }
}
