//! Datagram transport behind the server frame.
//!
//! The frame drains packets until the transport reports none are left, so
//! every implementation must be non-blocking.

use log::{debug, warn};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

pub const MAX_PACKET_SIZE: usize = 2048;

pub trait Transport {
    /// Next pending datagram, or `None` when nothing is waiting.
    fn get_packet(&mut self) -> io::Result<Option<(SocketAddr, Vec<u8>)>>;

    fn send_packet(&mut self, to: SocketAddr, data: &[u8]) -> io::Result<()>;
}

/// Loopback addresses skip the challenge and the reconnect throttle.
pub fn is_local_address(address: SocketAddr) -> bool {
    address.ip().is_loopback()
}

/// UDP transport over a tokio socket, driven with the non-blocking
/// `try_*` calls from inside the synchronous frame.
pub struct UdpTransport {
    socket: UdpSocket,
    buffer: Vec<u8>,
}

impl UdpTransport {
    pub async fn bind(address: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind(address).await?;
        Ok(Self::from_socket(socket))
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            buffer: vec![0u8; MAX_PACKET_SIZE],
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn get_packet(&mut self) -> io::Result<Option<(SocketAddr, Vec<u8>)>> {
        loop {
            match self.socket.try_recv_from(&mut self.buffer) {
                Ok((len, from)) => return Ok(Some((from, self.buffer[..len].to_vec()))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // An ICMP port unreachable from an earlier send; not our problem.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    debug!("Ignoring connection reset on receive");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn send_packet(&mut self, to: SocketAddr, data: &[u8]) -> io::Result<()> {
        match self.socket.try_send_to(data, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!("Send buffer full, dropped {} bytes to {}", data.len(), to);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// In-memory transport for tests and local harnesses.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    pub inbound: VecDeque<(SocketAddr, Vec<u8>)>,
    pub outbound: Vec<(SocketAddr, Vec<u8>)>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a datagram as if it arrived from `from`.
    pub fn deliver(&mut self, from: SocketAddr, data: Vec<u8>) {
        self.inbound.push_back((from, data));
    }

    /// Takes everything the server sent so far.
    pub fn take_sent(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.outbound)
    }
}

impl Transport for MemoryTransport {
    fn get_packet(&mut self) -> io::Result<Option<(SocketAddr, Vec<u8>)>> {
        Ok(self.inbound.pop_front())
    }

    fn send_packet(&mut self, to: SocketAddr, data: &[u8]) -> io::Result<()> {
        self.outbound.push((to, data.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_address() {
        assert!(is_local_address("127.0.0.1:27910".parse().unwrap()));
        assert!(is_local_address("[::1]:27910".parse().unwrap()));
        assert!(!is_local_address("10.0.0.1:27910".parse().unwrap()));
    }

    #[test]
    fn test_memory_transport_is_fifo() {
        let mut transport = MemoryTransport::new();
        let from: SocketAddr = "10.0.0.2:27901".parse().unwrap();
        transport.deliver(from, vec![1]);
        transport.deliver(from, vec![2]);

        assert_eq!(transport.get_packet().unwrap(), Some((from, vec![1])));
        assert_eq!(transport.get_packet().unwrap(), Some((from, vec![2])));
        assert_eq!(transport.get_packet().unwrap(), None);

        transport.send_packet(from, b"ack").unwrap();
        assert_eq!(transport.take_sent(), vec![(from, b"ack".to_vec())]);
        assert!(transport.outbound.is_empty());
    }

    #[tokio::test]
    async fn test_udp_transport_drains_until_empty() {
        let mut server = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let target = server.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        assert!(server.get_packet().unwrap().is_none());

        sender.send_to(b"first", target).await.unwrap();
        sender.send_to(b"second", target).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut received = Vec::new();
        while let Some((_, data)) = server.get_packet().unwrap() {
            received.push(data);
        }
        assert_eq!(received, vec![b"first".to_vec(), b"second".to_vec()]);
    }
}
