//! Datagram transport over UDP

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{ConnectError, ReceiveError, SendError};
use crate::transport::Transport;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// UDP transport; one message per datagram.
///
/// "Connecting" binds a local socket and fixes the peer address, so the OS
/// filters datagrams from anyone else and surfaces ICMP port-unreachable as
/// a connection error. Loss and reordering are left to sequence numbers.
pub struct DatagramTransport {
    bind_address: SocketAddr,
    read_timeout: Duration,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    /// Scratch space for one datagram; each message is copied out at its own length
    recv_buf: Mutex<Vec<u8>>,
}

impl DatagramTransport {
    pub fn new(bind_address: SocketAddr, read_timeout: Duration) -> Self {
        Self {
            bind_address,
            read_timeout,
            socket: Mutex::new(None),
            recv_buf: Mutex::new(vec![0u8; MAX_DATAGRAM_LEN]),
        }
    }

    async fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().await.clone()
    }

    /// Local address of the bound socket, if connected.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.socket().await.and_then(|socket| socket.local_addr().ok())
    }
}

#[async_trait::async_trait]
impl Transport for DatagramTransport {
    async fn connect(&self, address: &str) -> Result<(), ConnectError> {
        self.close().await;

        let socket = UdpSocket::bind(self.bind_address)
            .await
            .map_err(|e| ConnectError::from_io(&self.bind_address.to_string(), e))?;
        socket.connect(address).await.map_err(|e| ConnectError::from_io(address, e))?;

        debug!(
            "UDP socket {} bound for peer {}",
            socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            address
        );
        *self.socket.lock().await = Some(Arc::new(socket));
        Ok(())
    }

    async fn send(&self, message: Bytes) -> Result<(), SendError> {
        let socket = self.socket().await.ok_or(SendError::NotConnected)?;
        let written = socket.send(&message).await?;
        if written < message.len() {
            return Err(SendError::BrokenPipe { written, total: message.len() });
        }
        trace!("UDP sent {} bytes", written);
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes, ReceiveError> {
        let socket = self.socket().await.ok_or(ReceiveError::NotConnected)?;
        let mut buf = self.recv_buf.lock().await;

        match tokio::time::timeout(self.read_timeout, socket.recv(&mut buf[..])).await {
            Err(_) => Err(ReceiveError::Timeout { duration: self.read_timeout }),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(len)) => {
                trace!("UDP received {} bytes", len);
                Ok(Bytes::copy_from_slice(&buf[..len]))
            }
        }
    }

    async fn close(&self) {
        if self.socket.lock().await.take().is_some() {
            debug!("UDP socket released");
        }
    }

    fn kind(&self) -> &'static str {
        "udp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn exchanges_datagrams_with_peer() {
        let peer = UdpSocket::bind(loopback()).await.unwrap();
        let transport = DatagramTransport::new(loopback(), Duration::from_millis(200));
        transport.connect(&peer.local_addr().unwrap().to_string()).await.unwrap();

        transport.send(Bytes::from_static(b"packet")).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"packet");
        assert_eq!(Some(from), transport.local_addr().await);

        peer.send_to(b"telemetry", from).await.unwrap();
        assert_eq!(&transport.receive().await.unwrap()[..], b"telemetry");
    }

    #[tokio::test]
    async fn consecutive_datagrams_keep_their_own_length() {
        let peer = UdpSocket::bind(loopback()).await.unwrap();
        let transport = DatagramTransport::new(loopback(), Duration::from_millis(200));
        transport.connect(&peer.local_addr().unwrap().to_string()).await.unwrap();
        let local = transport.local_addr().await.unwrap();

        peer.send_to(b"long telemetry packet", local).await.unwrap();
        peer.send_to(b"abc", local).await.unwrap();
        peer.send_to(&[7u8; 1_400], local).await.unwrap();

        let first = transport.receive().await.unwrap();
        let second = transport.receive().await.unwrap();
        let third = transport.receive().await.unwrap();
        assert_eq!(&first[..], b"long telemetry packet");
        assert_eq!(&second[..], b"abc");
        assert_eq!(third.len(), 1_400);
        assert!(third.iter().all(|b| *b == 7));

        // earlier results are independent of the reused scratch space
        assert_eq!(&first[..], b"long telemetry packet");
    }

    #[tokio::test]
    async fn receive_times_out() {
        let peer = UdpSocket::bind(loopback()).await.unwrap();
        let transport = DatagramTransport::new(loopback(), Duration::from_millis(20));
        transport.connect(&peer.local_addr().unwrap().to_string()).await.unwrap();

        assert!(matches!(transport.receive().await, Err(ReceiveError::Timeout { .. })));
    }

    #[tokio::test]
    async fn closed_transport_reports_not_connected() {
        let transport = DatagramTransport::new(loopback(), Duration::from_millis(20));
        assert!(matches!(transport.receive().await, Err(ReceiveError::NotConnected)));
        assert!(matches!(transport.send(Bytes::from_static(b"x")).await, Err(SendError::NotConnected)));
        assert_eq!(transport.local_addr().await, None);
    }

    #[tokio::test]
    async fn invalid_peer_address_is_rejected() {
        let transport = DatagramTransport::new(loopback(), Duration::from_millis(20));
        assert!(transport.connect("not an address").await.is_err());
    }
}
