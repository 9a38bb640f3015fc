//! Connection-oriented transport over TCP

use std::io;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, trace};

use crate::codec::{FrameItem, WireFraming};
use crate::error::{ConnectError, ReceiveError, SendError};
use crate::transport::Transport;

/// How a stream is cut into messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFraming {
    /// Newline-terminated text lines up to `max_length` bytes
    Lines { max_length: usize },
    /// Binary packets behind a u32 length prefix
    LengthPrefixed,
}

impl StreamFraming {
    fn build(self) -> WireFraming {
        match self {
            StreamFraming::Lines { max_length } => WireFraming::lines(max_length),
            StreamFraming::LengthPrefixed => WireFraming::length_prefixed(),
        }
    }
}

struct WriteSide {
    half: OwnedWriteHalf,
    framing: WireFraming,
    buf: BytesMut,
}

/// TCP transport with independently locked read and write halves.
pub struct StreamTransport {
    framing: StreamFraming,
    read_timeout: Duration,
    write_timeout: Duration,
    reader: Mutex<Option<FramedRead<OwnedReadHalf, WireFraming>>>,
    writer: Mutex<Option<WriteSide>>,
}

impl StreamTransport {
    /// Create a disconnected transport.
    ///
    /// `read_timeout` bounds every `receive`; writes are bounded by the same value.
    pub fn new(framing: StreamFraming, read_timeout: Duration) -> Self {
        Self {
            framing,
            read_timeout,
            write_timeout: read_timeout,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Override the bound on a single write.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn framing(&self) -> StreamFraming {
        self.framing
    }

    async fn write_all(side: &mut WriteSide) -> Result<(), SendError> {
        let total = side.buf.len();
        let mut written = 0;
        while written < total {
            match side.half.write(&side.buf[written..]).await {
                Ok(0) => return Err(SendError::BrokenPipe { written, total }),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_disconnect(&e) => return Err(SendError::BrokenPipe { written, total }),
                Err(e) => return Err(SendError::Io(e)),
            }
        }
        side.half.flush().await.map_err(SendError::from)
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

#[async_trait::async_trait]
impl Transport for StreamTransport {
    async fn connect(&self, address: &str) -> Result<(), ConnectError> {
        self.close().await;

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ConnectError::from_io(address, e))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to disable Nagle on {}: {}", address, e);
        }

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(FramedRead::new(read_half, self.framing.build()));
        *self.writer.lock().await =
            Some(WriteSide { half: write_half, framing: self.framing.build(), buf: BytesMut::new() });

        debug!("TCP connected to {}", address);
        Ok(())
    }

    async fn send(&self, message: Bytes) -> Result<(), SendError> {
        let mut guard = self.writer.lock().await;
        let side = guard.as_mut().ok_or(SendError::NotConnected)?;

        side.buf.clear();
        side.framing.encode(message, &mut side.buf).map_err(SendError::Io)?;
        trace!("TCP write {} bytes", side.buf.len());

        match tokio::time::timeout(self.write_timeout, Self::write_all(side)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout { duration: self.write_timeout }),
        }
    }

    async fn receive(&self) -> Result<Bytes, ReceiveError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ReceiveError::NotConnected)?;

        match tokio::time::timeout(self.read_timeout, reader.next()).await {
            Err(_) => Err(ReceiveError::Timeout { duration: self.read_timeout }),
            Ok(None) => Err(ReceiveError::ConnectionReset { reason: "peer closed the connection".into() }),
            // A framing error leaves the stream out of sync; only a reconnect recovers it.
            Ok(Some(Err(e))) => Err(ReceiveError::ConnectionReset { reason: e.to_string() }),
            Ok(Some(Ok(FrameItem::Frame(message)))) => Ok(message),
            Ok(Some(Ok(FrameItem::Discarded { len }))) => Err(ReceiveError::Malformed {
                details: format!("discarded {} bytes exceeding the line limit", len),
            }),
        }
    }

    async fn close(&self) {
        self.reader.lock().await.take();
        if let Some(mut side) = self.writer.lock().await.take() {
            if let Err(e) = side.half.shutdown().await {
                trace!("TCP shutdown: {}", e);
            }
        }
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair(framing: StreamFraming) -> (StreamTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let transport = StreamTransport::new(framing, Duration::from_millis(200));

        let (connected, accepted) = tokio::join!(transport.connect(&address), listener.accept());
        connected.unwrap();
        (transport, accepted.unwrap().0)
    }

    #[tokio::test]
    async fn receives_lines_split_across_writes() {
        let (transport, mut peer) = pair(StreamFraming::Lines { max_length: 128 }).await;

        peer.write_all(b"move 10.0 2").await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.write_all(b"0.0 30.0\nmove 1 2 3\n").await.unwrap();

        assert_eq!(&transport.receive().await.unwrap()[..], b"move 10.0 20.0 30.0");
        assert_eq!(&transport.receive().await.unwrap()[..], b"move 1 2 3");
    }

    #[tokio::test]
    async fn receive_times_out_without_data() {
        let (transport, _peer) = pair(StreamFraming::Lines { max_length: 128 }).await;
        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, ReceiveError::Timeout { .. }));
    }

    #[tokio::test]
    async fn overlong_line_is_reported_as_malformed() {
        let (transport, mut peer) = pair(StreamFraming::Lines { max_length: 16 }).await;
        peer.write_all(&[b'9'; 40]).await.unwrap();
        peer.write_all(b"\nmove 1\n").await.unwrap();

        assert!(matches!(transport.receive().await, Err(ReceiveError::Malformed { .. })));
        assert_eq!(&transport.receive().await.unwrap()[..], b"move 1");
    }

    #[tokio::test]
    async fn peer_close_is_connection_reset() {
        let (transport, peer) = pair(StreamFraming::Lines { max_length: 128 }).await;
        drop(peer);
        let err = transport.receive().await.unwrap_err();
        assert!(err.is_fatal(), "{err}");
    }

    #[tokio::test]
    async fn length_prefixed_send_is_framed() {
        let (transport, mut peer) = pair(StreamFraming::LengthPrefixed).await;
        transport.send(Bytes::from_static(b"\xAA\xBB")).await.unwrap();

        let mut wire = [0u8; 6];
        peer.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, [0, 0, 0, 2, 0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn operations_before_connect_fail() {
        let transport = StreamTransport::new(StreamFraming::LengthPrefixed, Duration::from_millis(10));
        assert!(matches!(transport.receive().await, Err(ReceiveError::NotConnected)));
        assert!(matches!(transport.send(Bytes::new()).await, Err(SendError::NotConnected)));
        transport.close().await;
    }

    #[tokio::test]
    async fn refused_connect_is_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = StreamTransport::new(StreamFraming::LengthPrefixed, Duration::from_millis(10));
        let err = transport.connect(&address).await.unwrap_err();
        assert!(matches!(err, ConnectError::Refused { .. }), "{err}");
    }

    #[tokio::test]
    async fn close_then_send_is_not_connected() {
        let (transport, _peer) = pair(StreamFraming::LengthPrefixed).await;
        transport.close().await;
        assert!(matches!(transport.send(Bytes::from_static(b"x")).await, Err(SendError::NotConnected)));
    }
}
