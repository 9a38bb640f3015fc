//! Test doubles for transports, event sinks and the two peers.
//!
//! [`ScriptedTransport`] stands in for a real link without touching the network,
//! so supervisor and orchestrator tests can run on paused time.
//! [`FakeRobot`] and [`FakeAnimationTool`] are loopback peers for tests that
//! exercise the real transports.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;

use crate::codec::{decode_telemetry, encode_telemetry};
use crate::error::{ConnectError, DecodeError, ReceiveError, SendError};
use crate::events::{BridgeEvent, EventSink};
use crate::transport::Transport;
use crate::types::{ConnectionState, LinkId, Telemetry};

/// Event sink that keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<BridgeEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// `(from, to)` pairs of every state transition on `link`.
    pub fn transitions(&self, link: LinkId) -> Vec<(ConnectionState, ConnectionState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BridgeEvent::StateTransition { link: l, from, to, .. } if l == link => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&BridgeEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: BridgeEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

enum ConnectStep {
    Fail(ConnectError),
    Hang,
}

/// In-memory transport driven by the test.
///
/// Connects succeed unless scripted otherwise. Inbound messages queued with
/// [`push_inbound`](Self::push_inbound) are returned by `receive`; everything
/// sent is recorded.
pub struct ScriptedTransport {
    read_timeout: Duration,
    connect_script: Mutex<VecDeque<ConnectStep>>,
    refuse_all: AtomicBool,
    connected: AtomicBool,
    connects: AtomicUsize,
    closes: AtomicUsize,
    inbound_tx: mpsc::UnboundedSender<Result<Bytes, ReceiveError>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Bytes, ReceiveError>>>,
    send_failures: Mutex<VecDeque<SendError>>,
    sent: Mutex<Vec<Bytes>>,
}

impl ScriptedTransport {
    pub fn new(read_timeout: Duration) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            read_timeout,
            connect_script: Mutex::new(VecDeque::new()),
            refuse_all: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            send_failures: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_connect(&self, error: ConnectError) {
        self.connect_script.lock().unwrap().push_back(ConnectStep::Fail(error));
    }

    /// The next connect attempt never completes on its own.
    pub fn hang_next_connect(&self) {
        self.connect_script.lock().unwrap().push_back(ConnectStep::Hang);
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_next_send(&self, error: SendError) {
        self.send_failures.lock().unwrap().push_back(error);
    }

    pub fn push_inbound(&self, message: impl Into<Bytes>) {
        let _ = self.inbound_tx.send(Ok(message.into()));
    }

    pub fn push_inbound_error(&self, error: ReceiveError) {
        let _ = self.inbound_tx.send(Err(error));
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Closes of an open connection.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, address: &str) -> Result<(), ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.connect_script.lock().unwrap().pop_front();
        match step {
            Some(ConnectStep::Fail(error)) => return Err(error),
            Some(ConnectStep::Hang) => std::future::pending::<()>().await,
            None if self.refuse_all.load(Ordering::SeqCst) => {
                return Err(ConnectError::Refused { address: address.to_string() });
            }
            None => {}
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: Bytes) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        if let Some(error) = self.send_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes, ReceiveError> {
        if !self.is_connected() {
            return Err(ReceiveError::NotConnected);
        }
        let mut inbound = self.inbound_rx.lock().await;
        match tokio::time::timeout(self.read_timeout, inbound.recv()).await {
            Err(_) => Err(ReceiveError::Timeout { duration: self.read_timeout }),
            Ok(None) => Err(ReceiveError::ConnectionReset { reason: "script ended".into() }),
            Ok(Some(item)) => item,
        }
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }
}

/// Robot controller stand-in on a loopback UDP socket.
pub struct FakeRobot {
    socket: UdpSocket,
}

impl FakeRobot {
    pub async fn bind() -> std::io::Result<Self> {
        Ok(Self { socket: UdpSocket::bind("127.0.0.1:0").await? })
    }

    pub fn address(&self) -> String {
        self.socket.local_addr().map(|a| a.to_string()).unwrap_or_default()
    }

    /// Receive one motion packet and decode it as telemetry-shaped data.
    pub async fn recv_packet(&self) -> std::io::Result<(Result<Telemetry, DecodeError>, SocketAddr)> {
        let mut buf = vec![0u8; 65_507];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        Ok((decode_telemetry(&buf[..len]), from))
    }

    pub async fn send_telemetry(&self, telemetry: &Telemetry, to: SocketAddr) -> std::io::Result<()> {
        self.socket.send_to(&encode_telemetry(telemetry), to).await.map(|_| ())
    }

    pub async fn send_raw(&self, bytes: &[u8], to: SocketAddr) -> std::io::Result<()> {
        self.socket.send_to(bytes, to).await.map(|_| ())
    }
}

/// Animation tool command port stand-in on a loopback TCP listener.
pub struct FakeAnimationTool {
    listener: TcpListener,
}

impl FakeAnimationTool {
    pub async fn bind() -> std::io::Result<Self> {
        Ok(Self { listener: TcpListener::bind("127.0.0.1:0").await? })
    }

    pub fn address(&self) -> String {
        self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    }

    pub async fn accept(&self) -> std::io::Result<AnimationSession> {
        let (stream, _) = self.listener.accept().await?;
        Ok(AnimationSession { stream: BufReader::new(stream) })
    }
}

/// One accepted bridge connection on the fake animation tool.
pub struct AnimationSession {
    stream: BufReader<TcpStream>,
}

impl AnimationSession {
    pub async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await
    }

    /// Next line from the bridge without its terminator; `None` on EOF.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end().to_string()))
    }
}
