//! MQTT Connection Handler
//!
//! One [`Connection`] runs per accepted stream. It owns the socket, feeds
//! decoded packets to its [`SessionEngine`] and turns the engine's replies
//! and events into writes and backend calls. Other tasks reach it only
//! through the session's outbound channel.

mod connect;
mod disconnect;
mod subscribe;


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::backend::{Backend, BackendError, Session};
use crate::broker::BrokerConfig;
use crate::codec::{Decoder, Encoder};
use crate::protocol::{ConnectReturnCode, DecodeError, EncodeError, Packet, Publish, Will};
use crate::session::{EngineConfig, EngineError, Event, Role, SessionEngine};
use crate::store::MemoryStore;
use crate::topic::validate_topic_name;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Decode(DecodeError),
    Encode(EncodeError),
    Engine(EngineError),
    Backend(BackendError),
    /// No CONNECT within the connect timeout
    Timeout,
    /// CONNACK with a failure code was sent
    Refused(ConnectReturnCode),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Encode(e) => write!(f, "Encode error: {}", e),
            ConnectionError::Engine(e) => write!(f, "Session error: {}", e),
            ConnectionError::Backend(e) => write!(f, "Backend error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Refused(code) => write!(f, "Connection refused: {}", code),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Encode(e)
    }
}

impl From<EngineError> for ConnectionError {
    fn from(e: EngineError) -> Self {
        ConnectionError::Engine(e)
    }
}

impl From<BackendError> for ConnectionError {
    fn from(e: BackendError) -> Self {
        ConnectionError::Backend(e)
    }
}

/// Why an established connection stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    /// Client sent DISCONNECT
    Disconnected,
    /// Closed through the session: another connection attached, or
    /// fan-out gave up on a stalled outbound queue
    TakenOver,
    /// Broker shutdown
    Shutdown,
}

/// Connection handler, generic over the stream type
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) id: u64,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) config: Arc<BrokerConfig>,
    pub(crate) engine: Arc<Mutex<SessionEngine>>,
    pub(crate) outbound_tx: mpsc::Sender<Packet>,
    pub(crate) outbound_rx: mpsc::Receiver<Packet>,
    pub(crate) closer: Arc<Notify>,
    pub(crate) shutdown: broadcast::Receiver<()>,
    /// Will from CONNECT, published if the connection ends abnormally
    pub(crate) will: Option<Will>,
}

impl<S> Connection<S>
where
    S: crate::transport::MqttStream,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        id: u64,
        backend: Arc<dyn Backend>,
        config: Arc<BrokerConfig>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        // Placeholder stores until the session is known
        let engine = SessionEngine::new(
            Role::Broker,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            EngineConfig {
                keep_alive_tolerance: config.keep_alive_tolerance,
                ..Default::default()
            },
        );
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));

        Self {
            stream,
            addr,
            id,
            decoder: Decoder::new().with_max_packet_size(config.max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            backend,
            config,
            engine: Arc::new(Mutex::new(engine)),
            outbound_tx,
            outbound_rx,
            closer: Arc::new(Notify::new()),
            shutdown,
            will: None,
        }
    }

    /// Run the connection to completion
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let connect = match tokio::time::timeout(self.config.connect_timeout, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                // Closed without a reply
                debug!("Connect timeout from {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        };

        let session = self.handle_connect(connect).await?;
        let result = self.run_connected(&session).await;
        self.finish(&session, &result).await;
        result.map(|_| ())
    }

    /// Main loop of an established connection
    async fn run_connected(&mut self, session: &Arc<Session>) -> Result<Exit, ConnectionError> {
        loop {
            let deadline = self.engine.lock().next_deadline();

            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        debug!("Connection closed from {}", self.addr);
                        return Err(ConnectionError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                    }

                    while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                        self.read_buf.advance(consumed);
                        if let Some(exit) = self.handle_packet(session, packet).await? {
                            return Ok(exit);
                        }
                    }
                }

                Some(packet) = self.outbound_rx.recv() => {
                    self.write_packets(&[packet]).await?;
                }

                _ = self.closer.notified() => {
                    debug!("Connection {} closed by the session", self.addr);
                    return Ok(Exit::TakenOver);
                }

                _ = sleep_until(deadline) => {
                    let packets = self.engine.lock().tick(Instant::now())?;
                    self.write_packets(&packets).await?;
                }

                _ = self.shutdown.recv() => {
                    debug!("Connection {} shutting down", self.addr);
                    return Ok(Exit::Shutdown);
                }
            }
        }
    }

    /// Feed one packet to the engine and act on the outcome
    async fn handle_packet(
        &mut self,
        session: &Arc<Session>,
        packet: Packet,
    ) -> Result<Option<Exit>, ConnectionError> {
        let outcome = self.engine.lock().on_receive(packet, Instant::now())?;
        self.write_packets(&outcome.replies).await?;

        for event in outcome.events {
            match event {
                Event::Message(publish) => self.handle_publish(publish).await?,
                Event::Subscribe(subscribe) => self.handle_subscribe(session, subscribe).await?,
                Event::Unsubscribe(unsubscribe) => {
                    self.handle_unsubscribe(session, unsubscribe).await?
                }
                Event::Acknowledged(packet_id) => {
                    trace!(packet_id, "delivery to {} complete", self.addr);
                }
                Event::Disconnect => {
                    debug!("DISCONNECT from {}", self.addr);
                    return Ok(Some(Exit::Disconnected));
                }
                // Handshake and client-side events never occur here
                Event::Connect(_) | Event::ConnAck(_) | Event::SubAck(_) | Event::UnsubAck(_) => {}
            }
        }
        Ok(None)
    }

    /// Route an application message received from the client
    async fn handle_publish(&mut self, publish: Publish) -> Result<(), ConnectionError> {
        if let Err(reason) = validate_topic_name(&publish.topic) {
            return Err(EngineError::ProtocolViolation(reason).into());
        }

        if let Err(e) = self.backend.publish(publish).await {
            warn!("Failed to route message from {}: {}", self.addr, e);
        }
        Ok(())
    }

    /// Encode and write `packets` in one batch
    pub(crate) async fn write_packets(&mut self, packets: &[Packet]) -> Result<(), ConnectionError> {
        if packets.is_empty() {
            return Ok(());
        }

        self.write_buf.clear();
        for packet in packets {
            trace!(packet = packet.name(), "sending to {}", self.addr);
            self.encoder.encode(packet, &mut self.write_buf)?;
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Generate a random ID
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish()
}
