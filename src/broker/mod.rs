//! MQTT Broker Core
//!
//! Accepts connections from the transports and runs one task per
//! connection. Everything shared between connections lives behind the
//! [`Backend`].

mod connection;

pub use connection::{Connection, ConnectionError};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::backend::{Backend, MemoryBackend};
use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::session::DEFAULT_KEEP_ALIVE_TOLERANCE;
use crate::transport::{configure_stream, MqttStream, WsStream};

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// WebSocket bind address (optional)
    pub ws_bind_addr: Option<SocketAddr>,
    /// WebSocket path (default: "/mqtt")
    pub ws_path: String,
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Time a new connection has to deliver CONNECT
    pub connect_timeout: Duration,
    /// Keep-alive multiplier before a silent client is dropped
    pub keep_alive_tolerance: f64,
    /// Capacity of each connection's outbound packet queue
    pub outbound_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            ws_bind_addr: None,
            ws_path: "/mqtt".to_string(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            connect_timeout: Duration::from_secs(10),
            keep_alive_tolerance: DEFAULT_KEEP_ALIVE_TOLERANCE,
            outbound_capacity: 1024,
        }
    }
}

/// The MQTT Broker
///
/// Cloning is cheap; clones share the backend and the shutdown signal.
#[derive(Clone)]
pub struct Broker {
    config: Arc<BrokerConfig>,
    backend: Arc<dyn Backend>,
    shutdown: broadcast::Sender<()>,
    next_connection_id: Arc<AtomicU64>,
}

impl Broker {
    /// Create a broker backed by a [`MemoryBackend`] that allows everyone
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_backend(config, Arc::new(MemoryBackend::new()))
    }

    pub fn with_backend(config: BrokerConfig, backend: Arc<dyn Backend>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            backend,
            shutdown,
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Bind the configured listeners and serve until [`shutdown`](Self::shutdown)
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", listener.local_addr()?);

        if let Some(ws_addr) = self.config.ws_bind_addr {
            let ws_listener = TcpListener::bind(ws_addr).await?;
            info!(
                "MQTT/WebSocket listening on {} (path: {})",
                ws_listener.local_addr()?,
                self.config.ws_path
            );

            let broker = self.clone();
            tokio::spawn(async move {
                if let Err(e) = broker.serve_ws(ws_listener).await {
                    error!("WebSocket listener failed: {}", e);
                }
            });
        }

        self.serve(listener).await
    }

    /// Accept plain TCP connections from `listener`
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        if let Err(e) = configure_stream(&stream) {
                            debug!("Failed to configure socket for {}: {}", addr, e);
                        }
                        self.handle(stream, addr);
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                },
                _ = shutdown.recv() => {
                    debug!("TCP accept loop stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Accept WebSocket connections from `listener`
    ///
    /// The HTTP upgrade must target the configured path and is bounded by
    /// the connect timeout.
    pub async fn serve_ws(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("New WebSocket connection from {}", addr);
                        if let Err(e) = configure_stream(&stream) {
                            debug!("Failed to configure socket for {}: {}", addr, e);
                        }

                        let broker = self.clone();
                        tokio::spawn(async move {
                            let handshake = WsStream::accept_with_path(stream, &broker.config.ws_path);
                            match timeout(broker.config.connect_timeout, handshake).await {
                                Ok(Ok(ws_stream)) => {
                                    debug!("WebSocket handshake complete for {}", addr);
                                    broker.handle(ws_stream, addr);
                                }
                                Ok(Err(e)) => {
                                    debug!("WebSocket handshake failed for {}: {}", addr, e);
                                }
                                Err(_) => {
                                    debug!("WebSocket handshake timeout for {}", addr);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept WebSocket connection: {}", e);
                    }
                },
                _ = shutdown.recv() => {
                    debug!("WebSocket accept loop stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Run the MQTT protocol over an already accepted stream
    pub fn handle<S>(&self, stream: S, addr: SocketAddr)
    where
        S: MqttStream + 'static,
    {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(
            stream,
            addr,
            id,
            self.backend.clone(),
            self.config.clone(),
            self.shutdown.subscribe(),
        );

        tokio::spawn(async move {
            if let Err(e) = connection.run().await {
                debug!("Connection error from {}: {}", addr, e);
            }
        });
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
