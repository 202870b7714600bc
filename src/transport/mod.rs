//! Transport Layer
//!
//! Byte-stream transports shared by the broker and the client. Plain TCP and
//! WebSocket connections present the same [`MqttStream`] contract to the
//! codec.

mod websocket;

pub use websocket::WsStream;

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Default port for `mqtt://` and `tcp://` addresses
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default port for `ws://` addresses
pub const DEFAULT_WS_PORT: u16 = 80;

/// Any full-duplex byte stream an MQTT connection can run over
pub trait MqttStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> MqttStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased transport handed out by [`dial`]
pub type BoxedStream = Box<dyn MqttStream>;

/// Transport errors
#[derive(Debug)]
pub enum TransportError {
    /// Address could not be parsed or uses an unknown scheme
    InvalidUrl(String),
    Io(io::Error),
    /// WebSocket upgrade failed
    WebSocket(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidUrl(url) => write!(f, "Invalid URL: {}", url),
            TransportError::Io(e) => write!(f, "IO error: {}", e),
            TransportError::WebSocket(e) => write!(f, "WebSocket error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Transport selected by an address scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    WebSocket,
}

/// A parsed broker address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Request path for WebSocket endpoints
    pub path: String,
}

impl Endpoint {
    /// Parse `mqtt://host[:port]`, `tcp://host[:port]` or
    /// `ws://host[:port][/path]`
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidUrl(url.to_string());

        let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
        let (scheme, default_port) = match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => (Scheme::Tcp, DEFAULT_MQTT_PORT),
            "ws" => (Scheme::WebSocket, DEFAULT_WS_PORT),
            _ => return Err(invalid()),
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) if !host.ends_with(':') => {
                (host, port.parse::<u16>().map_err(|_| invalid())?)
            }
            _ => (authority, default_port),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Open a transport to `url`
pub async fn dial(url: &str) -> Result<BoxedStream, TransportError> {
    let endpoint = Endpoint::parse(url)?;

    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    configure_stream(&stream)?;
    debug!("Connected to {}", endpoint.authority());

    match endpoint.scheme {
        Scheme::Tcp => Ok(Box::new(stream)),
        Scheme::WebSocket => {
            let ws_url = format!("ws://{}{}", endpoint.authority(), endpoint.path);
            let ws = WsStream::connect(stream, &ws_url).await?;
            Ok(Box::new(ws))
        }
    }
}

/// Apply socket options to an accepted or dialled TCP stream
pub fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}
