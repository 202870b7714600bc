//! WebSocket Transport
//!
//! Wraps a tokio-tungstenite WebSocket so that MQTT can run over binary
//! frames as if it were a plain byte stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use super::TransportError;

/// Sub-protocols accepted during the upgrade, in preference order
const MQTT_SUBPROTOCOLS: &[&str] = &["mqtt", "mqttv3.1"];

/// WebSocket stream wrapper implementing `AsyncRead` and `AsyncWrite`
///
/// Each write goes out as one binary frame. Incoming binary frames are
/// buffered and read back as a continuous byte stream; control and text
/// frames are skipped.
pub struct WsStream<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    stream: SplitStream<WebSocketStream<S>>,
    read_buffer: BytesMut,
    closed: bool,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink,
            stream,
            read_buffer: BytesMut::with_capacity(2048),
            closed: false,
        }
    }

    /// Server side: complete the HTTP upgrade, checking the request path and
    /// echoing the MQTT sub-protocol
    pub async fn accept_with_path(stream: S, expected_path: &str) -> Result<Self, io::Error> {
        let expected_path = expected_path.to_string();

        let callback = move |req: &Request, mut response: Response| {
            let request_path = req.uri().path();
            if request_path != expected_path {
                let mut error = ErrorResponse::new(Some(format!(
                    "Invalid path: expected '{}', got '{}'",
                    expected_path, request_path
                )));
                *error.status_mut() = StatusCode::NOT_FOUND;
                return Err(error);
            }

            let requested = req
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok())
                .and_then(|list| {
                    list.split(',')
                        .map(str::trim)
                        .find(|p| MQTT_SUBPROTOCOLS.contains(p))
                });
            if let Some(protocol) = requested.and_then(|p| HeaderValue::from_str(p).ok()) {
                response
                    .headers_mut()
                    .insert("sec-websocket-protocol", protocol);
            }
            Ok(response)
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(io::Error::other)?;

        Ok(Self::new(ws))
    }

    /// Client side: upgrade an established connection to `url`, requesting
    /// the `mqtt` sub-protocol
    pub async fn connect(stream: S, url: &str) -> Result<Self, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
        request
            .headers_mut()
            .insert("sec-websocket-protocol", HeaderValue::from_static("mqtt"));

        let (ws, _response) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        Ok(Self::new(ws))
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buffer.is_empty() {
                let to_copy = std::cmp::min(buf.remaining(), self.read_buffer.len());
                buf.put_slice(&self.read_buffer[..to_copy]);
                self.read_buffer.advance(to_copy);
                return Poll::Ready(Ok(()));
            }

            if self.closed {
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.read_buffer.extend_from_slice(&data);
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    self.closed = true;
                }
                // Ping / pong are answered by tungstenite itself
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io::Error::other(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => return Poll::Pending,
        }

        match Pin::new(&mut self.sink).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(io::Error::other(e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.sink)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.sink)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}
