//! CONNECT packet handling

use std::sync::Arc;
use std::time::Instant;

use bytes::Buf;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::{rand_id, Connection, ConnectionError};
use crate::backend::{ConnectionHandle, Session};
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, DecodeError, Packet};
use crate::session::{EngineError, Event, SessionParams};
use crate::transport::MqttStream;

impl<S> Connection<S>
where
    S: MqttStream,
{
    /// Read until the CONNECT packet arrives
    pub(crate) async fn read_connect(&mut self) -> Result<Connect, ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);

                    let outcome = self.engine.lock().on_receive(packet, Instant::now())?;
                    for event in outcome.events {
                        if let Event::Connect(connect) = event {
                            return Ok(*connect);
                        }
                    }
                    return Err(EngineError::ProtocolViolation("first packet must be CONNECT").into());
                }
                Ok(None) => {
                    // Need more data
                }
                Err(DecodeError::InvalidProtocolVersion(level)) => {
                    debug!("Unsupported protocol level {} from {}", level, self.addr);
                    return Err(self
                        .refuse(ConnectReturnCode::UnacceptableProtocolVersion)
                        .await);
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
        }
    }

    /// Authenticate, attach the session and answer CONNACK
    pub(crate) async fn handle_connect(
        &mut self,
        connect: Connect,
    ) -> Result<Arc<Session>, ConnectionError> {
        // An empty client id is only allowed for clean sessions
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!(
                "Rejecting empty client ID with clean_session=false from {}",
                self.addr
            );
            return Err(self.refuse(ConnectReturnCode::IdentifierRejected).await);
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            format!("relaymq-{:x}", rand_id()).into()
        } else {
            connect.client_id.as_str().into()
        };

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        let allowed = self
            .backend
            .authenticate(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await;
        match allowed {
            Ok(true) => {}
            Ok(false) => {
                info!("Authentication failed for {} from {}", client_id, self.addr);
                return Err(self.refuse(ConnectReturnCode::NotAuthorized).await);
            }
            Err(e) => {
                warn!("Authentication error for {}: {}", client_id, e);
                return Err(self.refuse(ConnectReturnCode::ServerUnavailable).await);
            }
        }

        let (session, session_present) =
            match self.backend.setup(&client_id, connect.clean_session).await {
                Ok(setup) => setup,
                Err(e) => {
                    warn!("Session setup failed for {}: {}", client_id, e);
                    return Err(self.refuse(ConnectReturnCode::ServerUnavailable).await);
                }
            };
        session.set_keep_alive(connect.keep_alive);

        if let Err(e) = self.activate(&session, session_present, connect).await {
            // The session is ours until the handshake completes
            self.engine.lock().close();
            if let Err(release) = self.backend.terminate(&session, self.id).await {
                warn!("Failed to release session {}: {}", client_id, release);
            }
            return Err(e);
        }

        Ok(session)
    }

    /// Attach to the session, answer CONNACK and flush what it owes the
    /// client: unacknowledged deliveries first, then the offline queue
    async fn activate(
        &mut self,
        session: &Arc<Session>,
        session_present: bool,
        connect: Connect,
    ) -> Result<(), ConnectionError> {
        self.engine.lock().establish(
            SessionParams {
                keep_alive: connect.keep_alive,
                clean_session: connect.clean_session,
                incoming: session.incoming(),
                outgoing: session.outgoing(),
            },
            Instant::now(),
        )?;
        self.will = connect.will;

        // Collected before attaching so fan-out traffic is not resent
        let mut packets = self.engine.lock().resend_pending(Instant::now())?;
        let queued = session.attach(ConnectionHandle {
            id: self.id,
            engine: self.engine.clone(),
            outbound: self.outbound_tx.clone(),
            closer: self.closer.clone(),
        });

        self.write_packets(&[Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Accepted,
            session_present,
        ))])
        .await?;
        debug!(
            "Client {} connected (session_present: {}, keep_alive: {}s)",
            session.client_id(),
            session_present,
            connect.keep_alive
        );

        if !queued.is_empty() {
            debug!(
                "Delivering {} queued messages to {}",
                queued.len(),
                session.client_id()
            );
            let mut engine = self.engine.lock();
            let now = Instant::now();
            for publish in queued {
                match engine.send(publish, now) {
                    Ok(packet) => packets.push(packet),
                    Err(e) => warn!("Dropping queued message for {}: {}", session.client_id(), e),
                }
            }
        }
        self.write_packets(&packets).await
    }

    /// Send a failure CONNACK; the caller closes the connection
    pub(crate) async fn refuse(&mut self, code: ConnectReturnCode) -> ConnectionError {
        let connack = Packet::ConnAck(ConnAck::new(code, false));
        match self.write_packets(&[connack]).await {
            Ok(()) => ConnectionError::Refused(code),
            Err(e) => e,
        }
    }
}
