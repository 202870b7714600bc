//! Client connection task
//!
//! Owns the socket for one connect attempt. Caller operations arrive as
//! [`Command`]s; broker traffic is fed to the shared [`SessionEngine`] and
//! its events resolve the caller's futures.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{ClientError, Resolver, Shared};
use crate::codec::{Decoder, Encoder};
use crate::protocol::Packet;
use crate::session::{Event, SessionEngine};
use crate::transport::BoxedStream;

/// Request from a [`super::Client`] handle to its connection task
pub(crate) enum Command {
    /// Write a packet, resolving `written` once it is on the wire
    Write {
        packet: Packet,
        written: Option<Resolver<()>>,
    },
    /// Send DISCONNECT and stop
    Disconnect(Resolver<()>),
}

enum Exit {
    Disconnected(Resolver<()>),
    Refused,
    /// Every handle to the command channel is gone
    Dropped,
}

struct Task {
    shared: Arc<Shared>,
    stream: BoxedStream,
    engine: Arc<Mutex<SessionEngine>>,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Set until CONNACK arrives
    connack_deadline: Option<Instant>,
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    stream: BoxedStream,
    engine: Arc<Mutex<SessionEngine>>,
    connect: Packet,
    connack_deadline: Instant,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut task = Task {
        shared,
        stream,
        engine,
        decoder: Decoder::new(),
        encoder: Encoder::new(),
        read_buf: BytesMut::with_capacity(4096),
        write_buf: BytesMut::with_capacity(4096),
        connack_deadline: Some(connack_deadline),
    };

    let result = match task.write_packets(&[connect]).await {
        Ok(()) => task.run(&mut commands).await,
        Err(e) => Err(e),
    };

    task.engine.lock().close();
    let _ = task.stream.shutdown().await;

    match result {
        Ok(Exit::Disconnected(done)) => {
            debug!("Disconnected");
            task.shared.detach(None);
            done.resolve(Ok(()));
        }
        Ok(Exit::Refused) | Ok(Exit::Dropped) => task.shared.detach(None),
        Err(e) => {
            debug!("Connection lost: {}", e);
            task.shared.detach(Some(e));
        }
    }

    // Commands queued after the link went away
    commands.close();
    while let Ok(command) = commands.try_recv() {
        match command {
            Command::Write {
                written: Some(written),
                ..
            } => written.resolve(Err(ClientError::ConnectionLost)),
            Command::Disconnect(done) => done.resolve(Err(ClientError::NotConnected)),
            Command::Write { written: None, .. } => {}
        }
    }
}

impl Task {
    async fn run(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<Exit, ClientError> {
        loop {
            let deadline = match (self.engine.lock().next_deadline(), self.connack_deadline) {
                (Some(engine), Some(connack)) => Some(engine.min(connack)),
                (engine, connack) => engine.or(connack),
            };

            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        return Err(ClientError::ConnectionLost);
                    }

                    while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                        self.read_buf.advance(consumed);
                        let exit = self.handle_packet(packet).await;
                        self.shared.settled.notify_waiters();
                        if let Some(exit) = exit? {
                            return Ok(exit);
                        }
                    }
                }

                command = commands.recv() => match command {
                    Some(Command::Write { packet, written }) => {
                        let result = self.write_packets(&[packet]).await;
                        if let Some(written) = written {
                            written.resolve(result.clone());
                        }
                        result?;
                    }
                    Some(Command::Disconnect(done)) => {
                        // Abandoning a handshake sends nothing
                        if self.connack_deadline.is_none() {
                            self.write_packets(&[Packet::Disconnect]).await?;
                        }
                        return Ok(Exit::Disconnected(done));
                    }
                    None => return Ok(Exit::Dropped),
                },

                _ = sleep_until(deadline) => {
                    let now = Instant::now();
                    if self.connack_deadline.is_some_and(|connack| now >= connack) {
                        debug!("No CONNACK within the connect timeout");
                        return Err(ClientError::Timeout);
                    }

                    let packets = self.engine.lock().tick(now)?;
                    self.write_packets(&packets).await?;
                    self.shared.settled.notify_waiters();
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<Option<Exit>, ClientError> {
        let outcome = self.engine.lock().on_receive(packet, Instant::now())?;
        self.write_packets(&outcome.replies).await?;

        for event in outcome.events {
            match event {
                Event::ConnAck(connack) => {
                    self.connack_deadline = None;
                    if !connack.return_code.is_accepted() {
                        debug!("Connection refused: {}", connack.return_code);
                        self.shared.connected(connack);
                        return Ok(Some(Exit::Refused));
                    }

                    let pending = self.engine.lock().resend_pending(Instant::now())?;
                    self.write_packets(&pending).await?;
                    self.shared.connected(connack);
                }
                Event::Message(publish) => self.shared.emit(Ok(publish.into())),
                Event::Acknowledged(packet_id) => self.shared.acknowledged(packet_id),
                Event::SubAck(suback) => {
                    self.shared.subscribed(suback.packet_id, suback.return_codes)
                }
                Event::UnsubAck(packet_id) => self.shared.unsubscribed(packet_id),
                other => warn!("Unexpected event from broker: {:?}", other),
            }
        }
        Ok(None)
    }

    async fn write_packets(&mut self, packets: &[Packet]) -> Result<(), ClientError> {
        if packets.is_empty() {
            return Ok(());
        }

        self.write_buf.clear();
        for packet in packets {
            trace!(packet = packet.name(), "sending");
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
