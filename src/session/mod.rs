//! MQTT session engine
//!
//! One [`SessionEngine`] drives the protocol state of one connection, on the
//! broker (one per accepted socket) and on the client (one per dialled
//! connection). It never touches the network: callers feed it decoded
//! packets and the current time, and it returns the packets to write and the
//! events to act on. Owners serialize access to it behind a single lock.
//!
//! State machine: `AwaitingConnect -> Established -> Closed`.
//!
//! QoS flows tracked through the message stores:
//! - outgoing QoS 1: `AwaitingAck` until PUBACK
//! - outgoing QoS 2: `AwaitingRec` until PUBREC, then `AwaitingComp` until PUBCOMP
//! - incoming QoS 2: `AwaitingRel` until PUBREL; duplicates of the PUBLISH
//!   inside that window are acknowledged but not surfaced again

mod error;


pub use error::EngineError;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use tracing::{debug, trace, warn};

use crate::protocol::{
    ConnAck, Connect, Packet, Publish, QoS, SubAck, Subscribe, Subscription, Unsubscribe,
};
use crate::store::{MessageStore, PendingDelivery, Stage};

/// A connection is dead after this many keep-alive intervals of silence
pub const DEFAULT_KEEP_ALIVE_TOLERANCE: f64 = 1.5;

/// Client-side redelivery interval for unacknowledged publishes
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Which end of the connection the engine runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Broker,
    Client,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Broker: waiting for CONNECT. Client: CONNECT sent, waiting for CONNACK.
    AwaitingConnect,
    Established,
    Closed,
}

/// Engine tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Multiplier applied to the keep-alive interval before the broker
    /// gives up on a silent client
    pub keep_alive_tolerance: f64,
    /// Client-side age after which an unacknowledged publish is resent
    pub retry_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keep_alive_tolerance: DEFAULT_KEEP_ALIVE_TOLERANCE,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Session attached by the broker once CONNECT has been accepted
pub struct SessionParams {
    pub keep_alive: u16,
    pub clean_session: bool,
    pub incoming: Arc<dyn MessageStore>,
    pub outgoing: Arc<dyn MessageStore>,
}

/// Something the owner has to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Broker: CONNECT received, authenticate and call `establish`
    Connect(Box<Connect>),
    /// Client: handshake finished
    ConnAck(ConnAck),
    /// Application message to surface (broker: route it)
    Message(Publish),
    /// Outgoing QoS 1/2 publish fully acknowledged
    Acknowledged(u16),
    /// Broker: subscription request to answer with SUBACK
    Subscribe(Subscribe),
    /// Client: answer to an outstanding SUBSCRIBE
    SubAck(SubAck),
    /// Broker: unsubscribe request to answer with UNSUBACK
    Unsubscribe(Unsubscribe),
    /// Client: answer to an outstanding UNSUBSCRIBE
    UnsubAck(u16),
    /// Broker: client said goodbye
    Disconnect,
}

/// Result of feeding one packet to the engine
#[derive(Debug, Default)]
pub struct Outcome {
    /// Packets to write back, in order
    pub replies: Vec<Packet>,
    pub events: Vec<Event>,
}

/// Per-connection protocol state machine
pub struct SessionEngine {
    role: Role,
    state: EngineState,
    config: EngineConfig,
    incoming: Arc<dyn MessageStore>,
    outgoing: Arc<dyn MessageStore>,
    next_packet_id: u16,
    /// SUBSCRIBE / UNSUBSCRIBE identifiers waiting for their ack
    requests: AHashSet<u16>,
    keep_alive: Duration,
    clean_session: bool,
    last_received: Instant,
    last_sent: Instant,
    ping_sent_at: Option<Instant>,
}

impl SessionEngine {
    pub fn new(
        role: Role,
        incoming: Arc<dyn MessageStore>,
        outgoing: Arc<dyn MessageStore>,
        config: EngineConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            role,
            state: EngineState::AwaitingConnect,
            config,
            incoming,
            outgoing,
            next_packet_id: 1,
            requests: AHashSet::new(),
            keep_alive: Duration::ZERO,
            clean_session: false,
            last_received: now,
            last_sent: now,
            ping_sent_at: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == EngineState::Closed
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn incoming(&self) -> &Arc<dyn MessageStore> {
        &self.incoming
    }

    pub fn outgoing(&self) -> &Arc<dyn MessageStore> {
        &self.outgoing
    }

    /// Broker side: attach the accepted session and start enforcing its
    /// keep-alive
    pub fn establish(&mut self, params: SessionParams, now: Instant) -> Result<(), EngineError> {
        if self.state != EngineState::AwaitingConnect {
            return Err(EngineError::ProtocolViolation("session already established"));
        }

        self.keep_alive = Duration::from_secs(params.keep_alive as u64);
        self.clean_session = params.clean_session;
        self.incoming = params.incoming;
        self.outgoing = params.outgoing;
        self.last_received = now;
        self.last_sent = now;
        self.state = EngineState::Established;
        Ok(())
    }

    /// Client side: build the CONNECT packet and remember what it asked for
    pub fn connect(&mut self, connect: Connect, now: Instant) -> Result<Packet, EngineError> {
        match (self.role, self.state) {
            (Role::Client, EngineState::AwaitingConnect) => {}
            (_, EngineState::Closed) => return Err(EngineError::Closed),
            _ => return Err(EngineError::ProtocolViolation("CONNECT not allowed here")),
        }

        self.keep_alive = Duration::from_secs(connect.keep_alive as u64);
        self.clean_session = connect.clean_session;
        self.last_received = now;
        self.last_sent = now;
        Ok(Packet::Connect(Box::new(connect)))
    }

    /// Consume one inbound packet
    pub fn on_receive(&mut self, packet: Packet, now: Instant) -> Result<Outcome, EngineError> {
        if self.state == EngineState::Closed {
            return Err(EngineError::Closed);
        }

        trace!(packet = packet.name(), "received");
        self.last_received = now;

        let mut outcome = Outcome::default();
        match (self.role, self.state) {
            (_, EngineState::AwaitingConnect) => self.receive_handshake(packet, &mut outcome)?,
            (Role::Broker, _) => self.receive_from_client(packet, now, &mut outcome)?,
            (Role::Client, _) => self.receive_from_broker(packet, now, &mut outcome)?,
        }

        if !outcome.replies.is_empty() {
            self.last_sent = now;
        }
        Ok(outcome)
    }

    fn receive_handshake(&mut self, packet: Packet, outcome: &mut Outcome) -> Result<(), EngineError> {
        match (self.role, packet) {
            (Role::Broker, Packet::Connect(connect)) => {
                outcome.events.push(Event::Connect(connect));
            }
            (Role::Client, Packet::ConnAck(connack)) => {
                if connack.return_code.is_accepted() {
                    self.state = EngineState::Established;
                } else {
                    debug!(code = %connack.return_code, "connection refused");
                    self.close();
                }
                outcome.events.push(Event::ConnAck(connack));
            }
            (Role::Broker, _) => {
                return Err(EngineError::ProtocolViolation("first packet must be CONNECT"))
            }
            (Role::Client, _) => return Err(EngineError::ProtocolViolation("expected CONNACK")),
        }
        Ok(())
    }

    fn receive_from_client(
        &mut self,
        packet: Packet,
        now: Instant,
        outcome: &mut Outcome,
    ) -> Result<(), EngineError> {
        match packet {
            Packet::Publish(publish) => self.receive_publish(publish, now, outcome)?,
            Packet::PubAck(id) => self.receive_puback(id, outcome)?,
            Packet::PubRec(id) => self.receive_pubrec(id, now, outcome)?,
            Packet::PubRel(id) => self.receive_pubrel(id, outcome)?,
            Packet::PubComp(id) => self.receive_pubcomp(id, outcome)?,
            Packet::Subscribe(subscribe) => outcome.events.push(Event::Subscribe(subscribe)),
            Packet::Unsubscribe(unsubscribe) => {
                outcome.events.push(Event::Unsubscribe(unsubscribe))
            }
            Packet::PingReq => outcome.replies.push(Packet::PingResp),
            Packet::Disconnect => outcome.events.push(Event::Disconnect),
            Packet::Connect(_) => return Err(EngineError::ProtocolViolation("duplicate CONNECT")),
            _ => return Err(EngineError::ProtocolViolation("packet not valid from a client")),
        }
        Ok(())
    }

    fn receive_from_broker(
        &mut self,
        packet: Packet,
        now: Instant,
        outcome: &mut Outcome,
    ) -> Result<(), EngineError> {
        match packet {
            Packet::Publish(publish) => self.receive_publish(publish, now, outcome)?,
            Packet::PubAck(id) => self.receive_puback(id, outcome)?,
            Packet::PubRec(id) => self.receive_pubrec(id, now, outcome)?,
            Packet::PubRel(id) => self.receive_pubrel(id, outcome)?,
            Packet::PubComp(id) => self.receive_pubcomp(id, outcome)?,
            Packet::SubAck(suback) => {
                if self.requests.remove(&suback.packet_id) {
                    outcome.events.push(Event::SubAck(suback));
                } else {
                    warn!(packet_id = suback.packet_id, "unexpected SUBACK ignored");
                }
            }
            Packet::UnsubAck(id) => {
                if self.requests.remove(&id) {
                    outcome.events.push(Event::UnsubAck(id));
                } else {
                    warn!(packet_id = id, "unexpected UNSUBACK ignored");
                }
            }
            Packet::PingResp => self.ping_sent_at = None,
            Packet::ConnAck(_) => return Err(EngineError::ProtocolViolation("duplicate CONNACK")),
            _ => return Err(EngineError::ProtocolViolation("packet not valid from a broker")),
        }
        Ok(())
    }

    fn receive_publish(
        &mut self,
        publish: Publish,
        now: Instant,
        outcome: &mut Outcome,
    ) -> Result<(), EngineError> {
        let packet_id = match publish.qos {
            QoS::AtMostOnce => {
                outcome.events.push(Event::Message(publish));
                return Ok(());
            }
            _ => publish
                .packet_id
                .ok_or(EngineError::ProtocolViolation("publish without packet id"))?,
        };

        if publish.qos == QoS::AtLeastOnce {
            outcome.events.push(Event::Message(publish));
            outcome.replies.push(Packet::PubAck(packet_id));
            return Ok(());
        }

        if self.incoming.contains(packet_id)? {
            debug!(packet_id, "duplicate QoS 2 publish suppressed");
        } else {
            self.incoming.put(PendingDelivery::incoming(packet_id, now))?;
            outcome.events.push(Event::Message(publish));
        }
        outcome.replies.push(Packet::PubRec(packet_id));
        Ok(())
    }

    fn receive_puback(&mut self, packet_id: u16, outcome: &mut Outcome) -> Result<(), EngineError> {
        match self.outgoing.get(packet_id)? {
            Some(delivery) if delivery.stage == Stage::AwaitingAck => {
                self.outgoing.delete(packet_id)?;
                outcome.events.push(Event::Acknowledged(packet_id));
            }
            _ => warn!(packet_id, "PUBACK for unknown packet id ignored"),
        }
        Ok(())
    }

    fn receive_pubrec(
        &mut self,
        packet_id: u16,
        now: Instant,
        outcome: &mut Outcome,
    ) -> Result<(), EngineError> {
        match self.outgoing.get(packet_id)? {
            // A repeated PUBREC means our PUBREL got lost
            Some(mut delivery)
                if matches!(delivery.stage, Stage::AwaitingRec | Stage::AwaitingComp) =>
            {
                delivery.stage = Stage::AwaitingComp;
                delivery.sent_at = now;
                self.outgoing.put(delivery)?;
                outcome.replies.push(Packet::PubRel(packet_id));
            }
            _ => warn!(packet_id, "PUBREC for unknown packet id ignored"),
        }
        Ok(())
    }

    fn receive_pubrel(&mut self, packet_id: u16, outcome: &mut Outcome) -> Result<(), EngineError> {
        if self.incoming.delete(packet_id)?.is_none() {
            // The peer may be replaying a PUBREL whose PUBCOMP was lost
            debug!(packet_id, "PUBREL for unknown packet id");
        }
        outcome.replies.push(Packet::PubComp(packet_id));
        Ok(())
    }

    fn receive_pubcomp(&mut self, packet_id: u16, outcome: &mut Outcome) -> Result<(), EngineError> {
        match self.outgoing.get(packet_id)? {
            Some(delivery) if delivery.stage == Stage::AwaitingComp => {
                self.outgoing.delete(packet_id)?;
                outcome.events.push(Event::Acknowledged(packet_id));
            }
            _ => warn!(packet_id, "PUBCOMP for unknown packet id ignored"),
        }
        Ok(())
    }

    /// Prepare an application message for transmission
    ///
    /// QoS 1/2 messages get a fresh packet identifier and are recorded in
    /// the outgoing store before the packet is handed back.
    pub fn send(&mut self, mut publish: Publish, now: Instant) -> Result<Packet, EngineError> {
        self.ensure_established()?;

        publish.dup = false;
        let Some(stage) = Stage::initial(publish.qos) else {
            publish.packet_id = None;
            self.last_sent = now;
            return Ok(Packet::Publish(publish));
        };

        let packet_id = self.allocate_packet_id()?;
        publish.packet_id = Some(packet_id);
        self.outgoing
            .put(PendingDelivery::outgoing(publish.clone(), packet_id, stage, now))?;
        self.last_sent = now;
        Ok(Packet::Publish(publish))
    }

    /// Client side: build a SUBSCRIBE and track its identifier
    pub fn subscribe(
        &mut self,
        subscriptions: Vec<Subscription>,
        now: Instant,
    ) -> Result<Packet, EngineError> {
        self.ensure_established()?;
        let packet_id = self.allocate_packet_id()?;
        self.requests.insert(packet_id);
        self.last_sent = now;
        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    /// Client side: build an UNSUBSCRIBE and track its identifier
    pub fn unsubscribe(&mut self, filters: Vec<String>, now: Instant) -> Result<Packet, EngineError> {
        self.ensure_established()?;
        let packet_id = self.allocate_packet_id()?;
        self.requests.insert(packet_id);
        self.last_sent = now;
        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }

    /// Every unacknowledged outgoing delivery, oldest first, ready to be
    /// written again after a session resumes
    pub fn resend_pending(&mut self, now: Instant) -> Result<Vec<Packet>, EngineError> {
        self.ensure_established()?;

        let mut packets = Vec::new();
        for delivery in self.outgoing.all()? {
            if let Some(packet) = self.retransmit(delivery, now)? {
                packets.push(packet);
            }
        }

        if !packets.is_empty() {
            debug!(count = packets.len(), "resending pending deliveries");
            self.last_sent = now;
        }
        Ok(packets)
    }

    fn retransmit(
        &self,
        mut delivery: PendingDelivery,
        now: Instant,
    ) -> Result<Option<Packet>, EngineError> {
        let packet = match delivery.stage {
            Stage::AwaitingAck | Stage::AwaitingRec => {
                let Some(publish) = delivery.publish.as_mut() else {
                    warn!(packet_id = delivery.packet_id, "pending delivery without payload dropped");
                    self.outgoing.delete(delivery.packet_id)?;
                    return Ok(None);
                };
                publish.dup = true;
                Packet::Publish(publish.clone())
            }
            Stage::AwaitingComp => Packet::PubRel(delivery.packet_id),
            Stage::AwaitingRel => return Ok(None),
        };

        delivery.sent_at = now;
        delivery.retry_count += 1;
        self.outgoing.put(delivery)?;
        Ok(Some(packet))
    }

    /// Timer hook
    ///
    /// Broker: fails with `KeepAliveTimeout` once nothing has been received
    /// for `keep_alive * tolerance`. Client: emits PINGREQ after a full
    /// interval without sending, fails with `PingTimeout` if the previous
    /// PINGREQ is still unanswered one interval later, and resends
    /// deliveries older than the retry interval.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<Packet>, EngineError> {
        if self.state != EngineState::Established {
            return Ok(Vec::new());
        }

        let mut packets = Vec::new();

        if !self.keep_alive.is_zero() {
            match self.role {
                Role::Broker => {
                    let silent = now.saturating_duration_since(self.last_received);
                    if silent >= self.keep_alive_timeout() {
                        debug!(?silent, "keep alive expired");
                        return Err(EngineError::KeepAliveTimeout);
                    }
                }
                Role::Client => match self.ping_sent_at {
                    Some(sent) if now.saturating_duration_since(sent) >= self.keep_alive => {
                        return Err(EngineError::PingTimeout);
                    }
                    Some(_) => {}
                    None => {
                        if now.saturating_duration_since(self.last_sent) >= self.keep_alive {
                            self.ping_sent_at = Some(now);
                            packets.push(Packet::PingReq);
                        }
                    }
                },
            }
        }

        if self.role == Role::Client {
            for delivery in self.outgoing.all()? {
                if now.saturating_duration_since(delivery.sent_at) >= self.config.retry_interval {
                    if let Some(packet) = self.retransmit(delivery, now)? {
                        packets.push(packet);
                    }
                }
            }
        }

        if !packets.is_empty() {
            self.last_sent = now;
        }
        Ok(packets)
    }

    /// Next instant at which [`tick`](Self::tick) can have an effect
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != EngineState::Established {
            return None;
        }

        let mut deadline = None;

        if !self.keep_alive.is_zero() {
            deadline = Some(match (self.role, self.ping_sent_at) {
                (Role::Broker, _) => self.last_received + self.keep_alive_timeout(),
                (Role::Client, Some(sent)) => sent + self.keep_alive,
                (Role::Client, None) => self.last_sent + self.keep_alive,
            });
        }

        if self.role == Role::Client {
            let oldest = match self.outgoing.oldest_sent_at() {
                Ok(oldest) => oldest,
                Err(e) => {
                    warn!(error = %e, "cannot read outgoing store, retransmission not scheduled");
                    None
                }
            };
            if let Some(sent_at) = oldest {
                let retry = sent_at + self.config.retry_interval;
                deadline = Some(deadline.map_or(retry, |d: Instant| d.min(retry)));
            }
        }

        deadline
    }

    /// Terminate the state machine
    ///
    /// Returns `false` if it was already closed. Clean sessions drop their
    /// in-flight state; other sessions keep it for the next connection.
    pub fn close(&mut self) -> bool {
        if self.state == EngineState::Closed {
            return false;
        }

        self.state = EngineState::Closed;
        self.requests.clear();
        self.ping_sent_at = None;

        if self.clean_session {
            if let Err(e) = self.incoming.reset().and_then(|_| self.outgoing.reset()) {
                warn!(error = %e, "failed to discard session state");
            }
        }
        true
    }

    fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive.mul_f64(self.config.keep_alive_tolerance)
    }

    fn ensure_established(&self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Established => Ok(()),
            EngineState::AwaitingConnect => Err(EngineError::NotEstablished),
            EngineState::Closed => Err(EngineError::Closed),
        }
    }

    fn allocate_packet_id(&mut self) -> Result<u16, EngineError> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);

            if !self.requests.contains(&id) && !self.outgoing.contains(id)? {
                return Ok(id);
            }
        }
        Err(EngineError::PacketIdsExhausted)
    }
}
