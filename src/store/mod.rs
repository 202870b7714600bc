//! Message stores for in-flight QoS 1 and QoS 2 deliveries
//!
//! Every connection keeps two stores: one for packets it has sent and not yet
//! seen acknowledged (outgoing) and one for QoS 2 packet identifiers it has
//! received and not yet released (incoming). The broker hangs both off the
//! session so they outlive a connection; the client owns its pair directly so
//! unacknowledged publishes can be replayed after a reconnect.

mod error;
mod memory;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;

use crate::protocol::{Publish, QoS};

/// Which side of the connection created a delivery record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Handshake stage of a delivery record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Outgoing QoS 1: PUBLISH sent, waiting for PUBACK
    AwaitingAck,
    /// Outgoing QoS 2: PUBLISH sent, waiting for PUBREC
    AwaitingRec,
    /// Outgoing QoS 2: PUBREL sent, waiting for PUBCOMP
    AwaitingComp,
    /// Incoming QoS 2: PUBREC sent, waiting for PUBREL
    AwaitingRel,
}

impl Stage {
    /// First stage of an outgoing publish at the given QoS
    pub fn initial(qos: QoS) -> Option<Self> {
        match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(Stage::AwaitingAck),
            QoS::ExactlyOnce => Some(Stage::AwaitingRec),
        }
    }
}

/// An in-flight QoS 1/2 delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub packet_id: u16,
    pub direction: Direction,
    pub stage: Stage,
    /// The packet to retransmit. Incoming records only keep the identifier.
    pub publish: Option<Publish>,
    /// Last time the packet (or its PUBREL) went out
    pub sent_at: Instant,
    pub retry_count: u32,
}

impl PendingDelivery {
    /// Record for a publish this side has just sent
    pub fn outgoing(publish: Publish, packet_id: u16, stage: Stage, now: Instant) -> Self {
        Self {
            packet_id,
            direction: Direction::Outgoing,
            stage,
            publish: Some(publish),
            sent_at: now,
            retry_count: 0,
        }
    }

    /// Record for a QoS 2 publish this side has received
    pub fn incoming(packet_id: u16, now: Instant) -> Self {
        Self {
            packet_id,
            direction: Direction::Incoming,
            stage: Stage::AwaitingRel,
            publish: None,
            sent_at: now,
            retry_count: 0,
        }
    }
}

/// Keyed, creation-ordered storage for pending deliveries
///
/// Implementations must be safe to share between the task that owns a
/// connection and the tasks that fan messages out to it.
pub trait MessageStore: Send + Sync {
    /// Insert or replace the record for `delivery.packet_id`. Replacing keeps
    /// the record's original position in creation order.
    fn put(&self, delivery: PendingDelivery) -> StoreResult<()>;

    fn get(&self, packet_id: u16) -> StoreResult<Option<PendingDelivery>>;

    /// Remove and return the record for `packet_id`
    fn delete(&self, packet_id: u16) -> StoreResult<Option<PendingDelivery>>;

    fn contains(&self, packet_id: u16) -> StoreResult<bool> {
        Ok(self.get(packet_id)?.is_some())
    }

    /// All records, oldest first
    fn all(&self) -> StoreResult<Vec<PendingDelivery>>;

    /// Earliest `sent_at` among all records
    fn oldest_sent_at(&self) -> StoreResult<Option<Instant>> {
        Ok(self.all()?.iter().map(|d| d.sent_at).min())
    }

    fn len(&self) -> StoreResult<usize>;

    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop every record
    fn reset(&self) -> StoreResult<()>;
}

/// Message store implementation selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
}

/// Open a fresh store of the given kind
pub fn open(kind: StoreKind) -> Arc<dyn MessageStore> {
    match kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
    }
}
