//! Broker Backend
//!
//! The backend owns everything that outlives a single connection: the
//! session table, subscriptions, retained messages and credentials. The
//! broker talks to it through the [`Backend`] trait so deployments can swap
//! in their own session or authentication storage; [`MemoryBackend`] keeps
//! everything in process memory for the lifetime of the broker.

mod error;
mod memory;

#[cfg(test)]
mod tests;

pub use error::{BackendError, BackendResult};
pub use memory::{BackendLimits, Logins, MemoryBackend};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::protocol::{Packet, Publish, QoS};
use crate::session::{EngineError, SessionEngine};
use crate::store::MessageStore;
use crate::topic::RetainedMessage;

/// Session and routing storage used by the broker
///
/// All methods are called from connection tasks; implementations must not
/// block the runtime.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Check the credentials presented in CONNECT
    ///
    /// # Returns
    /// * `Ok(true)` - connection allowed
    /// * `Ok(false)` - refused with CONNACK not-authorized
    /// * `Err(_)` - refused with CONNACK server-unavailable
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> BackendResult<bool>;

    /// Retrieve the stored session for `client_id` or create a fresh one
    ///
    /// Returns the session and whether it was resumed (the CONNACK
    /// session-present flag). A clean request always yields a fresh session.
    async fn setup(&self, client_id: &str, clean: bool) -> BackendResult<(Arc<Session>, bool)>;

    /// Add or replace a subscription, returning the granted QoS
    async fn subscribe(&self, session: &Arc<Session>, filter: &str, qos: QoS)
        -> BackendResult<QoS>;

    async fn unsubscribe(&self, session: &Arc<Session>, filter: &str) -> BackendResult<()>;

    /// Retained messages matching a freshly granted subscription
    async fn retained_for(&self, filter: &str) -> BackendResult<Vec<RetainedMessage>>;

    /// Retain (if flagged) and route an application message to every
    /// matching session
    async fn publish(&self, publish: Publish) -> BackendResult<()>;

    /// Detach connection `connection_id` from `session`, discarding the
    /// session if it is clean
    async fn terminate(&self, session: &Arc<Session>, connection_id: u64) -> BackendResult<()>;
}

/// The live connection a session is attached to
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub engine: Arc<Mutex<SessionEngine>>,
    /// Packets for the connection task to write
    pub outbound: mpsc::Sender<Packet>,
    /// Tells the connection task to stop; kept apart from `outbound` so a
    /// full queue cannot swallow it
    pub closer: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn close(&self) {
        self.closer.notify_one();
    }
}

/// Broker-side session state for one client identity
///
/// Lock order: `Session` state before the attached engine. Connection tasks
/// drop their engine guard before calling into the backend.
pub struct Session {
    client_id: Arc<str>,
    clean: bool,
    incoming: Arc<dyn MessageStore>,
    outgoing: Arc<dyn MessageStore>,
    limits: BackendLimits,
    inner: Mutex<SessionInner>,
}

#[derive(Default)]
struct SessionInner {
    keep_alive: u16,
    subscriptions: AHashMap<String, QoS>,
    /// QoS 1/2 messages that arrived while no connection was attached
    queue: VecDeque<Publish>,
    connection: Option<ConnectionHandle>,
}

impl Session {
    pub fn new(
        client_id: Arc<str>,
        clean: bool,
        incoming: Arc<dyn MessageStore>,
        outgoing: Arc<dyn MessageStore>,
        limits: BackendLimits,
    ) -> Self {
        Self {
            client_id,
            clean,
            incoming,
            outgoing,
            limits,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn is_clean(&self) -> bool {
        self.clean
    }

    pub fn incoming(&self) -> Arc<dyn MessageStore> {
        self.incoming.clone()
    }

    pub fn outgoing(&self) -> Arc<dyn MessageStore> {
        self.outgoing.clone()
    }

    pub fn keep_alive(&self) -> u16 {
        self.inner.lock().keep_alive
    }

    pub fn set_keep_alive(&self, keep_alive: u16) {
        self.inner.lock().keep_alive = keep_alive;
    }

    /// Subscriptions held by this session, sorted by filter
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        let inner = self.inner.lock();
        let mut subs: Vec<_> = inner
            .subscriptions
            .iter()
            .map(|(f, q)| (f.clone(), *q))
            .collect();
        subs.sort_unstable();
        subs
    }

    pub(crate) fn add_subscription(&self, filter: &str, qos: QoS) {
        self.inner.lock().subscriptions.insert(filter.to_string(), qos);
    }

    pub(crate) fn remove_subscription(&self, filter: &str) -> bool {
        self.inner.lock().subscriptions.remove(filter).is_some()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().connection.is_some()
    }

    /// Attach a connection, closing any connection attached before it
    ///
    /// Returns the messages queued while the session was detached, oldest
    /// first.
    pub fn attach(&self, handle: ConnectionHandle) -> Vec<Publish> {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.connection.replace(handle) {
            debug!(client_id = %self.client_id, connection = previous.id, "session taken over");
            previous.close();
        }
        inner.queue.drain(..).collect()
    }

    /// Detach `connection_id` unless another connection has since attached
    ///
    /// Returns `false` only in that takeover case.
    pub fn detach(&self, connection_id: u64) -> bool {
        let mut inner = self.inner.lock();
        match &inner.connection {
            Some(conn) if conn.id != connection_id => false,
            _ => {
                inner.connection = None;
                true
            }
        }
    }

    /// Ask the attached connection, if any, to close
    pub(crate) fn kick(&self) {
        if let Some(conn) = self.inner.lock().connection.take() {
            conn.close();
        }
    }

    /// Hand a routed message to the attached connection, or queue it for
    /// the next one
    ///
    /// Waits while the connection's outbound queue is full. A connection
    /// that drains nothing for `delivery_timeout` is closed; its QoS 1/2
    /// copy stays in the outgoing store for a persistent session to resume.
    pub async fn deliver(&self, publish: Publish) -> BackendResult<()> {
        let Some((conn, packet)) = self.assign(publish)? else {
            return Ok(());
        };

        match conn
            .outbound
            .send_timeout(packet, self.limits.delivery_timeout)
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    client_id = %self.client_id,
                    connection = conn.id,
                    "outbound queue stalled, closing connection"
                );
                conn.close();
            }
            Err(SendTimeoutError::Closed(_)) => {
                trace!(client_id = %self.client_id, "connection gone during delivery");
            }
        }
        Ok(())
    }

    /// Run `publish` through the attached engine, or queue it while detached
    fn assign(&self, publish: Publish) -> BackendResult<Option<(ConnectionHandle, Packet)>> {
        let mut inner = self.inner.lock();

        if let Some(conn) = &inner.connection {
            let sent = conn.engine.lock().send(publish.clone(), Instant::now());
            match sent {
                Ok(packet) => return Ok(Some((conn.clone(), packet))),
                Err(EngineError::Closed) | Err(EngineError::NotEstablished) => {}
                Err(EngineError::PacketIdsExhausted) => {
                    warn!(client_id = %self.client_id, "no free packet identifiers, message dropped");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if self.clean || publish.qos == QoS::AtMostOnce {
            return Ok(None);
        }

        if inner.queue.len() >= self.limits.max_queued_messages {
            inner.queue.pop_front();
            debug!(client_id = %self.client_id, "offline queue full, oldest message dropped");
        }
        inner.queue.push_back(publish);
        Ok(None)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("clean", &self.clean)
            .finish_non_exhaustive()
    }
}
