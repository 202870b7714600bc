//! In-memory backend

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::{debug, warn};

use super::{Backend, BackendResult, Session};
use crate::protocol::{Publish, QoS};
use crate::store::{self, StoreKind};
use crate::topic::{RetainedMessage, TopicMatcher};

/// Username / password table for [`MemoryBackend`]
#[derive(Debug, Clone, Default)]
pub struct Logins {
    users: AHashMap<String, String>,
    allow_anonymous: bool,
}

impl Logins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }

    /// Also accept connections that carry no username
    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn check(&self, username: Option<&str>, password: Option<&[u8]>) -> bool {
        let Some(username) = username else {
            return self.allow_anonymous;
        };
        match self.users.get(username) {
            Some(expected) => password == Some(expected.as_bytes()),
            None => false,
        }
    }
}

/// Resource limits applied to every session
#[derive(Debug, Clone, Copy)]
pub struct BackendLimits {
    /// Offline queue length for detached persistent sessions
    pub max_queued_messages: usize,
    /// How long fan-out waits on a full outbound queue before giving up on
    /// the connection
    pub delivery_timeout: Duration,
}

impl Default for BackendLimits {
    fn default() -> Self {
        Self {
            max_queued_messages: 1000,
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

/// Reference [`Backend`] keeping sessions, subscriptions and retained
/// messages in process memory
///
/// Sessions are never evicted; a persistent session lives until a clean
/// connection with the same client id replaces it.
#[derive(Default)]
pub struct MemoryBackend {
    sessions: DashMap<Arc<str>, Arc<Session>>,
    matcher: TopicMatcher,
    /// `None` allows every connection
    logins: Option<Logins>,
    store: StoreKind,
    limits: BackendLimits,
}

impl MemoryBackend {
    /// Backend that accepts every connection
    pub fn new() -> Self {
        Self::default()
    }

    /// Require credentials from `logins`
    pub fn with_logins(mut self, logins: Logins) -> Self {
        self.logins = Some(logins);
        self
    }

    pub fn with_store(mut self, store: StoreKind) -> Self {
        self.store = store;
        self
    }

    pub fn with_limits(mut self, limits: BackendLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn session(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn retained_count(&self) -> usize {
        self.matcher.retained_count()
    }

    fn new_session(&self, client_id: Arc<str>, clean: bool) -> Arc<Session> {
        Arc::new(Session::new(
            client_id,
            clean,
            store::open(self.store),
            store::open(self.store),
            self.limits,
        ))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> BackendResult<bool> {
        let allowed = match &self.logins {
            Some(logins) => logins.check(username, password),
            None => true,
        };
        if !allowed {
            debug!(client_id, username, "authentication failed");
        }
        Ok(allowed)
    }

    async fn setup(&self, client_id: &str, clean: bool) -> BackendResult<(Arc<Session>, bool)> {
        let key: Arc<str> = client_id.into();

        match self.sessions.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if !clean && !entry.get().is_clean() {
                    return Ok((entry.get().clone(), true));
                }

                let session = self.new_session(key, clean);
                let previous = entry.insert(session.clone());
                previous.kick();
                self.matcher.unsubscribe_all(client_id);
                debug!(client_id, "previous session discarded");
                Ok((session, false))
            }
            Entry::Vacant(entry) => {
                let session = self.new_session(key, clean);
                entry.insert(session.clone());
                Ok((session, false))
            }
        }
    }

    async fn subscribe(
        &self,
        session: &Arc<Session>,
        filter: &str,
        qos: QoS,
    ) -> BackendResult<QoS> {
        self.matcher.subscribe(filter, qos, session.client_id());
        session.add_subscription(filter, qos);
        Ok(qos)
    }

    async fn unsubscribe(&self, session: &Arc<Session>, filter: &str) -> BackendResult<()> {
        self.matcher.unsubscribe(filter, session.client_id());
        session.remove_subscription(filter);
        Ok(())
    }

    async fn retained_for(&self, filter: &str) -> BackendResult<Vec<RetainedMessage>> {
        Ok(self.matcher.retained_for(filter))
    }

    async fn publish(&self, publish: Publish) -> BackendResult<()> {
        if publish.retain {
            self.matcher
                .retain(&publish.topic, publish.payload.clone(), publish.qos);
        }

        let matches = self.matcher.matches(&publish.topic, publish.qos);
        let deliveries = matches.into_iter().filter_map(|(client_id, qos)| {
            let session = self.session(&client_id)?;
            let outgoing = Publish {
                dup: false,
                qos,
                retain: false,
                topic: publish.topic.clone(),
                packet_id: None,
                payload: publish.payload.clone(),
            };
            Some(async move {
                if let Err(e) = session.deliver(outgoing).await {
                    warn!(client_id = %client_id, error = %e, "delivery failed");
                }
            })
        });

        // A slow subscriber holds up only its own delivery
        join_all(deliveries).await;
        Ok(())
    }

    async fn terminate(&self, session: &Arc<Session>, connection_id: u64) -> BackendResult<()> {
        if !session.detach(connection_id) || !session.is_clean() {
            return Ok(());
        }

        let removed = self
            .sessions
            .remove_if(session.client_id(), |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            self.matcher.unsubscribe_all(session.client_id());
        }
        Ok(())
    }
}
