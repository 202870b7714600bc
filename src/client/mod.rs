//! MQTT Client
//!
//! A [`Client`] owns at most one broker connection at a time. Every
//! operation returns immediately with an [`MqttFuture`] that resolves when
//! the matching acknowledgment has been processed. The client keeps its own
//! message stores so unacknowledged publishes of a persistent session are
//! sent again (with the dup flag) after the next connect.
//!
//! There is no automatic reconnect; callers react to the error delivered
//! through the callback.

mod connection;
mod error;
mod future;
mod options;

pub use error::ClientError;
pub use future::{pair, MqttFuture, Resolver};
pub use options::ClientOptions;

use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::protocol::{
    ConnAck, ConnectReturnCode, Message, Packet, Publish, QoS, SubscribeReturnCode, Subscription,
};
use crate::session::{EngineConfig, Role, SessionEngine};
use crate::store::{MemoryStore, MessageStore};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport;

use connection::Command;

/// Outcome of the CONNECT handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResult {
    pub return_code: ConnectReturnCode,
    pub session_present: bool,
}

pub type ConnectFuture = MqttFuture<ConnectResult>;
/// Resolves with one return code per requested filter
pub type SubscribeFuture = MqttFuture<Vec<SubscribeReturnCode>>;
pub type UnsubscribeFuture = MqttFuture<()>;
/// Resolves on PUBACK / PUBCOMP, or once written for QoS 0
pub type PublishFuture = MqttFuture<()>;

/// Receives every incoming message, and connection errors
pub type Callback = Arc<dyn Fn(Result<Message, ClientError>) + Send + Sync>;

/// Connection lifecycle as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// MQTT client handle
///
/// Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    incoming: Arc<dyn MessageStore>,
    outgoing: Arc<dyn MessageStore>,
    callback: RwLock<Option<Callback>>,
    inner: Mutex<Inner>,
    /// Signalled whenever the in-flight state may have shrunk
    settled: Notify,
}

struct Inner {
    state: ClientState,
    link: Option<Link>,
}

/// State of the current connection
struct Link {
    engine: Arc<Mutex<SessionEngine>>,
    commands: mpsc::UnboundedSender<Command>,
    options: ClientOptions,
    connect: Option<Resolver<ConnectResult>>,
    publishes: AHashMap<u16, Resolver<()>>,
    subscribes: AHashMap<u16, Resolver<Vec<SubscribeReturnCode>>>,
    unsubscribes: AHashMap<u16, Resolver<()>>,
}

impl Client {
    /// Client with in-memory message stores
    pub fn new() -> Self {
        Self::with_stores(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    pub fn with_stores(incoming: Arc<dyn MessageStore>, outgoing: Arc<dyn MessageStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                incoming,
                outgoing,
                callback: RwLock::new(None),
                inner: Mutex::new(Inner {
                    state: ClientState::Disconnected,
                    link: None,
                }),
                settled: Notify::new(),
            }),
        }
    }

    /// Install the handler for incoming messages and connection errors
    ///
    /// Invoked from the connection task, in receipt order.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(Result<Message, ClientError>) + Send + Sync + 'static,
    {
        *self.shared.callback.write() = Some(Arc::new(callback));
    }

    pub fn incoming_store(&self) -> Arc<dyn MessageStore> {
        self.shared.incoming.clone()
    }

    pub fn outgoing_store(&self) -> Arc<dyn MessageStore> {
        self.shared.outgoing.clone()
    }

    pub fn state(&self) -> ClientState {
        self.shared.inner.lock().state
    }

    /// Dial `url` and send CONNECT
    ///
    /// Dial failures are returned here; the handshake result arrives through
    /// the returned future.
    pub async fn connect(
        &self,
        url: &str,
        options: ClientOptions,
    ) -> Result<ConnectFuture, ClientError> {
        if options.client_id.is_empty() && !options.clean_session {
            return Err(ClientError::MissingClientId);
        }

        {
            let mut inner = self.shared.inner.lock();
            if inner.state != ClientState::Disconnected {
                return Err(ClientError::AlreadyConnecting);
            }
            inner.state = ClientState::Connecting;
        }

        let stream = match transport::dial(url).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Failed to dial {}: {}", url, e);
                self.shared.inner.lock().state = ClientState::Disconnected;
                return Err(e.into());
            }
        };

        match self.start(stream, options) {
            Ok(future) => Ok(future),
            Err(e) => {
                self.shared.inner.lock().state = ClientState::Disconnected;
                Err(e)
            }
        }
    }

    fn start(
        &self,
        stream: transport::BoxedStream,
        options: ClientOptions,
    ) -> Result<ConnectFuture, ClientError> {
        if options.clean_session {
            self.shared.incoming.reset()?;
            self.shared.outgoing.reset()?;
        }

        let mut engine = SessionEngine::new(
            Role::Client,
            self.shared.incoming.clone(),
            self.shared.outgoing.clone(),
            EngineConfig {
                retry_interval: options.retry_interval,
                ..Default::default()
            },
        );
        let connect = engine.connect(options.to_connect(), Instant::now())?;
        let engine = Arc::new(Mutex::new(engine));
        let connack_deadline = Instant::now() + options.connect_timeout;

        let (resolver, future) = future::pair();
        let (commands, command_rx) = mpsc::unbounded_channel();

        self.shared.inner.lock().link = Some(Link {
            engine: engine.clone(),
            commands,
            options,
            connect: Some(resolver),
            publishes: AHashMap::new(),
            subscribes: AHashMap::new(),
            unsubscribes: AHashMap::new(),
        });

        tokio::spawn(connection::run(
            self.shared.clone(),
            stream,
            engine,
            connect,
            connack_deadline,
            command_rx,
        ));
        Ok(future)
    }

    /// Subscribe to one filter
    pub fn subscribe(&self, filter: &str, qos: QoS) -> Result<SubscribeFuture, ClientError> {
        self.subscribe_multiple(vec![Subscription::new(filter, qos)])
    }

    pub fn subscribe_multiple(
        &self,
        subscriptions: Vec<Subscription>,
    ) -> Result<SubscribeFuture, ClientError> {
        for sub in &subscriptions {
            validate_topic_filter(&sub.filter).map_err(ClientError::InvalidTopic)?;
        }

        let mut inner = self.shared.inner.lock();
        let link = inner.connected()?;

        let packet = link.engine.lock().subscribe(subscriptions, Instant::now())?;
        let packet_id = match &packet {
            Packet::Subscribe(subscribe) => subscribe.packet_id,
            _ => return Err(ClientError::Canceled),
        };

        let (resolver, future) = future::pair();
        link.subscribes.insert(packet_id, resolver);
        link.send(packet, None)?;
        Ok(future)
    }

    pub fn unsubscribe(&self, filters: &[&str]) -> Result<UnsubscribeFuture, ClientError> {
        for filter in filters {
            validate_topic_filter(filter).map_err(ClientError::InvalidTopic)?;
        }
        let filters = filters.iter().map(|f| f.to_string()).collect();

        let mut inner = self.shared.inner.lock();
        let link = inner.connected()?;

        let packet = link.engine.lock().unsubscribe(filters, Instant::now())?;
        let packet_id = match &packet {
            Packet::Unsubscribe(unsubscribe) => unsubscribe.packet_id,
            _ => return Err(ClientError::Canceled),
        };

        let (resolver, future) = future::pair();
        link.unsubscribes.insert(packet_id, resolver);
        link.send(packet, None)?;
        Ok(future)
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishFuture, ClientError> {
        validate_topic_name(topic).map_err(ClientError::InvalidTopic)?;

        let mut publish = Publish::new(topic, payload, qos);
        publish.retain = retain;

        let mut inner = self.shared.inner.lock();
        let link = inner.connected()?;

        let packet = link.engine.lock().send(publish, Instant::now())?;
        let (resolver, future) = future::pair();
        match &packet {
            Packet::Publish(Publish {
                packet_id: Some(packet_id),
                ..
            }) => {
                link.publishes.insert(*packet_id, resolver);
                link.send(packet, None)?;
            }
            _ => link.send(packet, Some(resolver))?,
        }
        Ok(future)
    }

    /// Gracefully close the connection
    ///
    /// Waits, at most `disconnect_timeout`, for in-flight messages in both
    /// stores to complete, then sends DISCONNECT and returns once the
    /// connection task has shut down. While the handshake is still pending
    /// the connect attempt is abandoned instead and the connect future fails
    /// with [`ClientError::Canceled`].
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let settle = {
            let mut inner = self.shared.inner.lock();
            let settle = match (inner.state, inner.link.as_ref()) {
                (ClientState::Connected, Some(link)) => Some(link.options.disconnect_timeout),
                (ClientState::Connecting, Some(_)) => None,
                _ => return Err(ClientError::NotConnected),
            };
            inner.state = ClientState::Disconnecting;
            settle
        };

        if let Some(timeout) = settle {
            if tokio::time::timeout(timeout, self.shared.wait_settled())
                .await
                .is_err()
            {
                warn!("Disconnecting with in-flight messages still pending");
            }
        }

        let (resolver, future) = future::pair();
        {
            let mut inner = self.shared.inner.lock();
            let Some(link) = inner.link.as_mut() else {
                return Err(ClientError::NotConnected);
            };
            link.commands
                .send(Command::Disconnect(resolver))
                .map_err(|_| ClientError::NotConnected)?;
        }

        future.wait().await
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn connected(&mut self) -> Result<&mut Link, ClientError> {
        match (self.state, self.link.as_mut()) {
            (ClientState::Connected, Some(link)) => Ok(link),
            _ => Err(ClientError::NotConnected),
        }
    }
}

impl Link {
    fn send(&self, packet: Packet, written: Option<Resolver<()>>) -> Result<(), ClientError> {
        self.commands
            .send(Command::Write { packet, written })
            .map_err(|_| ClientError::NotConnected)
    }
}

impl Shared {
    /// Wait until both stores are empty
    async fn wait_settled(&self) {
        loop {
            let notified = self.settled.notified();
            let incoming = self.incoming.is_empty().unwrap_or(true);
            let outgoing = self.outgoing.is_empty().unwrap_or(true);
            if incoming && outgoing {
                return;
            }
            notified.await;
        }
    }

    fn emit(&self, result: Result<Message, ClientError>) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    /// Handshake finished; the link becomes usable
    fn connected(&self, connack: ConnAck) {
        let mut inner = self.inner.lock();
        let Some(link) = inner.link.as_mut() else {
            return;
        };
        let resolver = link.connect.take();
        if connack.return_code.is_accepted() && inner.state == ClientState::Connecting {
            inner.state = ClientState::Connected;
        }
        if let Some(resolver) = resolver {
            resolver.resolve(Ok(ConnectResult {
                return_code: connack.return_code,
                session_present: connack.session_present,
            }));
        }
    }

    fn acknowledged(&self, packet_id: u16) {
        let resolver = self
            .inner
            .lock()
            .link
            .as_mut()
            .and_then(|link| link.publishes.remove(&packet_id));
        if let Some(resolver) = resolver {
            resolver.resolve(Ok(()));
        }
    }

    fn subscribed(&self, packet_id: u16, return_codes: Vec<SubscribeReturnCode>) {
        let resolver = self
            .inner
            .lock()
            .link
            .as_mut()
            .and_then(|link| link.subscribes.remove(&packet_id));
        if let Some(resolver) = resolver {
            resolver.resolve(Ok(return_codes));
        }
    }

    fn unsubscribed(&self, packet_id: u16) {
        let resolver = self
            .inner
            .lock()
            .link
            .as_mut()
            .and_then(|link| link.unsubscribes.remove(&packet_id));
        if let Some(resolver) = resolver {
            resolver.resolve(Ok(()));
        }
    }

    /// Tear the link down, failing everything still outstanding
    fn detach(&self, error: Option<ClientError>) {
        let link = {
            let mut inner = self.inner.lock();
            inner.state = ClientState::Disconnected;
            inner.link.take()
        };

        if let Some(link) = link {
            if let Some(resolver) = link.connect {
                resolver.resolve(Err(error.clone().unwrap_or(ClientError::Canceled)));
            }
            for (_, resolver) in link.publishes {
                resolver.resolve(Err(ClientError::ConnectionLost));
            }
            for (_, resolver) in link.subscribes {
                resolver.resolve(Err(ClientError::ConnectionLost));
            }
            for (_, resolver) in link.unsubscribes {
                resolver.resolve(Err(ClientError::ConnectionLost));
            }
        }

        self.settled.notify_waiters();
        if let Some(error) = error {
            self.emit(Err(error));
        }
    }
}
