//! relaymq - MQTT 3.1.1 broker and client
//!
//! Both sides share one per-connection protocol state machine
//! ([`session::SessionEngine`]) that tracks QoS handshakes, packet
//! identifiers and keep-alive. The broker routes messages through a
//! pluggable [`backend::Backend`]; the in-memory implementation keeps
//! sessions, subscriptions and retained messages for the life of the
//! process.

pub mod backend;
pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod session;
pub mod store;
pub mod topic;
pub mod transport;

pub use backend::{Backend, MemoryBackend};
pub use broker::{Broker, BrokerConfig};
pub use client::{Client, ClientError, ClientOptions};
pub use config::Config;
pub use protocol::{Message, QoS};
