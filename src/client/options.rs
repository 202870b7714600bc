//! Client connection options

use std::time::Duration;

use bytes::Bytes;

use crate::protocol::{Connect, Will, PROTOCOL_LEVEL_V311};
use crate::session::DEFAULT_RETRY_INTERVAL;

/// Settings for one [`super::Client::connect`] call
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_id: String,
    /// Discard any previous session state (default: true)
    pub clean_session: bool,
    /// Keep-alive interval, whole seconds; zero disables pinging
    pub keep_alive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub will: Option<Will>,
    /// How long to wait for CONNACK after CONNECT is written
    pub connect_timeout: Duration,
    /// Age after which an unacknowledged publish is sent again
    pub retry_interval: Duration,
    /// Upper bound on how long `disconnect` waits for in-flight messages
    pub disconnect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: true,
            keep_alive: Duration::from_secs(30),
            username: None,
            password: None,
            will: None,
            connect_timeout: Duration::from_secs(10),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            disconnect_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    pub(crate) fn to_connect(&self) -> Connect {
        Connect {
            protocol_level: PROTOCOL_LEVEL_V311,
            client_id: self.client_id.clone(),
            clean_session: self.clean_session,
            keep_alive: self.keep_alive.as_secs().min(u16::MAX as u64) as u16,
            username: self.username.clone(),
            password: self.password.clone().map(Bytes::from),
            will: self.will.clone(),
        }
    }
}
