use crate::protocol::QoS;

/// Last will: published by the broker if this client disappears without
/// sending DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: String,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    pub fn new(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Will {
            topic: topic.into(),
            message: message.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Options sent with each CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub username: Option<String>,
    /// Only sent when a username is present.
    pub password: Option<String>,
    /// Generated when absent or empty.
    pub client_id: Option<String>,
    pub clean_session: bool,
    pub will: Option<Will>,
    /// Seconds between PINGREQ packets; 0 disables keep-alive.
    pub keep_alive: u16,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            username: None,
            password: None,
            client_id: None,
            clean_session: true,
            will: None,
            keep_alive: 0,
        }
    }
}

impl ConnectionOptions {
    /// Creates options with the protocol defaults: clean session, no will,
    /// keep-alive disabled.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }
}
