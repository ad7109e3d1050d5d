use std::time::Duration;

use spb_types::topic::QoS;

/// MQTT username and password.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// TLS bundle for `ssl://` broker connections.
///
/// Paths reference PEM files on disk; they are read by the transport
/// implementation at connect time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TlsOptions {
    /// CA trust store.
    pub ca_file: String,
    /// Client certificate, for mutual TLS.
    pub client_cert: Option<String>,
    /// Client private key, for mutual TLS.
    pub client_key: Option<String>,
    pub key_password: Option<String>,
    pub cipher_suites: Option<String>,
    pub verify_server_cert: bool,
}

impl TlsOptions {
    pub fn new(ca_file: impl Into<String>) -> Self {
        Self {
            ca_file: ca_file.into(),
            client_cert: None,
            client_key: None,
            key_password: None,
            cipher_suites: None,
            verify_server_cert: true,
        }
    }
}

/// Connection configuration handed to a transport implementation.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttOptions {
    /// `tcp://host:port` or `ssl://host:port`.
    pub broker_url: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsOptions>,
}

impl MqttOptions {
    pub fn new(broker_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            credentials: None,
            tls: None,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// A will message lodged with the broker at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Events a transport delivers to its session.
///
/// Emitted on the transport's own task; the session never blocks the
/// transport while holding its lock.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An inbound publish.
    Message { topic: String, payload: Vec<u8> },
    /// The connection dropped without a requested disconnect.
    ConnectionLost,
}
