use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use log::{error, trace, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Packet, TlsConfiguration,
    Transport as RumqttcTransport,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use spb_client::{
    LastWill, MqttOptions, TlsOptions, Transport, TransportError, TransportEvent,
};
use spb_types::topic::QoS;

fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// Split a `tcp://host:port` or `ssl://host:port` url into its parts.
fn parse_broker_url(url: &str) -> Result<(bool, String, u16), TransportError> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("tcp://") {
        (false, rest)
    } else if let Some(rest) = url.strip_prefix("ssl://") {
        (true, rest)
    } else {
        return Err(TransportError::InvalidOptions(format!(
            "broker url {url:?} must start with tcp:// or ssl://"
        )));
    };

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidOptions(format!("broker url {url:?} has no port")))?;
    if host.is_empty() {
        return Err(TransportError::InvalidOptions(format!(
            "broker url {url:?} has no host"
        )));
    }
    let port: u16 = port.parse().map_err(|_| {
        TransportError::InvalidOptions(format!("broker url {url:?} has an invalid port"))
    })?;
    Ok((tls, host.to_string(), port))
}

fn tls_configuration(tls: &TlsOptions) -> Result<TlsConfiguration, TransportError> {
    if tls.key_password.is_some() {
        return Err(TransportError::Tls(
            "password protected client keys are not supported by the rumqtt transport".into(),
        ));
    }
    if tls.cipher_suites.is_some() {
        warn!("ignoring cipher suite list: the rumqtt transport uses the rustls defaults");
    }
    if !tls.verify_server_cert {
        warn!("server certificate verification cannot be disabled with the rumqtt transport");
    }

    let read = |path: &str| {
        std::fs::read(path)
            .map_err(|e| TransportError::Tls(format!("failed to read {path:?}: {e}")))
    };

    let ca = read(&tls.ca_file)?;
    let client_auth = match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => Some((read(cert)?, read(key)?)),
        (None, None) => None,
        _ => {
            return Err(TransportError::Tls(
                "client cert and key must both be provided for mutual tls".into(),
            ))
        }
    };

    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    })
}

struct Active {
    client: AsyncClient,
    task: JoinHandle<()>,
}

/// A [Transport] implementation using [rumqttc].
///
/// Each `connect` builds a fresh [AsyncClient] and spawns a task polling its
/// event loop; inbound publishes and connection loss are forwarded as
/// [TransportEvent]s. There is no automatic reconnection: the session owns
/// that policy.
pub struct RumqttTransport {
    tls: bool,
    host: String,
    port: u16,
    options: MqttOptions,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    active: Mutex<Option<Active>>,
    manual_disconnect: Arc<AtomicBool>,
}

impl RumqttTransport {
    /// Validates the broker url and returns the transport together with the
    /// event stream to hand to a session.
    pub fn new(
        options: MqttOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let (tls, host, port) = parse_broker_url(&options.broker_url)?;
        if tls && options.tls.is_none() {
            return Err(TransportError::InvalidOptions(
                "ssl:// broker url requires tls options".into(),
            ));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                tls,
                host,
                port,
                options,
                events_tx,
                active: Mutex::new(None),
                manual_disconnect: Arc::new(AtomicBool::new(false)),
            },
            events_rx,
        ))
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(active) => Ok(active.client.clone()),
            None => Err(TransportError::NotConnected),
        }
    }
}

async fn drive_eventloop(
    mut eventloop: EventLoop,
    connack_tx: oneshot::Sender<Result<(), TransportError>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    manual_disconnect: Arc<AtomicBool>,
) {
    let mut connack_tx = Some(connack_tx);
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                trace!("{event:?}");
                match event {
                    Event::Incoming(Packet::ConnAck(ack)) => {
                        let result = if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(TransportError::ConnectionRefused {
                                reason: format!("{:?}", ack.code),
                            })
                        };
                        let failed = result.is_err();
                        if let Some(tx) = connack_tx.take() {
                            _ = tx.send(result);
                        }
                        if failed {
                            break;
                        }
                    }
                    Event::Incoming(Packet::Publish(publish)) => {
                        _ = events_tx.send(TransportEvent::Message {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        });
                    }
                    Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                        manual_disconnect.store(true, Ordering::SeqCst);
                    }
                    _ => {}
                }
            }
            Err(e) => {
                if let Some(tx) = connack_tx.take() {
                    _ = tx.send(Err(TransportError::ConnectionRefused {
                        reason: e.to_string(),
                    }));
                } else if !manual_disconnect.load(Ordering::SeqCst) {
                    error!("mqtt connection lost: {e}");
                    _ = events_tx.send(TransportEvent::ConnectionLost);
                }
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&self, will: Option<LastWill>) -> Result<(), TransportError> {
        let connack_rx = {
            let mut active = self.active.lock().unwrap();
            // A finished task means the previous connection died; allow a
            // fresh connect over it.
            match active.as_ref() {
                Some(previous) if !previous.task.is_finished() => {
                    return Err(TransportError::AlreadyConnected)
                }
                _ => *active = None,
            }

            let mut options =
                rumqttc::MqttOptions::new(&self.options.client_id, &self.host, self.port);
            options
                .set_keep_alive(self.options.keep_alive)
                .set_clean_session(self.options.clean_session);
            if let Some(credentials) = &self.options.credentials {
                options.set_credentials(&credentials.username, &credentials.password);
            }
            if self.tls {
                // new() enforced that tls options are present for ssl urls
                let tls = self.options.tls.as_ref().unwrap();
                options.set_transport(RumqttcTransport::Tls(tls_configuration(tls)?));
            }
            if let Some(will) = will {
                options.set_last_will(rumqttc::LastWill::new(
                    will.topic,
                    will.payload,
                    to_rumqttc_qos(will.qos),
                    will.retain,
                ));
            }

            self.manual_disconnect.store(false, Ordering::SeqCst);
            let (client, eventloop) = AsyncClient::new(options, 64);
            let (connack_tx, connack_rx) = oneshot::channel();
            let task = tokio::spawn(drive_eventloop(
                eventloop,
                connack_tx,
                self.events_tx.clone(),
                self.manual_disconnect.clone(),
            ));
            *active = Some(Active { client, task });
            connack_rx
        };

        match connack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.active.lock().unwrap().take();
                Err(e)
            }
            Err(_) => {
                self.active.lock().unwrap().take();
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let active = self
            .active
            .lock()
            .unwrap()
            .take()
            .ok_or(TransportError::NotConnected)?;
        self.manual_disconnect.store(true, Ordering::SeqCst);
        let result = active
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Request(e.to_string()));
        _ = active.task.await;
        result
    }

    async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client()?
            .publish(topic, to_rumqttc_qos(qos), retain, payload)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn subscribe(&self, filter: String, qos: QoS) -> Result<(), TransportError> {
        self.client()?
            .subscribe(filter, to_rumqttc_qos(qos))
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}
