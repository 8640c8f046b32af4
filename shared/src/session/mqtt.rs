//! MQTT over mutual TLS (rumqttc + rustls)

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet,
    TlsConfiguration, TlsError, Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    BrokerConnector, BrokerLink, ConnectError, Credentials, InboundMessage, QoS, TransportError,
};
use crate::config::BrokerConfig;
use crate::message::DeviceIdentity;

const REQUEST_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    keep_alive: Duration,
}

impl MqttConnector {
    pub fn new(host: impl Into<String>, port: u16, keep_alive: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            keep_alive,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            config.host.clone(),
            config.port,
            Duration::from_secs(config.keep_alive_secs),
        )
    }

    fn options(&self, identity: &DeviceIdentity, credentials: &Credentials) -> MqttOptions {
        let mut options = MqttOptions::new(identity.device_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        // Keep the broker-side session so at-least-once traffic survives reconnects
        options.set_clean_session(false);
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca: credentials.ca_pem.clone(),
            alpn: None,
            client_auth: Some((credentials.cert_pem.clone(), credentials.key_pem.clone())),
        }));
        options
    }
}

fn to_mqtt(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

/// Only a rejected handshake or unusable certificate material is an
/// authentication failure. Socket errors on the way to the handshake are
/// retried like any other unreachable broker.
fn map_connect_error(err: ConnectionError) -> ConnectError {
    match err {
        // tokio-rustls reports handshake failures as InvalidData
        ConnectionError::Tls(TlsError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
            ConnectError::AuthFailed(format!("TLS handshake failed: {e}"))
        }
        ConnectionError::Tls(TlsError::Io(e)) => ConnectError::Unreachable(format!("TLS transport: {e}")),
        ConnectionError::Tls(e) => ConnectError::AuthFailed(format!("TLS handshake failed: {e}")),
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => ConnectError::AuthFailed(format!("{code:?}")),
        ConnectionError::ConnectionRefused(code) => ConnectError::Refused(format!("{code:?}")),
        other => ConnectError::Unreachable(other.to_string()),
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    type Link = MqttLink;

    async fn connect(
        &self,
        identity: &DeviceIdentity,
        credentials: &Credentials,
    ) -> Result<MqttLink, ConnectError> {
        let (client, mut eventloop) =
            AsyncClient::new(self.options(identity, credentials), REQUEST_CAPACITY);

        // Drive the event loop until the broker answers the CONNECT
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(map_connect_error(ConnectionError::ConnectionRefused(ack.code)));
                }
                Ok(_) => continue,
                Err(e) => return Err(map_connect_error(e)),
            }
        }
        debug!("MQTT session established with {}:{}", self.host, self.port);

        let (tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let driver = tokio::spawn(drive(eventloop, tx));
        Ok(MqttLink {
            client,
            inbound,
            driver,
        })
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

/// Poll the event loop and forward incoming publishes. Stops on the first
/// connection error; reconnecting is the session's job.
async fn drive(
    mut eventloop: EventLoop,
    tx: mpsc::Sender<Result<InboundMessage, TransportError>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if tx.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = tx
                    .send(Err(TransportError::ConnectionLost("broker disconnected".into())))
                    .await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                let _ = tx.send(Err(TransportError::ConnectionLost(e.to_string()))).await;
                return;
            }
        }
    }
}

pub struct MqttLink {
    client: AsyncClient,
    inbound: mpsc::Receiver<Result<InboundMessage, TransportError>>,
    driver: JoinHandle<()>,
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, to_mqtt(qos))
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), TransportError> {
        self.client
            .publish_bytes(topic, to_mqtt(qos), false, payload)
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    async fn recv(&mut self) -> Result<InboundMessage, TransportError> {
        match self.inbound.recv().await {
            Some(result) => result,
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect: {}", e);
        }
        self.driver.abort();
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
