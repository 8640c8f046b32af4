//! In-process broker for local development and tests
//!
//! Acts as its own certificate authority: [`MemoryBroker::issue_credentials`]
//! signs a certificate naming the device and trusts it for that device
//! only. Faults can be injected by
//! severing links, dropping matching publishes or making the broker
//! unreachable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    certificate_fingerprint, AuthError, BrokerConnector, BrokerLink, ConnectError, Credentials,
    InboundMessage, QoS, TransportError,
};
use crate::message::DeviceIdentity;
use crate::topics::TopicFilter;

enum LinkEvent {
    Message(InboundMessage),
    Severed,
}

struct Client {
    device_id: String,
    filters: Vec<TopicFilter>,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

struct DropRule {
    filter: TopicFilter,
    remaining: usize,
}

struct Authority {
    cert: Certificate,
    key: KeyPair,
    pem: Vec<u8>,
}

struct BrokerState {
    authority: Authority,
    /// Fingerprint of every issued certificate and the device it names
    trusted: HashMap<String, String>,
    reachable: bool,
    next_client: u64,
    clients: HashMap<u64, Client>,
    drop_rules: Vec<DropRule>,
    connect_attempts: usize,
    published: Vec<(String, Bytes)>,
}

/// Shared handle to an in-memory broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Result<Self, AuthError> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "memory broker authority");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let key = KeyPair::generate().map_err(rcgen_error)?;
        let cert = params.self_signed(&key).map_err(rcgen_error)?;
        let pem = cert.pem().into_bytes();

        Ok(Self {
            state: Arc::new(Mutex::new(BrokerState {
                authority: Authority { cert, key, pem },
                trusted: HashMap::new(),
                reachable: true,
                next_client: 0,
                clients: HashMap::new(),
                drop_rules: Vec::new(),
                connect_attempts: 0,
                published: Vec::new(),
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sign a certificate for `device_id` and trust it for that device.
    /// Returns the credentials and their fingerprint.
    pub fn issue_credentials(&self, device_id: &str) -> Result<(Credentials, String), AuthError> {
        let key = KeyPair::generate().map_err(rcgen_error)?;
        let mut state = self.lock();
        let cert = device_params(device_id)?
            .signed_by(&key, &state.authority.cert, &state.authority.key)
            .map_err(rcgen_error)?;

        let credentials = Credentials::from_pem(
            state.authority.pem.clone(),
            cert.pem().into_bytes(),
            key.serialize_pem().into_bytes(),
        );
        let fingerprint = credentials.fingerprint()?;
        state.trusted.insert(fingerprint.clone(), device_id.to_string());
        Ok((credentials, fingerprint))
    }

    /// Self-signed certificate for `device_id` that the broker does not trust
    pub fn untrusted_credentials(&self, device_id: &str) -> Result<(Credentials, String), AuthError> {
        let key = KeyPair::generate().map_err(rcgen_error)?;
        let cert = device_params(device_id)?.self_signed(&key).map_err(rcgen_error)?;
        let credentials = Credentials::from_pem(
            self.lock().authority.pem.clone(),
            cert.pem().into_bytes(),
            key.serialize_pem().into_bytes(),
        );
        let fingerprint = credentials.fingerprint()?;
        Ok((credentials, fingerprint))
    }

    pub fn revoke(&self, fingerprint: &str) {
        self.lock().trusted.remove(&fingerprint.to_ascii_lowercase());
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Drop every live link of `device_id`
    pub fn sever(&self, device_id: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .clients
            .iter()
            .filter(|(_, c)| c.device_id == device_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(client) = state.clients.remove(&id) {
                let _ = client.tx.send(LinkEvent::Severed);
            }
        }
        info!("Severed links of {}", device_id);
    }

    /// Silently drop the next `count` publishes whose topic matches `filter`
    pub fn drop_next(&self, filter: &str, count: usize) {
        if let Some(filter) = TopicFilter::parse(filter) {
            self.lock().drop_rules.push(DropRule {
                filter,
                remaining: count,
            });
        }
    }

    pub fn connection_count(&self, device_id: &str) -> usize {
        self.lock()
            .clients
            .values()
            .filter(|c| c.device_id == device_id)
            .count()
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Topics and payloads of every publish the broker accepted
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.lock().published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Bytes> {
        self.lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn deliver(&self, topic: &str, payload: Bytes) {
        let mut state = self.lock();
        state.published.push((topic.to_string(), payload.clone()));

        if let Some(rule) = state
            .drop_rules
            .iter_mut()
            .find(|r| r.remaining > 0 && r.filter.matches(topic))
        {
            rule.remaining -= 1;
            debug!("Dropping publish on {} (fault injection)", topic);
            return;
        }

        for client in state.clients.values() {
            if client.filters.iter().any(|f| f.matches(topic)) {
                let _ = client.tx.send(LinkEvent::Message(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                }));
            }
        }
    }
}

/// CN and DNS SAN set to the device id
fn device_params(device_id: &str) -> Result<CertificateParams, AuthError> {
    let mut params = CertificateParams::new(vec![device_id.to_string()]).map_err(rcgen_error)?;
    params.distinguished_name.push(DnType::CommonName, device_id);
    Ok(params)
}

fn rcgen_error(err: rcgen::Error) -> AuthError {
    AuthError::InvalidCertificate(err.to_string())
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker").finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    type Link = MemoryLink;

    async fn connect(
        &self,
        identity: &DeviceIdentity,
        credentials: &Credentials,
    ) -> Result<MemoryLink, ConnectError> {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if !state.reachable {
            return Err(ConnectError::Unreachable("memory broker offline".into()));
        }
        if credentials.ca_pem != state.authority.pem {
            return Err(ConnectError::AuthFailed(
                "broker certificate not signed by trusted authority".into(),
            ));
        }
        let fingerprint = certificate_fingerprint(&credentials.cert_pem)?;
        match state.trusted.get(&fingerprint) {
            None => {
                return Err(ConnectError::AuthFailed(format!(
                    "client certificate {fingerprint} not trusted"
                )))
            }
            Some(owner) if *owner != identity.device_id => {
                return Err(ConnectError::AuthFailed(format!(
                    "client certificate {fingerprint} issued to {owner}, not {}",
                    identity.device_id
                )))
            }
            Some(_) => {}
        }

        let id = state.next_client;
        state.next_client += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.clients.insert(
            id,
            Client {
                device_id: identity.device_id.clone(),
                filters: Vec::new(),
                tx,
            },
        );
        debug!("{} connected to memory broker as client {}", identity.device_id, id);

        Ok(MemoryLink {
            id,
            broker: self.clone(),
            rx,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Link to a [`MemoryBroker`]
pub struct MemoryLink {
    id: u64,
    broker: MemoryBroker,
    rx: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn subscribe(&mut self, filter: &str, _qos: QoS) -> Result<(), TransportError> {
        let filter = TopicFilter::parse(filter)
            .ok_or_else(|| TransportError::ConnectionLost(format!("invalid filter {filter}")))?;
        let mut state = self.broker.lock();
        let client = state.clients.get_mut(&self.id).ok_or(TransportError::Closed)?;
        if !client.filters.contains(&filter) {
            client.filters.push(filter);
        }
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Bytes, _qos: QoS) -> Result<(), TransportError> {
        if !self.broker.lock().clients.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        self.broker.deliver(topic, payload);
        Ok(())
    }

    async fn recv(&mut self) -> Result<InboundMessage, TransportError> {
        match self.rx.recv().await {
            Some(LinkEvent::Message(message)) => Ok(message),
            Some(LinkEvent::Severed) => Err(TransportError::ConnectionLost("severed by broker".into())),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        self.broker.lock().clients.remove(&self.id);
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.broker.lock().clients.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    fn identity(broker: &MemoryBroker, id: &str) -> (DeviceIdentity, Credentials) {
        let (creds, fingerprint) = broker.issue_credentials(id).unwrap();
        (DeviceIdentity::new(id, Role::Drone, fingerprint), creds)
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let broker = MemoryBroker::new().unwrap();
        let (a_id, a_creds) = identity(&broker, "a");
        let (b_id, b_creds) = identity(&broker, "b");
        let mut a = broker.connect(&a_id, &a_creds).await.unwrap();
        let mut b = broker.connect(&b_id, &b_creds).await.unwrap();

        b.subscribe("devices/+/telemetry", QoS::AtMostOnce).await.unwrap();
        a.publish("devices/a/telemetry", Bytes::from_static(b"t"), QoS::AtMostOnce)
            .await
            .unwrap();
        a.publish("devices/a/state", Bytes::from_static(b"s"), QoS::AtLeastOnce)
            .await
            .unwrap();

        let msg = b.recv().await.unwrap();
        assert_eq!(msg.topic, "devices/a/telemetry");
        assert_eq!(msg.payload, Bytes::from_static(b"t"));
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_untrusted_and_unreachable() {
        let broker = MemoryBroker::new().unwrap();
        let (creds, fingerprint) = broker.untrusted_credentials("rogue").unwrap();
        let id = DeviceIdentity::new("rogue", Role::Drone, fingerprint);
        assert!(matches!(
            broker.connect(&id, &creds).await,
            Err(ConnectError::AuthFailed(_))
        ));

        let (id, creds) = identity(&broker, "a");
        broker.set_reachable(false);
        assert!(matches!(
            broker.connect(&id, &creds).await,
            Err(ConnectError::Unreachable(_))
        ));
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_foreign_authority_rejected() {
        let broker = MemoryBroker::new().unwrap();
        let other = MemoryBroker::new().unwrap();
        let (creds, fingerprint) = other.issue_credentials("a").unwrap();
        let id = DeviceIdentity::new("a", Role::Drone, fingerprint);
        assert!(matches!(
            broker.connect(&id, &creds).await,
            Err(ConnectError::AuthFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_certificate_bound_to_its_device() {
        let broker = MemoryBroker::new().unwrap();
        let (creds, fingerprint) = broker.issue_credentials("drone-1").unwrap();

        let impostor = DeviceIdentity::new("drone-2", Role::Drone, fingerprint.clone());
        match broker.connect(&impostor, &creds).await {
            Err(ConnectError::AuthFailed(reason)) => assert!(reason.contains("issued to drone-1")),
            other => panic!("expected auth failure, got {:?}", other.err()),
        }
        assert_eq!(broker.connection_count("drone-2"), 0);

        let owner = DeviceIdentity::new("drone-1", Role::Drone, fingerprint);
        assert!(broker.connect(&owner, &creds).await.is_ok());
    }

    #[tokio::test]
    async fn test_sever_ends_link() {
        let broker = MemoryBroker::new().unwrap();
        let (id, creds) = identity(&broker, "a");
        let mut link = broker.connect(&id, &creds).await.unwrap();
        assert_eq!(broker.connection_count("a"), 1);

        broker.sever("a");
        assert!(matches!(link.recv().await, Err(TransportError::ConnectionLost(_))));
        assert!(link.publish("x", Bytes::new(), QoS::AtMostOnce).await.is_err());
        assert_eq!(broker.connection_count("a"), 0);
    }

    #[tokio::test]
    async fn test_drop_next_discards_matching() {
        let broker = MemoryBroker::new().unwrap();
        let (id, creds) = identity(&broker, "a");
        let mut link = broker.connect(&id, &creds).await.unwrap();
        link.subscribe("devices/a/#", QoS::AtLeastOnce).await.unwrap();

        broker.drop_next("devices/a/acks", 1);
        link.publish("devices/a/acks", Bytes::from_static(b"1"), QoS::AtLeastOnce)
            .await
            .unwrap();
        link.publish("devices/a/acks", Bytes::from_static(b"2"), QoS::AtLeastOnce)
            .await
            .unwrap();

        assert_eq!(link.recv().await.unwrap().payload, Bytes::from_static(b"2"));
    }
}
