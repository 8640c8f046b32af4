//! Broker abstraction for pluggable backends

use async_trait::async_trait;
use bytes::Bytes;

use super::{ConnectError, Credentials, InboundMessage, QoS, TransportError};
use crate::message::DeviceIdentity;

/// An established, authenticated connection to a broker
#[async_trait]
pub trait BrokerLink: Send + 'static {
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), TransportError>;

    /// Next inbound message. Must be cancel safe; an error means the link is gone.
    async fn recv(&mut self) -> Result<InboundMessage, TransportError>;

    /// Close the link gracefully
    async fn close(&mut self);
}

/// Factory for broker links
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// The link type this connector produces
    type Link: BrokerLink;

    /// Attempt to connect and authenticate
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        credentials: &Credentials,
    ) -> Result<Self::Link, ConnectError>;

    /// Human-readable name for this backend
    fn name(&self) -> &'static str;
}
