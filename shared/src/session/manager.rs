//! Session with persistent broker connection and automatic reconnection

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::{
    Backoff, BrokerConnector, BrokerLink, ConnectError, Credentials, IdentityPolicy,
    InboundMessage, PublishError, QoS, SessionState, SessionStatus, TransportError,
};
use crate::config::Config;
use crate::defaults;
use crate::events::{ChannelEvent, EventBus};
use crate::message::DeviceIdentity;

const INBOUND_CAPACITY: usize = 1024;

/// Configuration for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout of a single connect attempt
    pub connect_timeout: Duration,
    /// Reconnection delay (initial)
    pub reconnect_base_delay: Duration,
    /// Maximum reconnection delay
    pub reconnect_max_delay: Duration,
    /// Publishes buffered while disconnected
    pub buffer_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            reconnect_base_delay: Duration::from_millis(defaults::RECONNECT_BASE_DELAY_MS),
            reconnect_max_delay: Duration::from_millis(defaults::RECONNECT_MAX_DELAY_MS),
            buffer_capacity: defaults::OUTBOUND_BUFFER_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.broker.connect_timeout_ms),
            reconnect_base_delay: config.reconnect_base_delay(),
            reconnect_max_delay: config.reconnect_max_delay(),
            buffer_capacity: config.broker.outbound_buffer_capacity,
        }
    }
}

#[derive(Debug)]
struct Outbound {
    topic: String,
    payload: Bytes,
    qos: QoS,
}

#[derive(Debug)]
enum Request {
    Publish(Outbound),
    Subscribe { filter: String, qos: QoS },
}

/// Handle to a broker session. The connection itself is owned by a
/// background task; publish and subscribe only enqueue.
pub struct Session {
    identity: DeviceIdentity,
    requests: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<SessionStatus>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    /// Authenticate and connect. Fails only if authentication is refused;
    /// an unreachable broker leaves the session reconnecting in the
    /// background. Inbound messages are delivered on the returned receiver.
    pub async fn connect<C: BrokerConnector>(
        connector: C,
        identity: DeviceIdentity,
        credentials: Credentials,
        policy: &dyn IdentityPolicy,
        config: SessionConfig,
        events: EventBus,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), ConnectError> {
        policy.verify(&identity, &credentials)?;

        info!(
            "Connecting {} ({}) via {}",
            identity.device_id,
            identity.role,
            connector.name()
        );
        events.publish(ChannelEvent::ConnectionChanged {
            device_id: identity.device_id.clone(),
            state: SessionState::Connecting,
        });

        let (link, state, last_error) =
            match timeout(config.connect_timeout, connector.connect(&identity, &credentials)).await {
                Ok(Ok(link)) => (Some(link), SessionState::Connected, None),
                Ok(Err(ConnectError::AuthFailed(reason))) => {
                    error!("Authentication refused for {}: {}", identity.device_id, reason);
                    events.publish(ChannelEvent::ConnectionChanged {
                        device_id: identity.device_id.clone(),
                        state: SessionState::Disconnected,
                    });
                    return Err(ConnectError::AuthFailed(reason));
                }
                Ok(Err(e)) => {
                    warn!("Initial connect failed: {}, will retry", e);
                    (None, SessionState::Reconnecting, Some(e.to_string()))
                }
                Err(_) => {
                    warn!("Initial connect timed out, will retry");
                    (None, SessionState::Reconnecting, Some(ConnectError::Timeout.to_string()))
                }
            };

        let (status_tx, status_rx) = watch::channel(SessionStatus {
            identity: identity.clone(),
            state,
            last_error,
        });
        events.publish(ChannelEvent::ConnectionChanged {
            device_id: identity.device_id.clone(),
            state,
        });

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session_loop = SessionLoop {
            backoff: Backoff::new(config.reconnect_base_delay, config.reconnect_max_delay),
            connector,
            identity: identity.clone(),
            credentials,
            config,
            events,
            requests: request_rx,
            inbound: inbound_tx,
            status: status_tx,
            shutdown: shutdown_rx,
            subscriptions: Vec::new(),
            buffer: VecDeque::new(),
        };
        let task = tokio::spawn(session_loop.run(link));

        Ok((
            Self {
                identity,
                requests: request_tx,
                status: status_rx,
                shutdown: shutdown_tx,
                task: Some(task),
            },
            inbound_rx,
        ))
    }

    /// Queue a publish. Never blocks; buffered while disconnected.
    pub fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), PublishError> {
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(PublishError::InvalidTopic(topic.to_string()));
        }
        self.requests
            .send(Request::Publish(Outbound {
                topic: topic.to_string(),
                payload,
                qos,
            }))
            .map_err(|_| PublishError::Closed)
    }

    /// Subscribe to a filter. The subscription is re-established after every
    /// reconnect.
    pub fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), PublishError> {
        if filter.is_empty() {
            return Err(PublishError::InvalidTopic(filter.to_string()));
        }
        self.requests
            .send(Request::Subscribe {
                filter: filter.to_string(),
                qos,
            })
            .map_err(|_| PublishError::Closed)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Watch status changes
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Close the session. Buffered publishes are not flushed.
    pub async fn disconnect(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

enum Served {
    Shutdown,
    Lost(TransportError),
}

struct SessionLoop<C: BrokerConnector> {
    connector: C,
    identity: DeviceIdentity,
    credentials: Credentials,
    config: SessionConfig,
    events: EventBus,
    backoff: Backoff,
    requests: mpsc::UnboundedReceiver<Request>,
    inbound: mpsc::Sender<InboundMessage>,
    status: watch::Sender<SessionStatus>,
    shutdown: watch::Receiver<bool>,
    subscriptions: Vec<(String, QoS)>,
    buffer: VecDeque<Outbound>,
}

impl<C: BrokerConnector> SessionLoop<C> {
    /// Main loop with reconnection logic
    async fn run(mut self, mut link: Option<C::Link>) {
        loop {
            let mut active = match link.take() {
                Some(active) => active,
                None => match self.reconnect().await {
                    Some(active) => active,
                    None => return,
                },
            };

            if let Err(e) = self.establish(&mut active).await {
                warn!("Failed to restore session state: {}", e);
                self.set_state(SessionState::Reconnecting, Some(e.to_string()));
                continue;
            }
            self.set_state(SessionState::Connected, None);

            match self.serve(&mut active).await {
                Served::Shutdown => {
                    active.close().await;
                    self.set_state(SessionState::Disconnected, None);
                    info!("Session of {} closed", self.identity.device_id);
                    return;
                }
                Served::Lost(e) => {
                    warn!("Connection of {} lost: {}", self.identity.device_id, e);
                    self.set_state(SessionState::Reconnecting, Some(e.to_string()));
                }
            }
        }
    }

    /// Re-apply subscriptions and flush the buffer on a fresh link
    async fn establish(&mut self, link: &mut C::Link) -> Result<(), TransportError> {
        for (filter, qos) in &self.subscriptions {
            link.subscribe(filter, *qos).await?;
        }
        if !self.buffer.is_empty() {
            info!("Flushing {} buffered publish(es)", self.buffer.len());
        }
        while let Some(out) = self.buffer.pop_front() {
            if let Err(e) = link.publish(&out.topic, out.payload.clone(), out.qos).await {
                self.buffer.push_front(out);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Handle an active connection until it fails or shutdown is requested
    async fn serve(&mut self, link: &mut C::Link) -> Served {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Served::Shutdown;
                    }
                }

                request = self.requests.recv() => match request {
                    None => return Served::Shutdown,
                    Some(Request::Publish(out)) => {
                        if let Err(e) = link.publish(&out.topic, out.payload.clone(), out.qos).await {
                            self.buffer_publish(out);
                            return Served::Lost(e);
                        }
                    }
                    Some(Request::Subscribe { filter, qos }) => {
                        let result = link.subscribe(&filter, qos).await;
                        self.remember(filter, qos);
                        if let Err(e) = result {
                            return Served::Lost(e);
                        }
                    }
                },

                inbound = link.recv() => match inbound {
                    Ok(message) => {
                        if self.inbound.send(message).await.is_err() {
                            debug!("Inbound receiver dropped, discarding message");
                        }
                    }
                    Err(e) => return Served::Lost(e),
                },
            }
        }
    }

    /// Back off and retry until connected. Returns `None` on shutdown or on
    /// a fatal authentication failure.
    async fn reconnect(&mut self) -> Option<C::Link> {
        loop {
            let delay = self.backoff.next_delay();
            debug!(
                "Reconnecting {} in {:?} (attempt {})",
                self.identity.device_id,
                delay,
                self.backoff.attempt()
            );
            if !self.wait(delay).await {
                self.set_state(SessionState::Disconnected, None);
                return None;
            }

            let attempt = timeout(
                self.config.connect_timeout,
                self.connector.connect(&self.identity, &self.credentials),
            )
            .await;
            match attempt {
                Ok(Ok(link)) => {
                    self.backoff.reset();
                    info!("Reconnected {}", self.identity.device_id);
                    return Some(link);
                }
                Ok(Err(ConnectError::AuthFailed(reason))) => {
                    error!(
                        "Authentication refused for {} while reconnecting: {}",
                        self.identity.device_id, reason
                    );
                    self.set_state(
                        SessionState::Disconnected,
                        Some(ConnectError::AuthFailed(reason).to_string()),
                    );
                    return None;
                }
                Ok(Err(e)) => {
                    warn!("Reconnect failed: {}", e);
                    self.record_error(e.to_string());
                }
                Err(_) => {
                    warn!("Reconnect timed out");
                    self.record_error(ConnectError::Timeout.to_string());
                }
            }
        }
    }

    /// Sleep while still accepting requests. Returns false on shutdown.
    async fn wait(&mut self, delay: Duration) -> bool {
        let deadline = sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return true,

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return false;
                    }
                }

                request = self.requests.recv() => match request {
                    None => return false,
                    Some(Request::Publish(out)) => self.buffer_publish(out),
                    Some(Request::Subscribe { filter, qos }) => self.remember(filter, qos),
                },
            }
        }
    }

    fn remember(&mut self, filter: String, qos: QoS) {
        match self.subscriptions.iter_mut().find(|(f, _)| *f == filter) {
            Some(existing) => existing.1 = qos,
            None => self.subscriptions.push((filter, qos)),
        }
    }

    /// Buffer a publish issued while disconnected. At-most-once publishes are
    /// not buffered.
    fn buffer_publish(&mut self, out: Outbound) {
        if out.qos == QoS::AtMostOnce {
            debug!("Discarding at-most-once publish on {} while disconnected", out.topic);
            return;
        }
        if self.buffer.len() >= self.config.buffer_capacity {
            if let Some(evicted) = self.buffer.pop_front() {
                warn!("Outbound buffer full, dropping oldest publish on {}", evicted.topic);
                self.events.publish(ChannelEvent::DroppedMessage {
                    topic: evicted.topic,
                });
            }
        }
        self.buffer.push_back(out);
    }

    fn record_error(&mut self, error: String) {
        self.status.send_modify(|status| status.last_error = Some(error));
    }

    fn set_state(&mut self, state: SessionState, error: Option<String>) {
        let mut changed = false;
        self.status.send_modify(|status| {
            changed = status.state != state;
            status.state = state;
            if error.is_some() || state == SessionState::Connected {
                status.last_error = error;
            }
        });
        if changed {
            info!("Session {} is {}", self.identity.device_id, state);
            self.events.publish(ChannelEvent::ConnectionChanged {
                device_id: self.identity.device_id.clone(),
                state,
            });
        }
    }
}
