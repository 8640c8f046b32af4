use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use drone_agent::agent::{AgentSettings, DroneAgent};
use drone_agent::command::SimulatedActuator;
use drone_agent::sensors::SimulatedSensors;
use dronesec_shared::config::Config;
use dronesec_shared::events::{ChannelEvent, EventBus, EventKind};
use dronesec_shared::session::mqtt::MqttConnector;
use dronesec_shared::session::{Credentials, FingerprintPolicy, Session, SessionConfig};
use tokio::sync::{mpsc, watch};

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref().map(Path::new)).context("loading configuration")?;
    let settings = AgentSettings::from_config(&config)?;
    let telemetry_interval = Duration::from_millis(config.drone()?.telemetry_interval_ms);

    info!("Drone agent starting: {}", settings.device_id);
    info!("  Broker: {}:{}", config.broker.host, config.broker.port);

    let credentials = Credentials::load(&config.tls).context("loading TLS credentials")?;
    let events = audit_bus();

    let (session, inbound) = Session::connect(
        MqttConnector::from_config(&config.broker),
        config.identity.to_identity(),
        credentials,
        &FingerprintPolicy,
        SessionConfig::from_config(&config),
        events.clone(),
    )
    .await
    .context("establishing broker session")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Sensor sampling
    let (readings_tx, readings_rx) = mpsc::channel(32);
    let sensors = SimulatedSensors::new(settings.thresholds.clone());
    tokio::spawn(sensors.run(telemetry_interval, readings_tx, shutdown_rx.clone()));

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        let _ = shutdown_tx.send(true);
    });

    let agent = DroneAgent::new(settings, session, events, Arc::new(SimulatedActuator::default()));
    agent.run(inbound, readings_rx, shutdown_rx).await?;

    info!("Drone agent stopped");
    Ok(())
}

/// Event bus with the audit log subscribers attached
fn audit_bus() -> EventBus {
    let events = EventBus::new();
    events.subscribe(EventKind::CommandHandled, |event| {
        if let ChannelEvent::CommandHandled {
            command_id,
            command_type,
            outcome,
            detail,
        } = event
        {
            info!("[AUDIT] {} {} -> {} ({})", command_type, command_id, outcome, detail);
        }
    });
    events.subscribe(EventKind::ConnectionChanged, |event| {
        if let ChannelEvent::ConnectionChanged { device_id, state } = event {
            info!("[AUDIT] {} session {}", device_id, state);
        }
    });
    events.subscribe(EventKind::DroppedMessage, |event| {
        if let ChannelEvent::DroppedMessage { topic } = event {
            warn!("[AUDIT] Dropped buffered publish on {}", topic);
        }
    });
    events
}
