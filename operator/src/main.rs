mod command;
mod console;
mod session;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use command::{CommandDispatcher, TimeoutTracker};
use console::Console;
use dronesec_shared::config::Config;
use dronesec_shared::events::{ChannelEvent, EventBus, EventKind};
use dronesec_shared::session::mqtt::MqttConnector;
use dronesec_shared::session::{Credentials, FingerprintPolicy, Session, SessionConfig};
use dronesec_shared::{now_ms, CommandType, SecurityState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use tracing::{debug, error, info, warn};
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
    let operator = config.operator()?.clone();

    info!("Operator console starting: {}", config.identity.device_id);
    info!("  Paired drone: {}", operator.drone_id);
    info!("  Broker: {}:{}", config.broker.host, config.broker.port);

    let credentials = Credentials::load(&config.tls).context("loading TLS credentials")?;
    let events = dashboard_bus();

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
    let session = Arc::new(session);

    let dispatcher = Arc::new(CommandDispatcher::new(
        session.clone(),
        operator.drone_id.clone(),
        config.retry.policy(),
        events.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn retry ticker
    let tracker = TimeoutTracker::new(dispatcher.clone(), Duration::from_millis(config.retry.tick_ms));
    let tracker = tokio::spawn(tracker.run(shutdown_rx.clone()));

    // Spawn reader loop
    let console = Console::new(
        session.clone(),
        dispatcher.clone(),
        events,
        operator.drone_id.clone(),
        Duration::from_millis(operator.liveness_timeout_ms),
    );
    let state = console.watch_state();
    let reader = tokio::spawn(console.run(inbound, shutdown_rx));

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(line.trim(), &dispatcher, &session, &state).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = tracker.await {
        warn!("Retry ticker ended abnormally: {}", e);
    }
    match reader.await {
        Ok(result) => result?,
        Err(e) => warn!("Reader loop ended abnormally: {}", e),
    }
    drop(dispatcher);
    if let Ok(session) = Arc::try_unwrap(session) {
        session.disconnect().await;
    }

    info!("Operator console stopped");
    Ok(())
}

/// Handle one console line. Returns false to quit.
async fn handle_line(
    line: &str,
    dispatcher: &CommandDispatcher,
    session: &Session,
    state: &watch::Receiver<SecurityState>,
) -> bool {
    match line {
        "" => {}
        "quit" | "exit" => return false,
        "help" => print_help(),
        "status" => {
            let mirrored = state.borrow().clone();
            println!(
                "drone={} alert={} seq={} session={} pending={}",
                mirrored.mode,
                mirrored.active_alert_id.as_deref().unwrap_or("-"),
                mirrored.seq,
                session.state(),
                dispatcher.pending_count().await
            );
        }
        other => match other.parse::<CommandType>() {
            Ok(command_type) => {
                if let Err(e) = dispatcher.issue(command_type, Vec::new(), now_ms()).await {
                    error!("Failed to issue {}: {}", command_type, e);
                }
            }
            Err(e) => println!("{e}, type 'help' for the command list"),
        },
    }
    true
}

fn print_help() {
    println!("Commands: ack | abort | land | resume | halt | proceed | status | quit");
}

/// Event bus with the dashboard and audit log subscribers attached
fn dashboard_bus() -> EventBus {
    let events = EventBus::new();
    events.subscribe(EventKind::StateChanged, |event| {
        if let ChannelEvent::StateChanged {
            device_id,
            previous,
            state,
        } = event
        {
            println!("[STATE] {}: {} -> {}", device_id, previous, state.mode);
        }
    });
    events.subscribe(EventKind::Telemetry, |event| {
        if let ChannelEvent::Telemetry(sample) = event {
            debug!("[TELEMETRY] {} {} {:?}", sample.device_id, sample.mode, sample.readings);
        }
    });
    events.subscribe(EventKind::CommandResolved, |event| {
        if let ChannelEvent::CommandResolved {
            command_id,
            command_type,
            outcome,
            detail,
        } = event
        {
            println!("[ACK] {} {} -> {} ({})", command_type, command_id, outcome, detail);
        }
    });
    events.subscribe(EventKind::DeliveryFailed, |event| {
        if let ChannelEvent::DeliveryFailed {
            command_id,
            command_type,
            attempts,
        } = event
        {
            println!("[FAILED] {} {}: no ack after {} attempts", command_type, command_id, attempts);
        }
    });
    events.subscribe(EventKind::ConnectionChanged, |event| {
        if let ChannelEvent::ConnectionChanged { device_id, state } = event {
            info!("[AUDIT] {} session {}", device_id, state);
        }
    });
    events
}
