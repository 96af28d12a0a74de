//! starbus-tail: print bus traffic for a set of topics
//!
//! Connects to the configured backend over WebSocket, subscribes to the
//! topics given on the command line and logs every message received.
//!
//! ## Usage
//! ```text
//! starbus-tail [--config PATH] [TOPIC ...]
//! ```
//!
//! ## Configuration
//! - `starbus.yaml`, `--config PATH` or `STARBUS_CONFIG`: config file
//! - `STARBUS__ENDPOINT`: backend URL (`ws://` or `wss://`)
//! - `STARBUS_LOG`: log filter (overrides `log_level`)
//!
//! The error topic is always tailed; the process exits when the bus fails
//! or on Ctrl-C.

use tokio::sync::mpsc;
use tracing::{error, info};

use starbus::utils::bootstrap::init_tracing;
use starbus::{BusConfig, Envelope, MessageBus};

const USAGE: &str = "usage: starbus-tail [--config PATH] [TOPIC ...]";

struct Args {
    config_path: Option<String>,
    topics: Vec<String>,
}

/// `Ok(None)` when help was requested.
fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Option<Args>, String> {
    let mut args = args.into_iter();
    let mut config_path = None;
    let mut topics = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = Some(args.next().ok_or("--config requires a path")?);
            }
            "--help" | "-h" => return Ok(None),
            _ => topics.push(arg),
        }
    }

    Ok(Some(Args {
        config_path,
        topics,
    }))
}

fn log_message(envelope: &Envelope) {
    info!(
        topic = %envelope.topic(),
        id = envelope.id().unwrap_or("-"),
        payload = %envelope.payload(),
        "message"
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Some(args) = parse_args(std::env::args().skip(1))? else {
        println!("{}", USAGE);
        return Ok(());
    };
    let config = BusConfig::load(args.config_path.as_deref())?;
    init_tracing(config.log_level);

    let bus = MessageBus::websocket(config)?;

    for topic in &args.topics {
        bus.subscribe(topic.as_str(), |envelope: &Envelope| {
            log_message(envelope);
            Ok(())
        })?;
    }

    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
    bus.subscribe(bus.error_topic(), move |envelope: &Envelope| {
        error!(payload = %envelope.payload(), "Bus reported failure");
        let _ = failed_tx.send(());
        Ok(())
    })?;

    bus.open()?;
    info!(
        endpoint = bus.config().endpoint.as_deref().unwrap_or("-"),
        topics = args.topics.len(),
        "starbus-tail started"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            bus.close();
            Ok(())
        }
        _ = failed_rx.recv() => {
            bus.close();
            Err("message bus failed".into())
        }
    }
}
