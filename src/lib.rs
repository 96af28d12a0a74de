//! Starbus - reconnecting publish/subscribe message bus
//!
//! One long-lived duplex connection to a backend, multiplexed into named
//! topics. Device stores publish without caring whether the link is up;
//! subscribers receive validated, decoded envelopes per topic.
//!
//! ```ignore
//! use starbus::{BusConfig, MessageBus, MemoryConnector};
//!
//! let bus = MessageBus::new(BusConfig::default(), MemoryConnector::new());
//! bus.subscribe("filterwheel/status", |envelope| {
//!     println!("{}", envelope.payload());
//!     Ok(())
//! })?;
//! bus.open()?;
//! bus.publish("filterwheel/select", &serde_json::json!({"slot": 3}))?;
//! ```

pub mod bus;
pub mod config;
pub mod connection;
pub mod utils;

pub use bus::{
    BusError, Envelope, HandlerError, MessageBus, PublishError, PublishOutcome, SubscriptionId,
};
pub use config::{BackpressurePolicy, BusConfig, LogLevel};
pub use connection::{ConnectionState, Connector, MemoryConnector, ReconnectPolicy};
#[cfg(feature = "websocket")]
pub use connection::WebSocketConnector;
