//! Middleware pipeline.
//!
//! This module contains:
//! - `Middleware` trait: one inspection/transformation step with explicit
//!   continue/halt control via `Next`
//! - `MiddlewarePipeline`: the ordered chain, with error and panic isolation
//! - `ValidationMiddleware` / `TopicValidator`: per-topic payload checks
//! - `LoggingMiddleware`: traffic logging at debug level
//!
//! A middleware continues the chain by calling `next.run(envelope)` and
//! returning its result. Returning `Flow::Halt` without calling `next`
//! drops the message silently; returning an error drops it and logs why.
//! Either way only the current message is affected.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, error, warn};

use super::envelope::Envelope;
use crate::utils::{panic_message, read, write};

/// Which way a message is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Decoded from the connection, heading for subscribers.
    Inbound,
    /// Published locally, heading for the connection.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Result of running a chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Every step called `next`; this is the (possibly replaced) envelope.
    Continue(Envelope),
    /// Some step chose not to call `next`.
    Halt,
}

/// Errors raised inside middleware. All of them drop the current message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MiddlewareError {
    #[error("Validation failed for topic '{topic}': {reason}")]
    Validation { topic: String, reason: String },

    #[error("Middleware '{name}' failed: {message}")]
    Failed { name: String, message: String },

    #[error("Middleware '{name}' panicked: {message}")]
    Panicked { name: String, message: String },
}

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    direction: Direction,
}

impl<'a> Next<'a> {
    /// Hand the envelope to the remaining middlewares.
    pub fn run(self, envelope: Envelope) -> Result<Flow, MiddlewareError> {
        match self.chain.split_first() {
            Some((current, rest)) => {
                let direction = self.direction;
                let next = Next {
                    chain: rest,
                    direction,
                };
                // A panic further down is already converted by the inner call
                catch_unwind(AssertUnwindSafe(|| current.handle(envelope, direction, next)))
                    .unwrap_or_else(|panic| {
                        Err(MiddlewareError::Panicked {
                            name: current.name().to_string(),
                            message: panic_message(panic.as_ref()),
                        })
                    })
            }
            None => Ok(Flow::Continue(envelope)),
        }
    }
}

/// One step in the pipeline.
pub trait Middleware: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Whether this middleware runs for `direction`. Inbound only by default.
    fn applies_to(&self, direction: Direction) -> bool {
        direction == Direction::Inbound
    }

    fn handle(
        &self,
        envelope: Envelope,
        direction: Direction,
        next: Next<'_>,
    ) -> Result<Flow, MiddlewareError>;
}

/// What the pipeline decided for one message.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Pass this envelope on.
    Deliver(Envelope),
    /// A middleware halted the chain.
    Halted,
    /// A middleware failed or panicked; the message is dropped.
    Rejected(MiddlewareError),
}

/// Ordered chain of middlewares, applied in registration order.
#[derive(Default)]
pub struct MiddlewarePipeline {
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware. It sees every message processed after this call.
    pub fn push(&self, middleware: Arc<dyn Middleware>) {
        debug!(middleware = %middleware.name(), "Middleware registered");
        write(&self.middlewares).push(middleware);
    }

    pub fn len(&self) -> usize {
        read(&self.middlewares).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.middlewares).is_empty()
    }

    /// Run one message through every middleware that applies to `direction`.
    ///
    /// Never fails: errors and panics are logged and reported as `Rejected`.
    pub fn process(&self, envelope: Envelope, direction: Direction) -> PipelineOutcome {
        // Snapshot so middlewares may register more middleware without deadlock
        let chain: Vec<Arc<dyn Middleware>> = read(&self.middlewares)
            .iter()
            .filter(|m| m.applies_to(direction))
            .cloned()
            .collect();

        if chain.is_empty() {
            return PipelineOutcome::Deliver(envelope);
        }

        let topic = envelope.topic().to_string();
        let next = Next {
            chain: &chain,
            direction,
        };

        match next.run(envelope) {
            Ok(Flow::Continue(envelope)) => PipelineOutcome::Deliver(envelope),
            Ok(Flow::Halt) => {
                debug!(topic = %topic, direction = %direction, "Message halted by middleware");
                PipelineOutcome::Halted
            }
            Err(e @ MiddlewareError::Validation { .. }) => {
                warn!(topic = %topic, direction = %direction, error = %e, "Message rejected");
                PipelineOutcome::Rejected(e)
            }
            Err(e) => {
                error!(topic = %topic, direction = %direction, error = %e, "Middleware failed");
                PipelineOutcome::Rejected(e)
            }
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Payload schema check for one topic.
///
/// Device schemas live with the device code; the bus only calls them.
pub trait TopicValidator: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<(), String>;
}

impl<F> TopicValidator for F
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, payload: &Value) -> Result<(), String> {
        (self)(payload)
    }
}

/// Applies the validator registered for each message's topic.
///
/// Topics without a validator pass unchecked.
#[derive(Default)]
pub struct ValidationMiddleware {
    validators: HashMap<String, Arc<dyn TopicValidator>>,
    outbound: bool,
}

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the validator for `topic`.
    pub fn with_validator(
        mut self,
        topic: impl Into<String>,
        validator: impl TopicValidator + 'static,
    ) -> Self {
        self.validators.insert(topic.into(), Arc::new(validator));
        self
    }

    /// Also validate outbound messages before they are sent.
    pub fn validate_outbound(mut self, enabled: bool) -> Self {
        self.outbound = enabled;
        self
    }
}

impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    fn applies_to(&self, direction: Direction) -> bool {
        direction == Direction::Inbound || self.outbound
    }

    fn handle(
        &self,
        envelope: Envelope,
        _direction: Direction,
        next: Next<'_>,
    ) -> Result<Flow, MiddlewareError> {
        if let Some(validator) = self.validators.get(envelope.topic()) {
            validator
                .validate(envelope.payload())
                .map_err(|reason| MiddlewareError::Validation {
                    topic: envelope.topic().to_string(),
                    reason,
                })?;
        }
        next.run(envelope)
    }
}

/// Validator requiring a JSON object with the named keys.
#[derive(Debug, Clone)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl TopicValidator for RequiredFields {
    fn validate(&self, payload: &Value) -> Result<(), String> {
        let object = payload
            .as_object()
            .ok_or_else(|| "payload is not an object".to_string())?;

        match self.fields.iter().find(|field| !object.contains_key(field.as_str())) {
            Some(missing) => Err(format!("missing field '{}'", missing)),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Logs every message in both directions at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn applies_to(&self, _direction: Direction) -> bool {
        true
    }

    fn handle(
        &self,
        envelope: Envelope,
        direction: Direction,
        next: Next<'_>,
    ) -> Result<Flow, MiddlewareError> {
        debug!(
            direction = %direction,
            topic = %envelope.topic(),
            id = envelope.id().unwrap_or("-"),
            "Message"
        );
        next.run(envelope)
    }
}
