/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Error types for every layer of the gateway.
//!
//! The taxonomy mirrors how each failure is resolved: schema errors are caller
//! bugs and never reach the broker, decode errors are acked off the queue,
//! transport errors terminate the subscription that hit them, and RPC errors
//! keep the three caller-visible outcomes (success, remote error, timeout)
//! apart.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::message::ErrorReply;
use crate::supervision::TerminationReason;

/// Failure to encode a value against the schema registry.
///
/// Raised synchronously at publish time; nothing is sent when this occurs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// The type tag has no registered schema.
    #[error("unregistered message type: {0}")]
    UnregisteredType(String),

    /// The same type tag was registered twice while building a registry.
    #[error("message type registered twice: {0}")]
    DuplicateType(String),

    /// The value handed to the registry is not the shape registered for the tag.
    #[error("value does not match the registered shape of {type_name} (expected {expected})")]
    ShapeMismatch {
        /// The type tag the value was encoded under.
        type_name: String,
        /// Rust type registered for the tag.
        expected: &'static str,
    },

    /// The serializer rejected the value.
    #[error("failed to encode {type_name}: {reason}")]
    Encode {
        /// The type tag being encoded.
        type_name: String,
        /// Underlying serializer message.
        reason: String,
    },
}

/// Failure to turn received bytes into a typed value.
///
/// Decoding fails closed: a frame is either decoded completely against the
/// schema this process knows, or rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The envelope frame could not be parsed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The frame was written with a protocol version this process does not speak.
    #[error("unsupported protocol version: {found:#04x}, expected {expected:#04x}")]
    UnsupportedProtocol {
        /// Version byte found on the wire.
        found: u8,
        /// Version this process speaks.
        expected: u8,
    },

    /// The frame names a serialization format this process does not know.
    #[error("unknown serialization format: {0:#04x}")]
    UnknownFormat(u8),

    /// The envelope's type tag has no registered schema at this receiver.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The sender used a different schema version than the one registered here.
    #[error("schema version mismatch for {type_name}: registered v{expected}, received v{found}")]
    VersionMismatch {
        /// The type tag.
        type_name: String,
        /// Version registered at this receiver.
        expected: u16,
        /// Version found in the payload.
        found: u16,
    },

    /// The payload body did not deserialize into the registered shape.
    #[error("invalid payload for {type_name}: {reason}")]
    Payload {
        /// The type tag.
        type_name: String,
        /// Underlying deserializer message.
        reason: String,
    },

    /// The decoded value was requested as a different Rust type than registered.
    #[error("{type_name} is registered as {registered}, not {requested}")]
    TypeMismatch {
        /// The type tag.
        type_name: String,
        /// Rust type registered for the tag.
        registered: &'static str,
        /// Rust type the caller asked for.
        requested: &'static str,
    },
}

/// Broker connection or channel failure.
///
/// The gateway never reconnects on its own; these errors end the affected
/// subscription and surface to whatever supervises it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The broker connection or channel is gone.
    #[error("transport connection closed")]
    ConnectionClosed,

    /// Publishing or binding against an exchange that was never declared.
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Consuming or binding a queue that was never declared (or was auto-deleted).
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// An exchange was redeclared with a different kind.
    #[error("exchange {name} already declared as {existing}, not {requested}")]
    ExchangeKindConflict {
        /// Exchange name.
        name: String,
        /// Kind it was first declared with.
        existing: String,
        /// Kind requested now.
        requested: String,
    },

    /// An exclusive queue is already being consumed.
    #[error("queue {0} is exclusive and already has a consumer")]
    ExclusiveQueueInUse(String),

    /// An ack/nack referenced a delivery the transport does not know.
    #[error("unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    /// Any other broker-side failure.
    #[error("transport failure: {0}")]
    Other(String),
}

/// Failure of a publish call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The value failed schema encoding; nothing was sent.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The transport refused the publish.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure while configuring a consumer, RPC server or RPC client.
///
/// Setup errors are raised before any message flows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    /// A second handler was registered for the same type on one consumer.
    #[error("a handler for {0} is already registered on this consumer")]
    DuplicateHandler(String),

    /// A handler (or its reply) names a type the schema registry does not know.
    #[error("cannot register a handler for unregistered type {0}")]
    UnregisteredType(String),

    /// A handler's type tag is registered for a different Rust type.
    #[error("{type_name} is registered as {registered}, not {requested}")]
    TypeMismatch {
        /// The type tag.
        type_name: String,
        /// Rust type registered for the tag.
        registered: &'static str,
        /// Rust type the handler accepts or returns.
        requested: &'static str,
    },

    /// No redelivery limit was configured for a consumer.
    #[error("consumer for queue {0} needs an explicit max_redeliveries")]
    MissingRedeliveryLimit(String),

    /// A queue or exchange address does not follow `<namespace>:<domain>:<kind>`.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The consumer was started without any handlers.
    #[error("consumer for queue {0} has no handlers registered")]
    NoHandlers(String),

    /// Declaring or binding topology failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Application failure returned by a message handler.
///
/// Wraps any error convertible into [`anyhow::Error`] so handlers can use `?`
/// freely, plus an optional machine-readable code that error adapters may
/// forward to RPC callers.
pub struct HandlerError {
    code: Option<String>,
    source: anyhow::Error,
}

impl HandlerError {
    /// Creates a handler error from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self {
            code: None,
            source: anyhow::Error::msg(message),
        }
    }

    /// Attaches a machine-readable error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// The error code, if one was attached.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// The underlying error.
    #[must_use]
    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }
}

impl<E> From<E> for HandlerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            code: None,
            source: err.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {:#}", self.source),
            None => write!(f, "{:#}", self.source),
        }
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("code", &self.code)
            .field("source", &self.source)
            .finish()
    }
}

/// Outcome of an RPC call other than a decoded success value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// No reply arrived before the deadline.
    #[error("rpc {correlation_id} timed out after {timeout:?}")]
    Timeout {
        /// Correlation id of the abandoned request.
        correlation_id: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The server identified a failure and replied with an error.
    #[error("remote error {}: {}", .0.error_code, .0.error_message)]
    Remote(ErrorReply),

    /// The request could not be published.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// A reply arrived but its payload could not be decoded.
    #[error("failed to decode reply: {0}")]
    Decode(#[from] DecodeError),

    /// A reply arrived with a type other than the one the caller expects.
    #[error("expected a {expected} reply, received {found}")]
    UnexpectedReply {
        /// The response type the caller asked for.
        expected: &'static str,
        /// The type tag on the received reply.
        found: String,
    },

    /// The client's reply subscription has terminated.
    #[error("rpc client reply subscription is closed")]
    Closed,
}

impl RpcError {
    /// Returns `true` if the call ended without any reply.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns the structured error reply, if the server sent one.
    #[must_use]
    pub const fn as_remote(&self) -> Option<&ErrorReply> {
        match self {
            Self::Remote(reply) => Some(reply),
            _ => None,
        }
    }
}

/// A supervised subscription could not be kept running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisionError {
    /// The subscription kept ending faster than the restart window allows.
    #[error("{name}: restart limit exceeded ({attempts} restarts, max {max_restarts} in {window_secs}s); last exit {last}")]
    RestartLimitExceeded {
        /// Name of the supervised subscription.
        name: String,
        /// Restarts inside the window.
        attempts: usize,
        /// Configured limit.
        max_restarts: u32,
        /// Configured window in seconds.
        window_secs: u64,
        /// How the subscription ended the final time.
        last: TerminationReason,
    },

    /// The subscription ended abnormally and its policy forbids a restart.
    #[error("{name} terminated: {reason}")]
    Terminated {
        /// Name of the supervised subscription.
        name: String,
        /// How it ended.
        reason: TerminationReason,
    },
}

/// Failure while loading gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`GatewayConfig`](crate::common::GatewayConfig).
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
