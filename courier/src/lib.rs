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

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Courier
//!
//! A typed messaging gateway for applications talking through a message
//! broker. It covers fire-and-forget events and request/reply RPC over
//! exchanges and queues, with schema-checked payloads.
//!
//! ## Key Concepts
//!
//! - **Envelope (`Envelope`)**: type tag, optional correlation id and reply
//!   address, ordered context, and a versioned payload; framed on the wire by
//!   `Frame`.
//! - **Schema registry (`SchemaRegistry`)**: the immutable table of message
//!   types, built at startup. Encoding fails fast and decoding fails closed.
//! - **Transport (`Transport`)**: the broker contract. `MemoryBroker`
//!   implements it in-process.
//! - **Publisher (`Publisher`)**: encodes and sends events and requests.
//! - **Consumer (`Consumer`)**: one queue subscription with one handler per
//!   type. Each delivery gets exactly one ack or nack, with a bounded number
//!   of redeliveries before dead-lettering.
//! - **RPC (`RpcServer`, `RpcClient`)**: a consumer that always answers, and
//!   a caller that waits on a private reply queue with a per-call deadline.
//! - **Supervision (`Supervisor`)**: optional restart policy around
//!   subscription loops.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use courier::prelude::*;
//!
//! #[courier_message("commands.CreateBatch")]
//! struct CreateBatch {
//!     uuid: String,
//! }
//!
//! let registry = SchemaRegistry::builder().register::<CreateBatch>()?.build();
//! let broker: Arc<dyn Transport> = Arc::new(MemoryBroker::new());
//! let publisher = Publisher::new(broker, registry, "acme:batches:commands");
//! publisher.emit(&CreateBatch { uuid: "u1".into() }).await?;
//! ```

extern crate self as courier;

/// Errors, configuration, registry, topology, publisher and in-memory transport.
pub(crate) mod common;

/// Queue subscriptions.
pub(crate) mod consumer;

/// Envelopes, frames and delivery records.
pub(crate) mod message;

/// Request/reply.
pub(crate) mod rpc;

/// Restart supervision.
pub(crate) mod supervision;

/// Traits at the gateway's seams.
pub(crate) mod traits;

pub use common::{
    topic_matches, Address, BrokerConfig, ChannelDeadLetterSink, ChannelFaultSink, ConfigError,
    ConsumerDefaults, ConsumerStats, DecodeError, ExchangeDeadLetterSink, ExchangeKind,
    GatewayConfig, HandlerError, MemoryBroker, PublishError, PublishMode, PublishOptions,
    Publisher, QueueHandle, QueueOptions, RpcClientStats, RpcConfig, RpcError, SchemaError,
    SchemaRegistry, SchemaRegistryBuilder, SetupError, ShutdownConfig, SupervisionError,
    SupervisorConfig, Topology, TracingDeadLetterSink, TracingFaultSink, TransportError,
    DEFAULT_EXCHANGE, SCHEMA_VERSION_SIZE,
};
pub use consumer::{Consumer, ConsumerConfig, ConsumerHandle, ConsumerState};
pub use courier_macro::courier_message;
pub use message::{
    AckToken, DeadLetter, DefaultErrorAdapter, DeliveryFault, Envelope, ErrorReply, FaultKind,
    Format, Frame, FrameKind, MessageContext, MessageContextMap, RawDelivery, HEADER_SIZE,
    PROTOCOL_VERSION,
};
pub use rpc::{RpcClient, RpcServer};
pub use supervision::{
    RestartLimitExceeded, RestartLimiter, RestartLimiterConfig, RestartPolicy, RestartStats,
    SupervisionReport, Supervisor, TerminationReason,
};
pub use traits::{
    DeadLetterSink, DeliveryStream, ErrorAdapter, FaultSink, IntoReply, Message, ReplyValue,
    Transport,
};

/// A prelude module for conveniently importing the most commonly used items.
///
/// Re-exports the message attribute, the components, the seam traits, and
/// `async_trait` for implementing them.
pub mod prelude {
    pub use async_trait::async_trait;
    pub use courier_macro::courier_message;

    pub use crate::{
        Address, ChannelDeadLetterSink, ChannelFaultSink, Consumer, ConsumerConfig,
        ConsumerHandle, ConsumerState, DeadLetterSink, DecodeError, Envelope, ErrorAdapter,
        ErrorReply, ExchangeKind, FaultSink, Format, GatewayConfig, HandlerError, MemoryBroker,
        Message, MessageContext, PublishError, PublishOptions, Publisher, QueueOptions,
        RestartPolicy, RpcClient, RpcError, RpcServer, SchemaError, SchemaRegistry, SetupError,
        Supervisor, Topology, Transport, TransportError,
    };
}
