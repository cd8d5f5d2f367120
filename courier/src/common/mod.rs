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

//! Shared building blocks: errors, configuration, schema registry,
//! topology, publisher, statistics and the in-memory transport.

mod config;
mod errors;
mod memory_broker;
mod publisher;
mod registry;
mod sinks;
mod stats;
mod topology;

pub use config::{
    BrokerConfig, ConsumerDefaults, GatewayConfig, RpcConfig, ShutdownConfig, SupervisorConfig,
};
pub use errors::{
    ConfigError, DecodeError, HandlerError, PublishError, RpcError, SchemaError, SetupError,
    SupervisionError, TransportError,
};
pub use memory_broker::{topic_matches, MemoryBroker, DEFAULT_EXCHANGE};
pub use publisher::{PublishMode, PublishOptions, Publisher};
pub use registry::{SchemaRegistry, SchemaRegistryBuilder, SCHEMA_VERSION_SIZE};
pub use sinks::{
    ChannelDeadLetterSink, ChannelFaultSink, ExchangeDeadLetterSink, TracingDeadLetterSink,
    TracingFaultSink,
};
pub(crate) use stats::bump;
pub use stats::{ConsumerStats, RpcClientStats};
pub use topology::{Address, ExchangeKind, QueueHandle, QueueOptions, Topology};
