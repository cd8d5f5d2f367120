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
#![allow(unused)]

use std::sync::Arc;

use courier::prelude::*;

/// Exchange the batch commands are published on.
pub const COMMANDS_EXCHANGE: &str = "acme:batches:commands";
/// Exchange the batch queries are published on.
pub const QUERIES_EXCHANGE: &str = "acme:batches:queries";

#[courier_message("commands.CreateBatch")]
pub struct CreateBatch {
    pub uuid: String,
}

#[courier_message("events.BatchClosed", version = 2)]
pub struct BatchClosed {
    pub uuid: String,
    pub items: u32,
}

#[courier_message("queries.BatchesRequest")]
pub struct BatchesRequest {
    pub owner: String,
}

#[courier_message("queries.Batches")]
pub struct Batches {
    pub batches: Vec<String>,
}

/// A type the test registry never learns about.
#[courier_message("commands.Unregistered")]
pub struct Unregistered {
    pub note: String,
}

/// Registry with every fixture except [`Unregistered`].
pub fn registry() -> anyhow::Result<SchemaRegistry> {
    Ok(SchemaRegistry::builder()
        .register::<CreateBatch>()?
        .register::<BatchClosed>()?
        .register::<BatchesRequest>()?
        .register::<Batches>()?
        .build())
}

/// A fresh broker, both as itself and as the transport seam.
pub fn broker() -> (Arc<MemoryBroker>, Arc<dyn Transport>) {
    let broker = Arc::new(MemoryBroker::new());
    let transport: Arc<dyn Transport> = broker.clone();
    (broker, transport)
}

/// Durable worker queue on the commands exchange, bound to the given types.
pub fn commands_topology(worker: &str, routing_keys: &[&str]) -> anyhow::Result<Topology> {
    Ok(Topology {
        exchange: COMMANDS_EXCHANGE.parse()?,
        exchange_kind: ExchangeKind::Direct,
        queue: Address::new("acme", "batches", worker)?,
        queue_options: QueueOptions::durable(),
        routing_keys: routing_keys.iter().map(|key| (*key).to_string()).collect(),
    })
}

/// The RPC server queue for batch queries.
pub fn queries_topology() -> anyhow::Result<Topology> {
    Ok(Topology {
        exchange: QUERIES_EXCHANGE.parse()?,
        exchange_kind: ExchangeKind::Direct,
        queue: Address::new("acme", "batches", "query-server")?,
        queue_options: QueueOptions::durable(),
        routing_keys: vec![BatchesRequest::TYPE.to_string()],
    })
}
