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

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::common::{ExchangeKind, QueueHandle, QueueOptions, TransportError};
use crate::message::{AckToken, RawDelivery};

/// Lazy, unbounded sequence of deliveries from one queue subscription.
///
/// The stream ends or yields an error when the subscription is lost; it is
/// restarted only by subscribing again.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, TransportError>>;

/// Everything the gateway needs from a message broker.
///
/// Implementations own connection management. The gateway never reconnects;
/// it surfaces [`TransportError`] to whoever supervises it.
///
/// Declarations and bindings must be idempotent: every consumer redeclares its
/// topology on startup.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Declares an exchange. Redeclaring with the same kind is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError>;

    /// Declares a queue and returns a handle to it.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueHandle, TransportError>;

    /// Binds a queue to an exchange. Repeating a binding is a no-op.
    async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Publishes bytes to an exchange. Returns once the broker accepted them.
    ///
    /// The empty exchange name addresses the default exchange, which routes
    /// to the queue named by `routing_key`.
    async fn publish(&self, exchange: &str, routing_key: &str, body: Bytes)
        -> Result<(), TransportError>;

    /// Starts consuming a queue.
    async fn consume(&self, queue: &QueueHandle) -> Result<DeliveryStream, TransportError>;

    /// Acknowledges a delivery, removing it from the queue.
    async fn ack(&self, token: AckToken) -> Result<(), TransportError>;

    /// Rejects a delivery, optionally returning it to the queue.
    async fn nack(&self, token: AckToken, requeue: bool) -> Result<(), TransportError>;
}
