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

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::common::{
    ConsumerStats, HandlerError, Publisher, SchemaRegistry, SetupError, TransportError,
    DEFAULT_EXCHANGE,
};
use crate::consumer::{Consumer, ConsumerConfig, ConsumerHandle, Replier};
use crate::message::{DefaultErrorAdapter, MessageContext};
use crate::traits::{DeadLetterSink, ErrorAdapter, FaultSink, Message, Transport};

/// A consumer that answers requests.
///
/// Every request that reaches a handler gets exactly one reply on its
/// `reply_to` queue, with the request's correlation id and context:
///
/// * the handler's value when it succeeds;
/// * an [`ErrorReply`](crate::message::ErrorReply) built by the
///   [`ErrorAdapter`] once the request has failed on every permitted
///   delivery. Requeued attempts do not reply.
///
/// Requests that cannot be decoded, or that have no handler, still get a
/// best-effort error reply when their envelope names a `reply_to`. A handler
/// registered through [`into_consumer`](Self::into_consumer) that returns `()`
/// answers with [`ErrorReply::NO_REPLY`](crate::message::ErrorReply::NO_REPLY).
///
/// ```rust,ignore
/// let server = RpcServer::new(transport, registry, ConsumerConfig::new(topology, 0))
///     .handle(|_: BatchesRequest, _ctx| async move {
///         Ok(Batches { batches: store.list().await? })
///     })?;
/// let handle = server.start().await?;
/// ```
#[derive(Debug, Clone)]
pub struct RpcServer {
    consumer: Consumer,
    publisher: Publisher,
    adapter: Arc<dyn ErrorAdapter>,
}

impl RpcServer {
    /// Creates a server with no handlers, using [`DefaultErrorAdapter`].
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: SchemaRegistry,
        config: ConsumerConfig,
    ) -> Self {
        let publisher = Publisher::new(Arc::clone(&transport), registry.clone(), DEFAULT_EXCHANGE);
        Self {
            consumer: Consumer::new(transport, registry, config),
            publisher,
            adapter: Arc::new(DefaultErrorAdapter),
        }
    }

    /// Registers the handler for requests of type `Req`.
    ///
    /// # Errors
    ///
    /// Same as [`Consumer::handle`].
    pub fn handle<Req, Resp, F, Fut>(mut self, handler: F) -> Result<Self, SetupError>
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        self.consumer = self.consumer.handle(handler)?;
        Ok(self)
    }

    /// Maps handler failures onto error replies with `adapter`.
    #[must_use]
    pub fn with_error_adapter(mut self, adapter: Arc<dyn ErrorAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    /// Sends dead-lettered requests to `sink`.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.consumer = self.consumer.with_dead_letter_sink(sink);
        self
    }

    /// Sends decode and dispatch faults to `sink`.
    #[must_use]
    pub fn with_fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.consumer = self.consumer.with_fault_sink(sink);
        self
    }

    /// Server counters, including replies sent.
    #[must_use]
    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.consumer.stats()
    }

    /// The underlying consumer, with replies enabled.
    #[must_use]
    pub fn into_consumer(self) -> Consumer {
        self.consumer
            .with_replier(Replier::new(self.publisher, self.adapter))
    }

    /// Declares the topology and starts serving.
    ///
    /// # Errors
    ///
    /// Same as [`Consumer::start`].
    pub async fn start(self) -> Result<ConsumerHandle, SetupError> {
        self.into_consumer().start().await
    }

    /// Serves on the current task until `cancel` fires or the transport fails.
    ///
    /// # Errors
    ///
    /// The [`TransportError`] that ended the subscription.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), TransportError> {
        self.into_consumer().run(cancel).await
    }
}
