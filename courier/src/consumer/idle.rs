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

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use static_assertions::assert_impl_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::attempts::AttemptTracker;
use super::dispatch::{Dispatcher, ErasedHandler, HandlerFuture, Replier};
use super::started::{receive_concurrent, receive_serial, ConsumerHandle};
use super::state::{ConsumerState, StateCell};
use super::ConsumerConfig;
use crate::common::{
    ConsumerStats, HandlerError, SchemaRegistry, SetupError, TracingDeadLetterSink,
    TracingFaultSink, TransportError,
};
use crate::message::MessageContext;
use crate::traits::{DeadLetterSink, DeliveryStream, FaultSink, IntoReply, Message, Transport};

/// A queue subscription dispatching messages to typed handlers.
///
/// Handlers are registered per type tag before the consumer starts; a second
/// handler for the same tag is a [`SetupError`]. Each delivery is decoded
/// against the [`SchemaRegistry`], handed to exactly one handler, and then
/// settled exactly once:
///
/// * handler success: ack;
/// * decode failure or no handler: ack and report to the [`FaultSink`];
/// * handler failure: nack with requeue while the message has been
///   redelivered fewer than `max_redeliveries` times, otherwise ack and hand
///   it to the [`DeadLetterSink`].
///
/// Dispatch is serialized unless [`ConsumerConfig::concurrency`] allows more.
///
/// ```rust,ignore
/// let consumer = Consumer::new(transport, registry, ConsumerConfig::new(topology, 2))
///     .handle(|cmd: CreateBatch, _ctx| async move {
///         store.create(&cmd.uuid).await?;
///         Ok(())
///     })?;
/// let handle = consumer.start().await?;
/// ```
///
/// Cloning a consumer clones its definition, not a running subscription;
/// supervisors use this to resubscribe.
#[derive(Clone)]
pub struct Consumer {
    transport: Arc<dyn Transport>,
    registry: SchemaRegistry,
    config: ConsumerConfig,
    handlers: HashMap<String, ErasedHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    faults: Arc<dyn FaultSink>,
    replier: Option<Replier>,
    stats: Arc<ConsumerStats>,
}

assert_impl_all!(Consumer: Send, Sync, Clone);

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.config.topology.queue.to_string())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("max_redeliveries", &self.config.max_redeliveries)
            .field("concurrency", &self.config.concurrency)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    /// Creates a consumer with no handlers, logging dead letters and faults.
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: SchemaRegistry,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            config,
            handlers: HashMap::new(),
            dead_letters: Arc::new(TracingDeadLetterSink),
            faults: Arc::new(TracingFaultSink),
            replier: None,
            stats: Arc::new(ConsumerStats::new()),
        }
    }

    /// Registers the handler for `M`.
    ///
    /// # Errors
    ///
    /// * [`SetupError::DuplicateHandler`] if `M::TYPE` already has a handler here.
    /// * [`SetupError::UnregisteredType`] if `M` (or the reply type) is not in the registry.
    /// * [`SetupError::TypeMismatch`] if the tag is registered for another Rust type.
    pub fn handle<M, R, F, Fut>(mut self, handler: F) -> Result<Self, SetupError>
    where
        M: Message,
        R: IntoReply,
        F: Fn(M, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        if self.handlers.contains_key(M::TYPE) {
            return Err(SetupError::DuplicateHandler(M::TYPE.to_string()));
        }
        self.check_registered::<M>()?;
        if let Some(reply) = R::reply_type() {
            if !self.registry.is_registered(reply) {
                return Err(SetupError::UnregisteredType(reply.to_string()));
            }
        }

        let erased: ErasedHandler = Arc::new(
            move |value: Box<dyn Any + Send>, context: MessageContext| -> HandlerFuture {
                match value.downcast::<M>() {
                    Ok(message) => {
                        let fut = handler(*message, context);
                        Box::pin(async move { fut.await.map(IntoReply::into_reply) })
                    }
                    Err(_) => Box::pin(async {
                        Err(HandlerError::msg(format!("decoded value is not a {}", M::TYPE)))
                    }),
                }
            },
        );
        self.handlers.insert(M::TYPE.to_string(), erased);
        debug!(message_type = M::TYPE, "Registered handler");
        Ok(self)
    }

    fn check_registered<M: Message>(&self) -> Result<(), SetupError> {
        match self.registry.rust_type_of(M::TYPE) {
            None => Err(SetupError::UnregisteredType(M::TYPE.to_string())),
            Some(_) if self.registry.is_registered_as::<M>() => Ok(()),
            Some(registered) => Err(SetupError::TypeMismatch {
                type_name: M::TYPE.to_string(),
                registered,
                requested: std::any::type_name::<M>(),
            }),
        }
    }

    /// Sends dead-lettered messages to `sink`.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    /// Sends decode and dispatch faults to `sink`.
    #[must_use]
    pub fn with_fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.faults = sink;
        self
    }

    pub(crate) fn with_replier(mut self, replier: Replier) -> Self {
        self.replier = Some(replier);
        self
    }

    /// The consumer's configuration.
    #[must_use]
    pub const fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Counters shared by every run of this consumer.
    #[must_use]
    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Type tags with a registered handler.
    pub fn handled_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    fn dispatcher(self) -> Dispatcher {
        Dispatcher {
            queue: self.config.topology.queue.to_string(),
            transport: self.transport,
            registry: self.registry,
            handlers: self.handlers,
            max_redeliveries: self.config.max_redeliveries,
            dead_letters: self.dead_letters,
            faults: self.faults,
            replier: self.replier,
            stats: self.stats,
            attempts: AttemptTracker::default(),
        }
    }

    /// Declares the topology, subscribes, and spawns the receive loop.
    ///
    /// # Errors
    ///
    /// * [`SetupError::NoHandlers`] if no handler was registered.
    /// * [`SetupError::Transport`] if declaring or subscribing fails.
    pub async fn start(self) -> Result<ConsumerHandle, SetupError> {
        if self.handlers.is_empty() {
            return Err(SetupError::NoHandlers(
                self.config.topology.queue.to_string(),
            ));
        }

        let state = Arc::new(StateCell::default());
        let cancel = CancellationToken::new();
        let stats = self.stats();
        let config = self.config.clone();

        let stream = match self.subscribe(&state).await {
            Ok(stream) => stream,
            Err(err) => {
                state.set(ConsumerState::Stopped);
                return Err(err.into());
            }
        };

        let dispatcher = Arc::new(self.dispatcher());
        let task = tokio::spawn(receive(
            dispatcher,
            stream,
            config,
            Arc::clone(&state),
            cancel.clone(),
        ));

        Ok(ConsumerHandle::new(state, cancel, stats, task))
    }

    /// Runs the subscription on the current task until `cancel` fires or the
    /// transport fails.
    ///
    /// This is the entry point for external supervisors: each call declares
    /// the topology and subscribes afresh.
    ///
    /// # Errors
    ///
    /// The [`TransportError`] that ended the subscription.
    #[instrument(skip_all, fields(queue = %self.config.topology.queue))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), TransportError> {
        let state = Arc::new(StateCell::default());
        let config = self.config.clone();
        let stream = match self.subscribe(&state).await {
            Ok(stream) => stream,
            Err(err) => {
                state.set(ConsumerState::Stopped);
                return Err(err);
            }
        };
        receive(Arc::new(self.dispatcher()), stream, config, state, cancel).await
    }

    async fn subscribe(
        &self,
        state: &StateCell,
    ) -> Result<DeliveryStream, TransportError> {
        let queue = self.config.topology.declare(self.transport.as_ref()).await?;
        let stream = self.transport.consume(&queue).await?;
        state.set(ConsumerState::Subscribed);
        debug!(queue = %queue.name(), handlers = self.handlers.len(), "Subscribed");
        Ok(stream)
    }
}

async fn receive(
    dispatcher: Arc<Dispatcher>,
    stream: DeliveryStream,
    config: ConsumerConfig,
    state: Arc<StateCell>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let result = if config.concurrency <= 1 {
        receive_serial(&dispatcher, stream, &state, &cancel).await
    } else {
        receive_concurrent(&dispatcher, stream, &config, &state, &cancel).await
    };
    state.set(ConsumerState::Stopped);
    result
}
