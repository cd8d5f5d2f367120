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

//! In-process broker implementing the full [`Transport`] contract.
//!
//! Used by the test suite and by applications that run publishers and
//! consumers inside one process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{ExchangeKind, QueueHandle, QueueOptions, TransportError};
use crate::message::{AckToken, RawDelivery};
use crate::traits::{DeliveryStream, Transport};

/// Name of the default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    /// `(queue, binding key)` pairs, without duplicates.
    bindings: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Bytes,
    redelivery_count: u32,
}

#[derive(Debug)]
struct QueueState {
    name: String,
    options: QueueOptions,
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
    consumers: AtomicUsize,
    deleted: AtomicBool,
}

impl QueueState {
    fn push_back(&self, message: StoredMessage) {
        self.messages.lock().push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        self.messages.lock().push_front(message);
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct Unacked {
    subscription: u64,
    queue: Arc<QueueState>,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct BrokerInner {
    exchanges: DashMap<String, ExchangeState>,
    queues: DashMap<String, Arc<QueueState>>,
    unacked: DashMap<u64, Unacked>,
    next_tag: AtomicU64,
    next_subscription: AtomicU64,
    hide_redelivery_counts: bool,
    closed: CancellationToken,
}

impl BrokerInner {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            Err(TransportError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn delete_queue(&self, queue: &QueueState) {
        queue.deleted.store(true, Ordering::SeqCst);
        self.queues.remove(&queue.name);
        for mut exchange in self.exchanges.iter_mut() {
            exchange.bindings.retain(|(bound, _)| bound != &queue.name);
        }
        debug!(queue = %queue.name, "Auto-deleted queue");
    }

    /// Returns a subscription's unsettled deliveries to the head of their
    /// queue in delivery order, counting each as a redelivery.
    fn requeue_unacked(&self, subscription: u64) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|entry| entry.subscription == subscription)
            .map(|entry| *entry.key())
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            let Some((_, unacked)) = self.unacked.remove(&tag) else {
                continue;
            };
            if unacked.queue.deleted.load(Ordering::SeqCst) {
                continue;
            }
            let mut message = unacked.message;
            message.redelivery_count = message.redelivery_count.saturating_add(1);
            debug!(queue = %unacked.queue.name, tag, "Requeued delivery of a dropped subscription");
            unacked.queue.push_front(message);
        }
    }
}

/// Runs when a subscription stream is dropped: requeues its unsettled
/// deliveries, decrements the consumer count and deletes auto-delete queues
/// that lose their last consumer.
#[derive(Debug)]
struct ConsumerGuard {
    id: u64,
    broker: Arc<BrokerInner>,
    queue: Arc<QueueState>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.broker.requeue_unacked(self.id);
        let remaining = self.queue.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.queue.options.auto_delete {
            self.broker.delete_queue(&self.queue);
        }
    }
}

struct Subscription {
    guard: ConsumerGuard,
    finished: bool,
}

/// An in-memory message broker.
///
/// Supports direct, fanout and topic exchanges plus the default exchange,
/// which routes to the queue named by the routing key. Declarations are
/// idempotent. A nack with requeue returns the message to the head of its
/// queue with its redelivery count incremented, as does dropping a
/// subscription that still holds unsettled deliveries. Messages that match
/// no binding are dropped.
///
/// Clones share the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a broker whose deliveries carry no redelivery count, like
    /// brokers that only flag redeliveries.
    #[must_use]
    pub fn without_redelivery_counts() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                hide_redelivery_counts: true,
                ..BrokerInner::default()
            }),
        }
    }

    /// Closes the broker. Every subscription yields
    /// [`TransportError::ConnectionClosed`] and every later call fails with it.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Returns `true` once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Checks if a queue exists.
    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.queues.contains_key(name)
    }

    /// Messages ready for delivery on a queue.
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.inner
            .queues
            .get(name)
            .map(|queue| queue.messages.lock().len())
    }

    /// Deliveries handed out but not yet settled, across all queues.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.inner.unacked.len()
    }

    /// Number of bindings on an exchange.
    #[must_use]
    pub fn binding_count(&self, exchange: &str) -> Option<usize> {
        self.inner
            .exchanges
            .get(exchange)
            .map(|exchange| exchange.bindings.len())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<QueueState>>, TransportError> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .inner
                .queues
                .get(routing_key)
                .map(|queue| vec![Arc::clone(queue.value())])
                .unwrap_or_default());
        }

        let state = self
            .inner
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?;

        let mut targets: Vec<&str> = Vec::new();
        for (queue, key) in &state.bindings {
            let matched = match state.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(key, routing_key),
            };
            if matched && !targets.contains(&queue.as_str()) {
                targets.push(queue);
            }
        }

        Ok(targets
            .into_iter()
            .filter_map(|name| self.inner.queues.get(name).map(|q| Arc::clone(q.value())))
            .collect())
    }
}

/// Matches an AMQP-style topic pattern against a routing key.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
        self.inner.ensure_open()?;
        if name == DEFAULT_EXCHANGE {
            return if kind == ExchangeKind::Direct {
                Ok(())
            } else {
                Err(TransportError::ExchangeKindConflict {
                    name: name.to_string(),
                    existing: ExchangeKind::Direct.to_string(),
                    requested: kind.to_string(),
                })
            };
        }

        let entry = self
            .inner
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });
        if entry.kind != kind {
            return Err(TransportError::ExchangeKindConflict {
                name: name.to_string(),
                existing: entry.kind.to_string(),
                requested: kind.to_string(),
            });
        }
        trace!(exchange = name, %kind, "Declared exchange");
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueHandle, TransportError> {
        self.inner.ensure_open()?;
        self.inner
            .queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    name: name.to_string(),
                    options,
                    messages: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                    consumers: AtomicUsize::new(0),
                    deleted: AtomicBool::new(false),
                })
            });
        trace!(queue = name, ?options, "Declared queue");
        Ok(QueueHandle::new(name))
    }

    async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.inner.ensure_open()?;
        if !self.inner.queues.contains_key(queue.name()) {
            return Err(TransportError::QueueNotFound(queue.name().to_string()));
        }
        if exchange == DEFAULT_EXCHANGE {
            // Every queue is implicitly bound to the default exchange by name.
            return Ok(());
        }

        let mut state = self
            .inner
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?;
        let binding = (queue.name().to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
    ) -> Result<(), TransportError> {
        self.inner.ensure_open()?;
        let targets = self.route(exchange, routing_key)?;
        if targets.is_empty() {
            trace!(exchange, routing_key, "Dropped unroutable message");
            return Ok(());
        }
        for queue in targets {
            queue.push_back(StoredMessage {
                body: body.clone(),
                redelivery_count: 0,
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &QueueHandle) -> Result<DeliveryStream, TransportError> {
        self.inner.ensure_open()?;
        let state = self
            .inner
            .queues
            .get(queue.name())
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| TransportError::QueueNotFound(queue.name().to_string()))?;

        if state.options.exclusive {
            if state
                .consumers
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(TransportError::ExclusiveQueueInUse(state.name.clone()));
            }
        } else {
            state.consumers.fetch_add(1, Ordering::SeqCst);
        }

        let subscription = Subscription {
            guard: ConsumerGuard {
                id: self.inner.next_subscription.fetch_add(1, Ordering::SeqCst),
                broker: Arc::clone(&self.inner),
                queue: state,
            },
            finished: false,
        };

        let stream = futures::stream::unfold(subscription, |mut sub| async move {
            if sub.finished {
                return None;
            }
            loop {
                let broker = &sub.guard.broker;
                let queue = &sub.guard.queue;

                if broker.closed.is_cancelled() || queue.deleted.load(Ordering::SeqCst) {
                    sub.finished = true;
                    return Some((Err(TransportError::ConnectionClosed), sub));
                }

                let next = queue.messages.lock().pop_front();
                if let Some(message) = next {
                    let tag = broker.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                    let delivery = RawDelivery {
                        body: message.body.clone(),
                        token: AckToken::new(tag),
                        redelivery_count: (!broker.hide_redelivery_counts)
                            .then_some(message.redelivery_count),
                    };
                    broker.unacked.insert(
                        tag,
                        Unacked {
                            subscription: sub.guard.id,
                            queue: Arc::clone(queue),
                            message,
                        },
                    );
                    return Some((Ok(delivery), sub));
                }

                // A notify_one without a waiter leaves a permit, so a push
                // between the pop and this wait is not lost.
                tokio::select! {
                    () = queue.notify.notified() => {}
                    () = broker.closed.cancelled() => {}
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn ack(&self, token: AckToken) -> Result<(), TransportError> {
        self.inner.ensure_open()?;
        self.inner
            .unacked
            .remove(&token.tag())
            .map(|_| ())
            .ok_or(TransportError::UnknownDeliveryTag(token.tag()))
    }

    async fn nack(&self, token: AckToken, requeue: bool) -> Result<(), TransportError> {
        self.inner.ensure_open()?;
        let (_, unacked) = self
            .inner
            .unacked
            .remove(&token.tag())
            .ok_or(TransportError::UnknownDeliveryTag(token.tag()))?;

        if requeue && !unacked.queue.deleted.load(Ordering::SeqCst) {
            let mut message = unacked.message;
            message.redelivery_count = message.redelivery_count.saturating_add(1);
            unacked.queue.push_front(message);
        } else {
            trace!(queue = %unacked.queue.name, "Discarded rejected message");
        }
        Ok(())
    }
}
