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

//! Built-in dead-letter and fault sinks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::message::{DeadLetter, DeliveryFault};
use crate::traits::{DeadLetterSink, FaultSink, Transport};

/// Logs dead-lettered messages at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for TracingDeadLetterSink {
    async fn dead_letter(&self, record: DeadLetter) {
        error!(
            queue = %record.queue,
            message_type = %record.envelope.message_type,
            correlation_id = ?record.envelope.correlation_id,
            attempts = record.attempts,
            error_code = ?record.error_code,
            error = %record.error,
            "Message dead-lettered"
        );
    }
}

/// Forwards dead-lettered messages into a channel.
#[derive(Debug, Clone)]
pub struct ChannelDeadLetterSink {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterSink {
    /// Creates the sink and the receiving end.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterSink for ChannelDeadLetterSink {
    async fn dead_letter(&self, record: DeadLetter) {
        if let Err(err) = self.sender.send(record) {
            let record = err.0;
            error!(
                queue = %record.queue,
                message_type = %record.envelope.message_type,
                "Dead-letter receiver dropped; record lost"
            );
        }
    }
}

/// Republishes the raw frame of dead-lettered messages to an exchange.
///
/// The routing key is the message's type tag.
#[derive(Debug, Clone)]
pub struct ExchangeDeadLetterSink {
    transport: Arc<dyn Transport>,
    exchange: String,
}

impl ExchangeDeadLetterSink {
    /// Creates a sink publishing to `exchange`, which must already be declared.
    pub fn new(transport: Arc<dyn Transport>, exchange: impl Into<String>) -> Self {
        Self {
            transport,
            exchange: exchange.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for ExchangeDeadLetterSink {
    async fn dead_letter(&self, record: DeadLetter) {
        let routing_key = record.envelope.message_type.clone();
        if let Err(err) = self
            .transport
            .publish(&self.exchange, &routing_key, record.body.clone())
            .await
        {
            error!(
                exchange = %self.exchange,
                message_type = %routing_key,
                error = %err,
                attempts = record.attempts,
                "Failed to republish dead-lettered message"
            );
        }
    }
}

/// Logs delivery faults at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFaultSink;

#[async_trait]
impl FaultSink for TracingFaultSink {
    async fn report(&self, fault: DeliveryFault) {
        warn!(
            queue = %fault.queue,
            message_type = ?fault.message_type,
            correlation_id = ?fault.correlation_id,
            fault = ?fault.kind,
            "Delivery removed without reaching a handler"
        );
    }
}

/// Forwards delivery faults into a channel.
#[derive(Debug, Clone)]
pub struct ChannelFaultSink {
    sender: mpsc::UnboundedSender<DeliveryFault>,
}

impl ChannelFaultSink {
    /// Creates the sink and the receiving end.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeliveryFault>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl FaultSink for ChannelFaultSink {
    async fn report(&self, fault: DeliveryFault) {
        if self.sender.send(fault).is_err() {
            warn!("Fault receiver dropped; report lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use bytes::Bytes;
    use futures::StreamExt;

    use super::*;
    use crate::common::{ExchangeKind, MemoryBroker, QueueOptions};
    use crate::message::Envelope;

    fn record() -> DeadLetter {
        DeadLetter {
            queue: "acme:batches:commands".into(),
            envelope: Envelope::new("commands.CreateBatch", vec![0, 1]),
            body: Bytes::from_static(b"frame"),
            attempts: 3,
            error: "boom".into(),
            error_code: None,
            dead_lettered_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn channel_sink_forwards_records() {
        let (sink, mut receiver) = ChannelDeadLetterSink::new();
        sink.dead_letter(record()).await;
        assert_eq!(receiver.recv().await.unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn exchange_sink_republishes_the_raw_frame() -> anyhow::Result<()> {
        let broker = MemoryBroker::new();
        broker.declare_exchange("acme:dead:letters", ExchangeKind::Fanout).await?;
        let queue = broker.declare_queue("acme:dead:inbox", QueueOptions::durable()).await?;
        broker.bind(&queue, "acme:dead:letters", "").await?;

        let sink = ExchangeDeadLetterSink::new(Arc::new(broker.clone()), "acme:dead:letters");
        sink.dead_letter(record()).await;

        let mut stream = broker.consume(&queue).await?;
        let delivery = stream.next().await.unwrap()?;
        assert_eq!(&delivery.body[..], b"frame");
        Ok(())
    }
}
