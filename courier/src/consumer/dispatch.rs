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

//! Settlement of a single delivery: decode, dispatch, then exactly one
//! ack or nack.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use derive_new::new;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use super::attempts::AttemptTracker;
use crate::common::{
    bump, ConsumerStats, HandlerError, PublishError, Publisher, SchemaRegistry, TransportError,
};
use crate::message::{
    AckToken, DeadLetter, DeliveryFault, Envelope, ErrorReply, FaultKind, Format, Frame,
    MessageContext, RawDelivery,
};
use crate::traits::{DeadLetterSink, ErrorAdapter, FaultSink, ReplyValue, Transport};

pub(crate) type HandlerFuture = BoxFuture<'static, Result<Option<ReplyValue>, HandlerError>>;

/// Type-erased handler: takes the registry-decoded value.
pub(crate) type ErasedHandler =
    Arc<dyn Fn(Box<dyn Any + Send>, MessageContext) -> HandlerFuture + Send + Sync>;

/// Publishes RPC replies on behalf of a consumer.
#[derive(Debug, Clone, new)]
pub(crate) struct Replier {
    pub(crate) publisher: Publisher,
    pub(crate) adapter: Arc<dyn ErrorAdapter>,
}

/// Everything needed to settle deliveries, shared by in-flight tasks.
pub(crate) struct Dispatcher {
    pub(crate) queue: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: SchemaRegistry,
    pub(crate) handlers: HashMap<String, ErasedHandler>,
    pub(crate) max_redeliveries: u32,
    pub(crate) dead_letters: Arc<dyn DeadLetterSink>,
    pub(crate) faults: Arc<dyn FaultSink>,
    pub(crate) replier: Option<Replier>,
    pub(crate) stats: Arc<ConsumerStats>,
    pub(crate) attempts: AttemptTracker,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue", &self.queue)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("max_redeliveries", &self.max_redeliveries)
            .field("replies", &self.replier.is_some())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Decodes, dispatches and settles one delivery.
    ///
    /// Returns an error only when the transport refuses the ack or nack.
    pub(crate) async fn process(&self, delivery: RawDelivery) -> Result<(), TransportError> {
        bump(&self.stats.received);
        let RawDelivery {
            body,
            token,
            redelivery_count,
        } = delivery;

        let frame = match Frame::decode(&body) {
            Ok(frame) => frame,
            Err(err) => {
                bump(&self.stats.decode_failures);
                return self.fault(token, FaultKind::Decode(err), None, body).await;
            }
        };
        let Frame {
            format, envelope, ..
        } = frame;

        let value = match self
            .registry
            .decode_dyn(&envelope.message_type, &envelope.payload, format)
        {
            Ok(value) => value,
            Err(err) => {
                bump(&self.stats.decode_failures);
                self.best_effort_error_reply(
                    &envelope,
                    format,
                    ErrorReply::DECODE_ERROR,
                    err.to_string(),
                )
                .await;
                return self
                    .fault(token, FaultKind::Decode(err), Some(&envelope), body)
                    .await;
            }
        };

        let Some(handler) = self.handlers.get(&envelope.message_type) else {
            bump(&self.stats.dispatch_failures);
            self.best_effort_error_reply(
                &envelope,
                format,
                ErrorReply::NO_HANDLER,
                format!("no handler for {} on {}", envelope.message_type, self.queue),
            )
            .await;
            let kind = FaultKind::NoHandler(envelope.message_type.clone());
            return self.fault(token, kind, Some(&envelope), body).await;
        };

        let redeliveries = redelivery_count.unwrap_or_else(|| self.attempts.observed(&body));
        let context = MessageContext::from_envelope(&envelope, redeliveries);
        trace!(
            queue = %self.queue,
            message_type = %envelope.message_type,
            redeliveries,
            "Dispatching message"
        );

        let outcome = AssertUnwindSafe(handler(value, context))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::msg(panic_message(&*panic))));

        match outcome {
            Ok(reply) => {
                self.reply(&envelope, format, reply).await;
                self.attempts.forget(&body);
                self.ack(token).await
            }
            Err(err) => {
                bump(&self.stats.handler_failures);
                if redeliveries < self.max_redeliveries {
                    warn!(
                        queue = %self.queue,
                        message_type = %envelope.message_type,
                        attempt = redeliveries + 1,
                        max_redeliveries = self.max_redeliveries,
                        error = %err,
                        "Handler failed; requeueing"
                    );
                    if redelivery_count.is_none() {
                        self.attempts.record_failure(&body);
                    }
                    self.transport.nack(token, true).await?;
                    bump(&self.stats.requeued);
                    Ok(())
                } else {
                    self.dead_letter(token, envelope, format, body, redeliveries + 1, &err)
                        .await
                }
            }
        }
    }

    async fn ack(&self, token: AckToken) -> Result<(), TransportError> {
        self.transport.ack(token).await?;
        bump(&self.stats.acked);
        Ok(())
    }

    async fn fault(
        &self,
        token: AckToken,
        kind: FaultKind,
        envelope: Option<&Envelope>,
        body: Bytes,
    ) -> Result<(), TransportError> {
        warn!(queue = %self.queue, fault = ?kind, "Removing undeliverable message");
        self.ack(token).await?;
        self.faults
            .report(DeliveryFault {
                queue: self.queue.clone(),
                kind,
                message_type: envelope.map(|e| e.message_type.clone()),
                correlation_id: envelope.and_then(|e| e.correlation_id.clone()),
                body,
            })
            .await;
        Ok(())
    }

    async fn dead_letter(
        &self,
        token: AckToken,
        envelope: Envelope,
        format: Format,
        body: Bytes,
        attempts: u32,
        err: &HandlerError,
    ) -> Result<(), TransportError> {
        error!(
            queue = %self.queue,
            message_type = %envelope.message_type,
            attempts,
            error = %err,
            "Redelivery limit reached; dead-lettering"
        );
        if let Some(replier) = &self.replier {
            if envelope.expects_reply() {
                let reply = replier.adapter.adapt(err, &envelope);
                self.send_error_reply(replier, &envelope, format, &reply).await;
            }
        }

        self.attempts.forget(&body);
        self.ack(token).await?;
        bump(&self.stats.dead_lettered);
        self.dead_letters
            .dead_letter(DeadLetter {
                queue: self.queue.clone(),
                envelope,
                body,
                attempts,
                error: err.to_string(),
                error_code: err.code().map(str::to_string),
                dead_lettered_at: SystemTime::now(),
            })
            .await;
        Ok(())
    }

    async fn reply(&self, envelope: &Envelope, format: Format, reply: Option<ReplyValue>) {
        let Some(replier) = &self.replier else {
            if envelope.expects_reply() {
                trace!(
                    message_type = %envelope.message_type,
                    "Ignoring reply_to on a consumer without a replier"
                );
            }
            return;
        };
        if !envelope.expects_reply() {
            return;
        }
        let Some(reply) = reply else {
            debug!(message_type = %envelope.message_type, "Handler produced no reply");
            let reply = ErrorReply::new(
                envelope.correlation_id.clone().unwrap_or_default(),
                ErrorReply::NO_REPLY,
                format!("handler for {} produced no reply", envelope.message_type),
            );
            self.send_error_reply(replier, envelope, format, &reply).await;
            return;
        };

        match replier.publisher.publish_reply(&reply, envelope, format).await {
            Ok(()) => bump(&self.stats.replies_sent),
            Err(PublishError::Schema(err)) => {
                bump(&self.stats.reply_failures);
                error!(error = %err, "Failed to encode reply; sending error reply instead");
                let reply = ErrorReply::new(
                    envelope.correlation_id.clone().unwrap_or_default(),
                    ErrorReply::REPLY_ENCODE_ERROR,
                    err.to_string(),
                );
                self.send_error_reply(replier, envelope, format, &reply).await;
            }
            Err(err) => {
                bump(&self.stats.reply_failures);
                error!(error = %err, reply_to = ?envelope.reply_to, "Failed to publish reply");
            }
        }
    }

    async fn best_effort_error_reply(
        &self,
        envelope: &Envelope,
        format: Format,
        code: &str,
        message: String,
    ) {
        if let Some(replier) = &self.replier {
            if envelope.expects_reply() {
                let reply = ErrorReply::new(
                    envelope.correlation_id.clone().unwrap_or_default(),
                    code,
                    message,
                );
                self.send_error_reply(replier, envelope, format, &reply).await;
            }
        }
    }

    async fn send_error_reply(
        &self,
        replier: &Replier,
        envelope: &Envelope,
        format: Format,
        reply: &ErrorReply,
    ) {
        match replier
            .publisher
            .publish_error_reply(reply, envelope, format)
            .await
        {
            Ok(()) => bump(&self.stats.replies_sent),
            Err(err) => {
                bump(&self.stats.reply_failures);
                error!(error = %err, reply_to = ?envelope.reply_to, "Failed to publish error reply");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| format!("handler panicked: {s}"))
        .or_else(|| {
            payload
                .downcast_ref::<String>()
                .map(|s| format!("handler panicked: {s}"))
        })
        .unwrap_or_else(|| "handler panicked".to_string())
}
