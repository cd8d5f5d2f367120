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
use std::sync::Arc;

use bytes::Bytes;
use static_assertions::assert_impl_all;
use tracing::trace;

use super::{PublishError, SchemaRegistry, DEFAULT_EXCHANGE};
use crate::message::{Envelope, ErrorReply, Format, Frame, FrameKind, MessageContextMap};
use crate::traits::{Message, ReplyValue, Transport};

assert_impl_all!(Publisher: Send, Sync, Clone);

/// Whether a publish expects a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PublishMode {
    /// Fire-and-forget.
    #[default]
    Fire,
    /// RPC request. The publisher attaches the fields but does not wait.
    Request {
        /// Id the reply will echo.
        correlation_id: String,
        /// Queue the reply should be published to.
        reply_to: String,
    },
}

/// Per-call publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Routing key. Defaults to the message's type tag.
    pub routing_key: Option<String>,
    /// Context entries to attach.
    pub context: MessageContextMap,
    /// Fire or request.
    pub mode: PublishMode,
}

impl PublishOptions {
    /// Sets the routing key.
    #[must_use]
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Adds a context entry.
    #[must_use]
    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Replaces the whole context map.
    #[must_use]
    pub fn with_context(mut self, context: MessageContextMap) -> Self {
        self.context = context;
        self
    }

    /// Marks the publish as an RPC request.
    #[must_use]
    pub fn request(mut self, correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        self.mode = PublishMode::Request {
            correlation_id: correlation_id.into(),
            reply_to: reply_to.into(),
        };
        self
    }
}

/// Encodes typed messages and hands them to the transport.
///
/// A publish returns once the transport accepted the frame. Encoding happens
/// before anything is sent, so a [`SchemaError`](super::SchemaError) never
/// leaves a partial publish behind. No retries happen at this layer.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    registry: SchemaRegistry,
    exchange: String,
    format: Format,
}

impl Publisher {
    /// Creates a publisher sending to `exchange`.
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: SchemaRegistry,
        exchange: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            registry,
            exchange: exchange.into(),
            format: Format::default(),
        }
    }

    /// Sets the serialization format for outgoing frames.
    #[must_use]
    pub const fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// The exchange this publisher sends to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The registry used for encoding.
    #[must_use]
    pub const fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Publishes a message.
    ///
    /// # Errors
    ///
    /// * [`PublishError::Schema`] if the value cannot be encoded; nothing is sent.
    /// * [`PublishError::Transport`] if the transport refuses the frame.
    pub async fn publish<M: Message>(
        &self,
        value: &M,
        options: PublishOptions,
    ) -> Result<(), PublishError> {
        let payload = self.registry.encode(value, self.format)?;

        let mut envelope = Envelope::new(M::TYPE, payload).with_context(options.context);
        let kind = match options.mode {
            PublishMode::Fire => FrameKind::Event,
            PublishMode::Request {
                correlation_id,
                reply_to,
            } => {
                envelope = envelope
                    .with_correlation_id(correlation_id)
                    .with_reply_to(reply_to);
                FrameKind::Request
            }
        };
        let bytes = Frame::new(kind, self.format, envelope).encode()?;

        let routing_key = options.routing_key.as_deref().unwrap_or(M::TYPE);
        self.transport
            .publish(&self.exchange, routing_key, bytes)
            .await?;
        trace!(
            exchange = %self.exchange,
            routing_key,
            message_type = M::TYPE,
            ?kind,
            "Published message"
        );
        Ok(())
    }

    /// Publishes a fire-and-forget message with default options.
    pub async fn emit<M: Message>(&self, value: &M) -> Result<(), PublishError> {
        self.publish(value, PublishOptions::default()).await
    }

    /// Publishes a success reply to a private reply queue.
    pub(crate) async fn publish_reply(
        &self,
        reply: &ReplyValue,
        request: &Envelope,
        format: Format,
    ) -> Result<(), PublishError> {
        self.send_reply(reply.type_name(), reply.value(), FrameKind::Reply, request, format)
            .await
    }

    /// Publishes an error reply to a private reply queue.
    pub(crate) async fn publish_error_reply(
        &self,
        reply: &ErrorReply,
        request: &Envelope,
        format: Format,
    ) -> Result<(), PublishError> {
        self.send_reply(ErrorReply::TYPE, reply, FrameKind::ErrorReply, request, format)
            .await
    }

    async fn send_reply(
        &self,
        type_name: &str,
        value: &(dyn Any + Sync),
        kind: FrameKind,
        request: &Envelope,
        format: Format,
    ) -> Result<(), PublishError> {
        let Some(reply_to) = request.reply_to.as_deref() else {
            return Ok(());
        };
        let bytes = self.reply_frame(type_name, value, kind, request, format)?;

        self.transport
            .publish(DEFAULT_EXCHANGE, reply_to, bytes)
            .await?;
        trace!(reply_to, message_type = type_name, ?kind, "Published reply");
        Ok(())
    }

    fn reply_frame(
        &self,
        type_name: &str,
        value: &dyn Any,
        kind: FrameKind,
        request: &Envelope,
        format: Format,
    ) -> Result<Bytes, PublishError> {
        let payload = self.registry.encode_dyn(type_name, value, format)?;
        let mut envelope = Envelope::new(type_name, payload).with_context(request.context.clone());
        envelope.correlation_id = request.correlation_id.clone();
        Ok(Frame::new(kind, format, envelope).encode()?)
    }
}
