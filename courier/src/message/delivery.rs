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

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;

use super::{Envelope, MessageContextMap};
use crate::common::DecodeError;

/// Opaque handle used to settle exactly one delivery.
///
/// Tokens are neither `Clone` nor `Copy`: [`Transport::ack`](crate::traits::Transport::ack)
/// and [`Transport::nack`](crate::traits::Transport::nack) take them by value,
/// so a delivery cannot be settled twice.
#[derive(PartialEq, Eq, Hash)]
pub struct AckToken {
    tag: u64,
}

impl AckToken {
    /// Creates a token for a transport-assigned delivery tag.
    ///
    /// Intended for [`Transport`](crate::traits::Transport) implementations.
    #[must_use]
    pub const fn new(tag: u64) -> Self {
        Self { tag }
    }

    /// The transport-assigned delivery tag.
    #[must_use]
    pub const fn tag(&self) -> u64 {
        self.tag
    }
}

impl fmt::Debug for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AckToken({})", self.tag)
    }
}

/// One message as handed out by a transport subscription.
#[derive(Debug)]
pub struct RawDelivery {
    /// Frame bytes exactly as published.
    pub body: Bytes,
    /// Token settling this delivery.
    pub token: AckToken,
    /// Times the transport has redelivered this message, if it tracks that.
    pub redelivery_count: Option<u32>,
}

/// Record handed to a [`DeadLetterSink`](crate::traits::DeadLetterSink) when a
/// message exhausts its redelivery budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Queue the message was consumed from.
    pub queue: String,
    /// The envelope as received.
    pub envelope: Envelope,
    /// Raw frame bytes, for republishing.
    pub body: Bytes,
    /// Total handler invocations, including the last failed one.
    pub attempts: u32,
    /// Display form of the final handler error.
    pub error: String,
    /// Error code attached by the handler, if any.
    pub error_code: Option<String>,
    /// When the message was dead-lettered.
    pub dead_lettered_at: SystemTime,
}

/// Why a delivery was removed from the queue without reaching a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// The frame or payload could not be decoded.
    Decode(DecodeError),
    /// The type is registered, but this consumer has no handler for it.
    NoHandler(String),
}

/// Record handed to a [`FaultSink`](crate::traits::FaultSink).
#[derive(Debug, Clone)]
pub struct DeliveryFault {
    /// Queue the message was consumed from.
    pub queue: String,
    /// What went wrong.
    pub kind: FaultKind,
    /// Type tag, when the envelope could be read.
    pub message_type: Option<String>,
    /// Correlation id, when the envelope could be read.
    pub correlation_id: Option<String>,
    /// Raw frame bytes.
    pub body: Bytes,
}

/// Per-message metadata passed to handlers alongside the decoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// Type tag of the message.
    pub message_type: String,
    /// Correlation id, if the sender set one.
    pub correlation_id: Option<String>,
    /// Reply address, if the sender expects a reply.
    pub reply_to: Option<String>,
    /// Context entries carried by the envelope.
    pub context: MessageContextMap,
    /// Times this message has been delivered before this attempt.
    pub redelivery_count: u32,
}

impl MessageContext {
    pub(crate) fn from_envelope(envelope: &Envelope, redelivery_count: u32) -> Self {
        Self {
            message_type: envelope.message_type.clone(),
            correlation_id: envelope.correlation_id.clone(),
            reply_to: envelope.reply_to.clone(),
            context: envelope.context.clone(),
            redelivery_count,
        }
    }

    /// Returns `true` if this is not the first delivery.
    #[must_use]
    pub const fn is_redelivery(&self) -> bool {
        self.redelivery_count > 0
    }
}
