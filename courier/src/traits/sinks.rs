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

use crate::common::HandlerError;
use crate::message::{DeadLetter, DeliveryFault, Envelope, ErrorReply};

/// Terminal destination for messages that exhausted their redelivery budget.
///
/// Receives exactly one record per dead-lettered message.
#[async_trait]
pub trait DeadLetterSink: Debug + Send + Sync + 'static {
    /// Accepts a dead-lettered message.
    async fn dead_letter(&self, record: DeadLetter);
}

/// Receives deliveries that were acked off the queue without reaching a handler.
#[async_trait]
pub trait FaultSink: Debug + Send + Sync + 'static {
    /// Accepts a fault report.
    async fn report(&self, fault: DeliveryFault);
}

/// Maps an application failure onto the error reply sent to an RPC caller.
///
/// The gateway fixes the reply shape; the adapter decides what goes in it.
pub trait ErrorAdapter: Debug + Send + Sync + 'static {
    /// Builds the error reply for `error`, raised while handling `envelope`.
    fn adapt(&self, error: &HandlerError, envelope: &Envelope) -> ErrorReply;
}
