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

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered string metadata carried alongside a message.
///
/// The gateway never interprets context entries; they round-trip unchanged,
/// including their order.
pub type MessageContextMap = IndexMap<String, String>;

/// The unit exchanged over the broker.
///
/// # Wire Format
///
/// Envelopes are serialized inside a [`Frame`](super::Frame). In JSON form an
/// RPC request looks like:
///
/// ```json
/// {
///   "message_type": "queries.BatchesRequest",
///   "correlation_id": "rpc_01h9xz7n2e5p6q8r3t1u2v3w4x",
///   "reply_to": "acme:rpc:reply_01h9xz7n2e5p6q8r3t1u2v3w4y",
///   "context": { "tenant": "t-1" },
///   "payload": [0, 1, 123, 125]
/// }
/// ```
///
/// `payload` is the registry-encoded body: a big-endian schema version followed
/// by the value in the frame's format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Registered type tag identifying the payload schema.
    pub message_type: String,

    /// Links an RPC request to its reply. Absent on pure events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Private queue a reply should be published to. Present only on RPC requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Free-form metadata, preserved verbatim.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub context: MessageContextMap,

    /// Registry-encoded payload bytes.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Creates an event envelope with no correlation, reply address or context.
    #[must_use]
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_type: message_type.into(),
            correlation_id: None,
            reply_to: None,
            context: MessageContextMap::new(),
            payload,
        }
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the reply address.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Replaces the context map.
    #[must_use]
    pub fn with_context(mut self, context: MessageContextMap) -> Self {
        self.context = context;
        self
    }

    /// Returns `true` if the sender is waiting for a reply.
    #[must_use]
    pub const fn expects_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}
