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

//! Exchange and queue naming plus idempotent topology declaration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{SetupError, TransportError};
use crate::traits::Transport;

/// Routing behavior of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes to queues whose binding key equals the routing key.
    #[default]
    Direct,
    /// Routes to every bound queue, ignoring the routing key.
    Fanout,
    /// Routes by dotted pattern: `*` matches one word, `#` zero or more.
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
        })
    }
}

/// Queue declaration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,
    /// Only one consumer may attach.
    pub exclusive: bool,
    /// Deleted when its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// A shared, durable work queue.
    #[must_use]
    pub const fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// A private, auto-deleting queue, as used for RPC replies.
    #[must_use]
    pub const fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::durable()
    }
}

/// Handle to a declared queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    name: String,
}

impl QueueHandle {
    /// Creates a handle. Intended for [`Transport`] implementations.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A validated broker address of the form `<namespace>:<domain>:<kind>`.
///
/// ```rust,ignore
/// let queue: Address = "acme:batches:commands".parse()?;
/// assert_eq!(queue.domain(), "batches");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    namespace: String,
    domain: String,
    kind: String,
}

impl Address {
    /// Builds an address from its parts, validating each.
    pub fn new(
        namespace: impl Into<String>,
        domain: impl Into<String>,
        kind: impl Into<String>,
    ) -> Result<Self, SetupError> {
        let address = Self {
            namespace: namespace.into(),
            domain: domain.into(),
            kind: kind.into(),
        };
        for part in [&address.namespace, &address.domain, &address.kind] {
            validate_segment(part, &address.to_string())?;
        }
        Ok(address)
    }

    /// The namespace segment.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The domain segment.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The kind segment.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }
}

fn validate_segment(segment: &str, address: &str) -> Result<(), SetupError> {
    let invalid = |reason| SetupError::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    if segment.is_empty() {
        return Err(invalid("empty segment"));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(invalid(
            "segments may only contain ASCII letters, digits, '_', '-' and '.'",
        ));
    }
    Ok(())
}

impl FromStr for Address {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(domain), Some(kind), None) => Self::new(namespace, domain, kind),
            _ => Err(SetupError::InvalidAddress {
                address: s.to_string(),
                reason: "expected <namespace>:<domain>:<kind>",
            }),
        }
    }
}

impl TryFrom<&str> for Address {
    type Error = SetupError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.domain, self.kind)
    }
}

/// An exchange, a queue, and the routing keys binding them.
///
/// [`declare`](Self::declare) is idempotent and safe to run on every startup.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Exchange the queue is fed from.
    pub exchange: Address,
    /// Routing behavior of the exchange.
    pub exchange_kind: ExchangeKind,
    /// Queue to consume.
    pub queue: Address,
    /// Queue declaration options.
    pub queue_options: QueueOptions,
    /// Binding keys between the exchange and the queue.
    pub routing_keys: Vec<String>,
}

impl Topology {
    /// Declares the exchange and queue, then binds every routing key.
    pub async fn declare(&self, transport: &dyn Transport) -> Result<QueueHandle, TransportError> {
        let exchange = self.exchange.to_string();
        transport
            .declare_exchange(&exchange, self.exchange_kind)
            .await?;
        let queue = transport
            .declare_queue(&self.queue.to_string(), self.queue_options)
            .await?;
        for key in &self.routing_keys {
            transport.bind(&queue, &exchange, key).await?;
        }
        trace!(
            exchange = %self.exchange,
            queue = %self.queue,
            bindings = self.routing_keys.len(),
            "Declared topology"
        );
        Ok(queue)
    }
}
