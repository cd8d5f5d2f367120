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

use std::time::Duration;

use crate::common::{GatewayConfig, SetupError, Topology};

/// Configuration for one consumer subscription.
///
/// The redelivery limit is required: there is no default policy for how
/// often a failing message is retried.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Exchange, queue and bindings feeding the consumer.
    pub topology: Topology,
    /// Requeues allowed before a failing message is dead-lettered.
    pub max_redeliveries: u32,
    /// Handler invocations allowed in flight. `1` means serialized dispatch.
    pub concurrency: usize,
    /// How long a stopping consumer waits for in-flight handlers before
    /// warning. Handlers are never aborted; the wait continues until every
    /// delivery is settled.
    pub drain_timeout: Duration,
}

impl ConsumerConfig {
    /// Creates a serialized consumer configuration.
    #[must_use]
    pub fn new(topology: Topology, max_redeliveries: u32) -> Self {
        Self {
            topology,
            max_redeliveries,
            concurrency: 1,
            drain_timeout: Duration::from_secs(10),
        }
    }

    /// Builds a configuration from the `[consumer]` and `[shutdown]` sections.
    ///
    /// # Errors
    ///
    /// [`SetupError::MissingRedeliveryLimit`] if the file sets no `max_redeliveries`.
    pub fn from_gateway(topology: Topology, gateway: &GatewayConfig) -> Result<Self, SetupError> {
        let max_redeliveries = gateway
            .consumer
            .max_redeliveries
            .ok_or_else(|| SetupError::MissingRedeliveryLimit(topology.queue.to_string()))?;
        Ok(Self::new(topology, max_redeliveries)
            .with_concurrency(gateway.consumer.concurrency)
            .with_drain_timeout(gateway.shutdown.drain_timeout()))
    }

    /// Allows up to `concurrency` handlers in flight. Values below one mean one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the drain warning deadline.
    #[must_use]
    pub const fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ExchangeKind, QueueOptions};

    fn topology() -> Topology {
        Topology {
            exchange: "acme:batches:events".parse().unwrap(),
            exchange_kind: ExchangeKind::Topic,
            queue: "acme:batches:worker".parse().unwrap(),
            queue_options: QueueOptions::durable(),
            routing_keys: vec!["commands.#".into()],
        }
    }

    #[test]
    fn redelivery_limit_must_be_configured() {
        let err = ConsumerConfig::from_gateway(topology(), &GatewayConfig::default()).unwrap_err();
        assert_eq!(
            err,
            SetupError::MissingRedeliveryLimit("acme:batches:worker".into())
        );
    }

    #[test]
    fn gateway_sections_are_applied() {
        let gateway = GatewayConfig::from_toml_str(
            "[consumer]\nconcurrency = 0\nmax_redeliveries = 4\n[shutdown]\ndrain_timeout_ms = 250",
        )
        .unwrap();
        let config = ConsumerConfig::from_gateway(topology(), &gateway).unwrap();
        assert_eq!(config.max_redeliveries, 4);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.drain_timeout, Duration::from_millis(250));
    }
}
