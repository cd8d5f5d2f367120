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

//! Gateway configuration loaded from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::ConfigError;
use crate::supervision::{RestartLimiterConfig, RestartPolicy};

/// Configuration for a gateway process.
///
/// Every section is optional in the file; missing values take their
/// defaults. The core keeps no global instance: load it once and pass the
/// pieces to the components that need them.
///
/// ```toml
/// [broker]
/// url = "amqp://localhost:5672/%2f"
/// namespace = "acme"
///
/// [rpc]
/// default_timeout_ms = 1000
///
/// [consumer]
/// concurrency = 4
/// max_redeliveries = 2
///
/// [supervisor]
/// restart_policy = "transient"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Broker connection settings.
    pub broker: BrokerConfig,
    /// RPC client settings.
    pub rpc: RpcConfig,
    /// Consumer defaults.
    pub consumer: ConsumerDefaults,
    /// Shutdown behavior.
    pub shutdown: ShutdownConfig,
    /// Restart supervision.
    pub supervisor: SupervisorConfig,
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker URL, passed to the transport implementation.
    pub url: String,
    /// First segment of every exchange and queue address.
    pub namespace: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672/%2f".to_string(),
            namespace: "courier".to_string(),
        }
    }
}

/// RPC client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Deadline used by `call_default`, in milliseconds.
    pub default_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
        }
    }
}

impl RpcConfig {
    /// The default deadline.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Consumer defaults.
///
/// `max_redeliveries` has no default: if the file leaves it out, every
/// consumer must be given one in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerDefaults {
    /// Handler invocations allowed in flight per subscription.
    pub concurrency: usize,
    /// Requeues allowed before a failing message is dead-lettered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_redeliveries: Option<u32>,
}

impl Default for ConsumerDefaults {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_redeliveries: None,
        }
    }
}

/// Shutdown behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long a stopping consumer waits for in-flight handlers before
    /// warning, in milliseconds.
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 10_000,
        }
    }
}

impl ShutdownConfig {
    /// The drain warning deadline.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Restart supervision settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// When a subscription is restarted.
    pub restart_policy: RestartPolicy,
    /// Restart window and backoff.
    pub restart_limiter: RestartLimiterConfig,
}

impl GatewayConfig {
    /// Parses configuration from a TOML string.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Reads and parses a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Loads configuration from XDG-compliant locations.
    ///
    /// Looks for `courier/gateway.toml` under `$XDG_CONFIG_HOME` and the XDG
    /// config dirs. If no file is found, or the file cannot be read or parsed,
    /// logs the problem and returns the defaults.
    #[must_use]
    pub fn load() -> Self {
        let xdg_dirs = match xdg::BaseDirectories::with_prefix("courier") {
            Ok(dirs) => dirs,
            Err(e) => {
                error!("Failed to initialize XDG directories: {e}");
                return Self::default();
            }
        };

        let Some(path) = xdg_dirs.find_config_file("gateway.toml") else {
            info!("No gateway configuration found, using defaults");
            return Self::default();
        };

        match Self::from_path(&path) {
            Ok(config) => {
                info!("Loaded gateway configuration from {}", path.display());
                config
            }
            Err(e) => {
                error!("{e}; using defaults");
                Self::default()
            }
        }
    }
}
