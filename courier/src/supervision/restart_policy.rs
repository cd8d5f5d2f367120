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

//! Restart policies for supervised subscriptions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::TransportError;

/// When a supervisor restarts a subscription that has ended.
///
/// A subscription ended by an explicit shutdown is never restarted, whatever
/// the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Restart whenever the subscription ends.
    Permanent,

    /// Never restart.
    Temporary,

    /// Restart only if the subscription failed or panicked.
    #[default]
    Transient,
}

/// How a supervised subscription ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The subscription returned `Ok` on its own.
    Completed,

    /// The subscription lost its transport.
    Failed(TransportError),

    /// The subscription task panicked.
    Panicked(String),

    /// The supervisor was asked to stop.
    Shutdown,
}

impl TerminationReason {
    /// Returns `true` for failures and panics.
    #[must_use]
    pub const fn is_abnormal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Panicked(_))
    }
}

impl RestartPolicy {
    /// Decides whether to restart after `reason`.
    #[must_use]
    pub const fn should_restart(&self, reason: &TerminationReason) -> bool {
        if matches!(reason, TerminationReason::Shutdown) {
            return false;
        }

        match self {
            Self::Permanent => true,
            Self::Temporary => false,
            Self::Transient => reason.is_abnormal(),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permanent => write!(f, "permanent"),
            Self::Temporary => write!(f, "temporary"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed(err) => write!(f, "failed: {err}"),
            Self::Panicked(msg) => write!(f, "panicked: {msg}"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}
