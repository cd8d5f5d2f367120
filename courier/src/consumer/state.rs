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
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a consumer subscription.
///
/// `Idle → Subscribed → (Receiving ⇄ Dispatching) → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsumerState {
    /// Configured, not yet started.
    Idle = 0,
    /// Topology declared and subscription opened.
    Subscribed = 1,
    /// Waiting for the next delivery.
    Receiving = 2,
    /// Running a handler.
    Dispatching = 3,
    /// The subscription loop has ended.
    Stopped = 4,
}

impl ConsumerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Subscribed,
            2 => Self::Receiving,
            3 => Self::Dispatching,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Subscribed => "subscribed",
            Self::Receiving => "receiving",
            Self::Dispatching => "dispatching",
            Self::Stopped => "stopped",
        })
    }
}

/// Shared, lock-free cell holding a [`ConsumerState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(ConsumerState::Idle as u8))
    }
}

impl StateCell {
    pub(crate) fn get(&self) -> ConsumerState {
        ConsumerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ConsumerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
