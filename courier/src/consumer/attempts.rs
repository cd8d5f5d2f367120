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

use std::hash::{DefaultHasher, Hash, Hasher};

use dashmap::DashMap;

/// Counts failed attempts per message when the transport does not.
///
/// Messages are keyed by a digest of their frame bytes and forgotten once
/// settled for good. Byte-identical messages in flight at the same time share
/// a count.
#[derive(Debug, Default)]
pub(crate) struct AttemptTracker {
    failures: DashMap<u64, u32>,
}

impl AttemptTracker {
    fn digest(body: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        body.hash(&mut hasher);
        hasher.finish()
    }

    /// Failed attempts seen so far.
    pub(crate) fn observed(&self, body: &[u8]) -> u32 {
        self.failures
            .get(&Self::digest(body))
            .map_or(0, |count| *count)
    }

    /// Records a failure that is being requeued.
    pub(crate) fn record_failure(&self, body: &[u8]) {
        *self.failures.entry(Self::digest(body)).or_insert(0) += 1;
    }

    /// Drops the count once the message is acked.
    pub(crate) fn forget(&self, body: &[u8]) {
        self.failures.remove(&Self::digest(body));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.failures.len()
    }
}
