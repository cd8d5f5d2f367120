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

//! Lock-free counters for consumers and RPC clients.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics for one consumer subscription.
///
/// Every received delivery is settled exactly once, so after a drain
/// `received == acked + requeued` holds (dead-lettered and faulted
/// deliveries are acked).
#[derive(Debug, Default)]
pub struct ConsumerStats {
    /// Deliveries taken from the transport.
    pub received: AtomicUsize,
    /// Deliveries acked, for any reason.
    pub acked: AtomicUsize,
    /// Deliveries nacked back onto the queue.
    pub requeued: AtomicUsize,
    /// Messages routed to the dead-letter sink.
    pub dead_lettered: AtomicUsize,
    /// Frames or payloads that failed to decode.
    pub decode_failures: AtomicUsize,
    /// Decoded messages with no handler on this consumer.
    pub dispatch_failures: AtomicUsize,
    /// Handler invocations that returned an error.
    pub handler_failures: AtomicUsize,
    /// Replies (success or error) published.
    pub replies_sent: AtomicUsize,
    /// Replies that could not be published.
    pub reply_failures: AtomicUsize,
}

macro_rules! counter_getters {
    ($($field:ident => $doc:literal),* $(,)?) => {
        $(
            #[doc = $doc]
            #[must_use]
            pub fn $field(&self) -> usize {
                self.$field.load(Ordering::Relaxed)
            }
        )*
    };
}

impl ConsumerStats {
    /// Create new statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter_getters! {
        received => "Get the number of deliveries received.",
        acked => "Get the number of deliveries acked.",
        requeued => "Get the number of deliveries requeued.",
        dead_lettered => "Get the number of dead-lettered messages.",
        decode_failures => "Get the number of decode failures.",
        dispatch_failures => "Get the number of deliveries without a handler.",
        handler_failures => "Get the number of failed handler invocations.",
        replies_sent => "Get the number of replies published.",
        reply_failures => "Get the number of replies that failed to publish.",
    }
}

/// Statistics for one RPC client.
#[derive(Debug, Default)]
pub struct RpcClientStats {
    /// Calls issued.
    pub calls: AtomicUsize,
    /// Calls resolved by a reply, success or error.
    pub replies: AtomicUsize,
    /// Calls resolved by an error reply.
    pub remote_errors: AtomicUsize,
    /// Calls that timed out.
    pub timeouts: AtomicUsize,
    /// Replies with no waiting call (late, duplicate, or unknown id).
    pub discarded_replies: AtomicUsize,
}

impl RpcClientStats {
    /// Create new statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter_getters! {
        calls => "Get the number of calls issued.",
        replies => "Get the number of calls resolved by a reply.",
        remote_errors => "Get the number of calls resolved by an error reply.",
        timeouts => "Get the number of calls that timed out.",
        discarded_replies => "Get the number of discarded replies.",
    }
}

pub(crate) fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}
