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

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::dispatch::Dispatcher;
use super::state::{ConsumerState, StateCell};
use super::ConsumerConfig;
use crate::common::{ConsumerStats, TransportError};
use crate::traits::DeliveryStream;

/// Handle to a running consumer subscription.
///
/// Dropping the handle does not stop the subscription; call
/// [`stop`](Self::stop) or [`shutdown`](Self::shutdown).
#[derive(Debug)]
pub struct ConsumerHandle {
    state: Arc<StateCell>,
    cancel: CancellationToken,
    stats: Arc<ConsumerStats>,
    task: JoinHandle<Result<(), TransportError>>,
}

impl ConsumerHandle {
    pub(crate) const fn new(
        state: Arc<StateCell>,
        cancel: CancellationToken,
        stats: Arc<ConsumerStats>,
        task: JoinHandle<Result<(), TransportError>>,
    ) -> Self {
        Self {
            state,
            cancel,
            stats,
            task,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.state.get()
    }

    /// Consumer counters.
    #[must_use]
    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Requests a graceful stop. Deliveries already taken are settled first.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once the receive loop has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the receive loop to end and returns how it ended.
    ///
    /// # Errors
    ///
    /// The [`TransportError`] that terminated the subscription.
    pub async fn join(self) -> Result<(), TransportError> {
        flatten(self.task.await)
    }

    /// Stops the consumer and waits for it to drain.
    pub async fn shutdown(self) -> Result<(), TransportError> {
        self.stop();
        self.join().await
    }
}

fn flatten(joined: Result<Result<(), TransportError>, JoinError>) -> Result<(), TransportError> {
    joined.unwrap_or_else(|err| {
        error!(error = %err, "Consumer task failed");
        Err(TransportError::Other(format!("consumer task failed: {err}")))
    })
}

/// One delivery at a time. Cancellation is only observed between
/// deliveries, so the current one is always settled.
pub(crate) async fn receive_serial(
    dispatcher: &Dispatcher,
    mut stream: DeliveryStream,
    state: &StateCell,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    loop {
        state.set(ConsumerState::Receiving);
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(queue = %dispatcher.queue, "Consumer stopped");
                return Ok(());
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                state.set(ConsumerState::Dispatching);
                if let Err(err) = dispatcher.process(delivery).await {
                    error!(queue = %dispatcher.queue, error = %err, "Failed to settle delivery");
                    return Err(err);
                }
            }
            Some(Err(err)) => {
                error!(queue = %dispatcher.queue, error = %err, "Subscription failed");
                return Err(err);
            }
            None => {
                error!(queue = %dispatcher.queue, "Delivery stream ended");
                return Err(TransportError::ConnectionClosed);
            }
        }
    }
}

/// Up to `concurrency` deliveries in flight, each settled by its own task.
pub(crate) async fn receive_concurrent(
    dispatcher: &Arc<Dispatcher>,
    mut stream: DeliveryStream,
    config: &ConsumerConfig,
    state: &StateCell,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    let permits = Arc::new(Semaphore::new(config.concurrency));
    let mut in_flight: JoinSet<Result<(), TransportError>> = JoinSet::new();
    let mut result = Ok(());

    loop {
        state.set(if in_flight.is_empty() {
            ConsumerState::Receiving
        } else {
            ConsumerState::Dispatching
        });

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = flatten(joined) {
                    result = Err(err);
                    break;
                }
                continue;
            }
            permit = Arc::clone(&permits).acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            break;
        };

        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(delivery)) => {
                let dispatcher = Arc::clone(dispatcher);
                in_flight.spawn(async move {
                    let _permit = permit;
                    dispatcher.process(delivery).await
                });
            }
            Some(Err(err)) => {
                error!(queue = %dispatcher.queue, error = %err, "Subscription failed");
                result = Err(err);
                break;
            }
            None => {
                error!(queue = %dispatcher.queue, "Delivery stream ended");
                result = Err(TransportError::ConnectionClosed);
                break;
            }
        }
    }

    state.set(ConsumerState::Dispatching);
    let drained = drain(&mut in_flight, config.drain_timeout).await;
    debug!(queue = %dispatcher.queue, "Consumer stopped");
    result.and(drained)
}

/// Waits for every in-flight task to settle its delivery. Handlers are never
/// aborted; past `warn_after` the wait is only logged.
async fn drain(
    in_flight: &mut JoinSet<Result<(), TransportError>>,
    warn_after: Duration,
) -> Result<(), TransportError> {
    let mut outcome = Ok(());
    let deadline = tokio::time::sleep(warn_after);
    tokio::pin!(deadline);
    let mut warned = false;

    loop {
        tokio::select! {
            joined = in_flight.join_next() => {
                let Some(joined) = joined else {
                    break;
                };
                if let Err(err) = flatten(joined) {
                    error!(error = %err, "Failed to settle delivery while draining");
                    outcome = outcome.and(Err(err));
                }
            }
            () = &mut deadline, if !warned => {
                warned = true;
                warn!(
                    in_flight = in_flight.len(),
                    ?warn_after,
                    "Drain timeout elapsed; still waiting for in-flight handlers"
                );
            }
        }
    }
    outcome
}
