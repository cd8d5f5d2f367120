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

use std::any::Any;
use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{RestartLimiter, RestartPolicy, TerminationReason};
use crate::common::{SupervisionError, SupervisorConfig, TransportError};

/// How a supervised subscription finished for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisionReport {
    /// Restarts performed.
    pub restarts: u32,
    /// How the last run ended.
    pub last: TerminationReason,
}

/// Keeps a subscription running according to a [`RestartPolicy`].
///
/// The supervised future is produced by a factory so every restart starts
/// from a fresh subscription. The gateway core never reconnects on its own;
/// this is the optional outer layer that does, and any other supervisor can
/// drive the same `run` futures instead.
///
/// ```rust,ignore
/// let consumer = Consumer::new(transport, registry, config).handle(on_create)?;
/// let supervisor = Supervisor::new("batches", &gateway.supervisor);
/// let shutdown = supervisor.shutdown_token();
/// let report = supervisor.supervise(move |token| consumer.clone().run(token)).await?;
/// ```
#[derive(Debug)]
pub struct Supervisor {
    name: String,
    policy: RestartPolicy,
    limiter: RestartLimiter,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Creates a supervisor from configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, config: &SupervisorConfig) -> Self {
        Self {
            name: name.into(),
            policy: config.restart_policy,
            limiter: RestartLimiter::new(config.restart_limiter.clone()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the supervisor and the running subscription.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs `factory`'s futures until the policy says stop.
    ///
    /// Each run receives a child of the shutdown token and runs on its own
    /// task so a panic is observed as [`TerminationReason::Panicked`].
    ///
    /// # Errors
    ///
    /// * [`SupervisionError::RestartLimitExceeded`] when restarts exhaust the window.
    /// * [`SupervisionError::Terminated`] when a run fails and the policy forbids a restart.
    #[instrument(skip_all, fields(name = %self.name, policy = %self.policy))]
    pub async fn supervise<F, Fut>(mut self, mut factory: F) -> Result<SupervisionReport, SupervisionError>
    where
        F: FnMut(CancellationToken) -> Fut + Send,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        let mut restarts = 0u32;
        loop {
            let started = Instant::now();
            let outcome = tokio::spawn(factory(self.shutdown.child_token())).await;

            let reason = if self.shutdown.is_cancelled() {
                TerminationReason::Shutdown
            } else {
                match outcome {
                    Ok(Ok(())) => TerminationReason::Completed,
                    Ok(Err(err)) => TerminationReason::Failed(err),
                    Err(join) if join.is_panic() => {
                        TerminationReason::Panicked(panic_message(join.into_panic()))
                    }
                    Err(_) => TerminationReason::Shutdown,
                }
            };
            debug!(%reason, "Supervised subscription ended");

            if !self.policy.should_restart(&reason) {
                if reason.is_abnormal() {
                    error!(%reason, "Subscription terminated and will not be restarted");
                    return Err(SupervisionError::Terminated {
                        name: self.name,
                        reason,
                    });
                }
                info!(restarts, %reason, "Supervision finished");
                return Ok(SupervisionReport {
                    restarts,
                    last: reason,
                });
            }

            if started.elapsed() >= self.limiter.config().window() {
                self.limiter.reset_streak();
            }
            if let Err(exceeded) = self.limiter.check() {
                error!(
                    attempts = exceeded.attempts,
                    max_restarts = exceeded.max_restarts,
                    %reason,
                    "Restart limit exceeded"
                );
                return Err(SupervisionError::RestartLimitExceeded {
                    name: self.name,
                    attempts: exceeded.attempts,
                    max_restarts: exceeded.max_restarts,
                    window_secs: exceeded.window_secs,
                    last: reason,
                });
            }

            let delay = self.limiter.record();
            warn!(%reason, ?delay, restart = restarts + 1, "Restarting subscription");
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    return Ok(SupervisionReport {
                        restarts,
                        last: TerminationReason::Shutdown,
                    });
                }
                () = tokio::time::sleep(delay) => {}
            }
            restarts += 1;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
