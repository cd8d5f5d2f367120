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

//! Pending-request table owned by a single task.
//!
//! Callers and the reply loop never share the map: they send commands over
//! one channel, so a registration always reaches the table before any reply
//! to the request it precedes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::common::{bump, RpcClientStats, RpcError};
use crate::message::Frame;

type Waiter = oneshot::Sender<Result<Frame, RpcError>>;

#[derive(Debug)]
enum Command {
    Register { correlation_id: String, waiter: Waiter },
    Resolve { frame: Frame },
    Cancel { correlation_id: String },
    Count { reply: oneshot::Sender<usize> },
    Close,
}

/// Sending half of the pending-request table.
#[derive(Debug, Clone)]
pub(crate) struct PendingTable {
    commands: mpsc::UnboundedSender<Command>,
}

impl PendingTable {
    /// Spawns the task owning the table. It ends when every handle is dropped.
    pub(crate) fn spawn(stats: Arc<RpcClientStats>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_table(receiver, stats));
        Self { commands }
    }

    /// Registers a waiter. Must be called before the request is published.
    pub(crate) fn register(
        &self,
        correlation_id: &str,
    ) -> (oneshot::Receiver<Result<Frame, RpcError>>, PendingGuard) {
        let (waiter, receiver) = oneshot::channel();
        // If the table task is gone the waiter is dropped and the caller sees Closed.
        let _ = self.commands.send(Command::Register {
            correlation_id: correlation_id.to_string(),
            waiter,
        });
        let guard = PendingGuard {
            table: self.clone(),
            correlation_id: Some(correlation_id.to_string()),
        };
        (receiver, guard)
    }

    /// Hands a reply frame to its waiter, if there still is one.
    pub(crate) fn resolve(&self, frame: Frame) {
        let _ = self.commands.send(Command::Resolve { frame });
    }

    /// Fails every waiter with [`RpcError::Closed`], now and for later registrations.
    pub(crate) fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Number of unresolved requests.
    pub(crate) async fn len(&self) -> usize {
        let (reply, count) = oneshot::channel();
        if self.commands.send(Command::Count { reply }).is_err() {
            return 0;
        }
        count.await.unwrap_or(0)
    }
}

/// Removes a pending entry when the call ends without a reply, including
/// when the caller drops the call future.
#[derive(Debug)]
pub(crate) struct PendingGuard {
    table: PendingTable,
    correlation_id: Option<String>,
}

impl PendingGuard {
    /// The entry was resolved; nothing to remove.
    pub(crate) fn disarm(mut self) {
        self.correlation_id = None;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(correlation_id) = self.correlation_id.take() {
            let _ = self.table.commands.send(Command::Cancel { correlation_id });
        }
    }
}

async fn run_table(mut commands: mpsc::UnboundedReceiver<Command>, stats: Arc<RpcClientStats>) {
    let mut pending: HashMap<String, Waiter> = HashMap::new();
    let mut closed = false;

    while let Some(command) = commands.recv().await {
        match command {
            Command::Register {
                correlation_id,
                waiter,
            } => {
                if closed {
                    let _ = waiter.send(Err(RpcError::Closed));
                } else {
                    pending.insert(correlation_id, waiter);
                }
            }
            Command::Resolve { frame } => {
                let waiter = frame
                    .envelope
                    .correlation_id
                    .as_deref()
                    .and_then(|id| pending.remove(id));
                match waiter {
                    Some(waiter) => {
                        trace!(correlation_id = ?frame.envelope.correlation_id, "Resolved pending call");
                        if let Err(Ok(frame)) = waiter.send(Ok(frame)) {
                            bump(&stats.discarded_replies);
                            debug!(
                                correlation_id = ?frame.envelope.correlation_id,
                                "Caller went away before its reply arrived"
                            );
                        }
                    }
                    None => {
                        bump(&stats.discarded_replies);
                        debug!(
                            correlation_id = ?frame.envelope.correlation_id,
                            message_type = %frame.envelope.message_type,
                            "Discarding reply with no pending call"
                        );
                    }
                }
            }
            Command::Cancel { correlation_id } => {
                if pending.remove(&correlation_id).is_some() {
                    trace!(%correlation_id, "Cancelled pending call");
                }
            }
            Command::Count { reply } => {
                let _ = reply.send(pending.len());
            }
            Command::Close => {
                closed = true;
                for (_, waiter) in pending.drain() {
                    let _ = waiter.send(Err(RpcError::Closed));
                }
            }
        }
    }
}
