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
use mti::prelude::*;
use static_assertions::assert_impl_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use super::pending::PendingTable;
use crate::common::{
    bump, Address, PublishError, PublishOptions, Publisher, QueueOptions, RpcClientStats,
    RpcConfig, RpcError, SchemaError, SchemaRegistry, SetupError, TransportError,
};
use crate::message::{ErrorReply, Frame};
use crate::traits::{DeliveryStream, Message, Transport};

/// Issues requests and waits for their replies.
///
/// Owns a private, auto-deleting reply queue and a background task that
/// consumes it. Each call registers its correlation id before publishing and
/// then waits on its own deadline, so one slow call never delays another.
///
/// Cheap to clone; the reply queue is released when the last clone is dropped
/// or [`close`](Self::close) is called.
///
/// ```rust,ignore
/// let client = RpcClient::connect(transport, registry, "acme:batches:rpc", "acme", &config.rpc).await?;
/// let batches: Batches = client.call(&BatchesRequest {}, Duration::from_secs(1)).await?;
/// ```
#[derive(Debug, Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

assert_impl_all!(RpcClient: Send, Sync, Clone);

#[derive(Debug)]
struct ClientInner {
    publisher: Publisher,
    reply_queue: String,
    pending: PendingTable,
    stats: Arc<RpcClientStats>,
    default_timeout: Duration,
    shutdown: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl RpcClient {
    /// Declares a private reply queue and starts consuming it.
    ///
    /// Requests are published to `exchange`; the reply queue is named
    /// `<namespace>:rpc:<id>`.
    ///
    /// # Errors
    ///
    /// * [`SetupError::InvalidAddress`] if `namespace` is not a valid segment.
    /// * [`SetupError::Transport`] if the queue cannot be declared or consumed.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        registry: SchemaRegistry,
        exchange: impl Into<String>,
        namespace: &str,
        config: &RpcConfig,
    ) -> Result<Self, SetupError> {
        let reply_queue = Address::new(namespace, "rpc", "reply".create_type_id::<V7>().to_string())?
            .to_string();
        let queue = transport
            .declare_queue(&reply_queue, QueueOptions::private())
            .await?;
        let replies = transport.consume(&queue).await?;

        let stats = Arc::new(RpcClientStats::new());
        let pending = PendingTable::spawn(Arc::clone(&stats));
        let shutdown = CancellationToken::new();
        tokio::spawn(receive_replies(
            Arc::clone(&transport),
            replies,
            pending.clone(),
            shutdown.clone(),
            reply_queue.clone(),
        ));
        debug!(%reply_queue, "RPC client connected");

        Ok(Self {
            inner: Arc::new(ClientInner {
                publisher: Publisher::new(transport, registry, exchange),
                reply_queue,
                pending,
                stats,
                default_timeout: config.default_timeout(),
                shutdown,
            }),
        })
    }

    /// Sends `request` and waits up to `timeout` for the reply.
    ///
    /// # Errors
    ///
    /// * [`RpcError::Timeout`] if no reply arrived in time.
    /// * [`RpcError::Remote`] if the server replied with an error.
    /// * [`RpcError::Publish`] if the request could not be encoded or sent.
    /// * [`RpcError::Decode`] or [`RpcError::UnexpectedReply`] for unusable replies.
    /// * [`RpcError::Closed`] if the reply subscription has ended.
    pub async fn call<Req, Resp>(&self, request: &Req, timeout: Duration) -> Result<Resp, RpcError>
    where
        Req: Message,
        Resp: Message,
    {
        self.call_with(request, PublishOptions::default(), timeout)
            .await
    }

    /// [`call`](Self::call) with the configured default timeout.
    pub async fn call_default<Req, Resp>(&self, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Message,
        Resp: Message,
    {
        self.call(request, self.inner.default_timeout).await
    }

    /// [`call`](Self::call) with a routing key or context. Any request mode
    /// already set in `options` is replaced.
    ///
    /// Correlation ids are UUIDv7-based: a millisecond timestamp plus 74
    /// random bits. Ids are unique per reply queue, which is itself private to
    /// this client, so the time prefix trades random width for ordering in
    /// broker logs.
    #[instrument(skip_all, fields(request = Req::TYPE, response = Resp::TYPE))]
    pub async fn call_with<Req, Resp>(
        &self,
        request: &Req,
        options: PublishOptions,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Message,
        Resp: Message,
    {
        let registry = self.inner.publisher.registry();
        if !registry.is_registered_as::<Resp>() {
            return Err(PublishError::from(SchemaError::UnregisteredType(Resp::TYPE.to_string())).into());
        }

        let correlation_id = "rpc".create_type_id::<V7>().to_string();
        let (reply, guard) = self.inner.pending.register(&correlation_id);
        bump(&self.inner.stats.calls);

        self.inner
            .publisher
            .publish(
                request,
                options.request(correlation_id.clone(), self.inner.reply_queue.clone()),
            )
            .await?;
        trace!(%correlation_id, "Request published");

        let frame = match tokio::time::timeout(timeout, reply).await {
            Err(_) => {
                bump(&self.inner.stats.timeouts);
                debug!(%correlation_id, ?timeout, "RPC call timed out");
                return Err(RpcError::Timeout {
                    correlation_id,
                    timeout,
                });
            }
            Ok(Err(_)) | Ok(Ok(Err(RpcError::Closed))) => return Err(RpcError::Closed),
            Ok(Ok(Err(err))) => return Err(err),
            Ok(Ok(Ok(frame))) => frame,
        };
        guard.disarm();
        bump(&self.inner.stats.replies);
        self.decode_reply(frame)
    }

    fn decode_reply<Resp: Message>(&self, frame: Frame) -> Result<Resp, RpcError> {
        let registry = self.inner.publisher.registry();
        let envelope = &frame.envelope;

        if envelope.message_type == ErrorReply::TYPE {
            let reply: ErrorReply =
                registry.decode(&envelope.message_type, &envelope.payload, frame.format)?;
            bump(&self.inner.stats.remote_errors);
            return Err(RpcError::Remote(reply));
        }
        if envelope.message_type != Resp::TYPE {
            return Err(RpcError::UnexpectedReply {
                expected: Resp::TYPE,
                found: envelope.message_type.clone(),
            });
        }
        Ok(registry.decode(&envelope.message_type, &envelope.payload, frame.format)?)
    }

    /// Name of the private reply queue.
    #[must_use]
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    /// Client counters.
    #[must_use]
    pub fn stats(&self) -> Arc<RpcClientStats> {
        Arc::clone(&self.inner.stats)
    }

    /// Number of calls still waiting for a reply.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.len().await
    }

    /// Stops the reply subscription. Waiting and future calls fail with
    /// [`RpcError::Closed`].
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }
}

/// Acks every reply and hands it to the pending table.
async fn receive_replies(
    transport: Arc<dyn Transport>,
    mut replies: DeliveryStream,
    pending: PendingTable,
    shutdown: CancellationToken,
    reply_queue: String,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                debug!(%reply_queue, "Reply subscription closed");
                break;
            }
            next = replies.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                error!(%reply_queue, error = %err, "Reply subscription failed");
                break;
            }
            None => {
                error!(%reply_queue, error = %TransportError::ConnectionClosed, "Reply subscription ended");
                break;
            }
        };

        let body = delivery.body;
        if let Err(err) = transport.ack(delivery.token).await {
            error!(%reply_queue, error = %err, "Failed to ack reply");
            break;
        }

        match Frame::decode(&body) {
            Ok(frame) if frame.kind.is_reply() => pending.resolve(frame),
            Ok(frame) => warn!(
                %reply_queue,
                kind = ?frame.kind,
                message_type = %frame.envelope.message_type,
                "Ignoring non-reply frame on reply queue"
            ),
            Err(err) => warn!(%reply_queue, error = %err, "Discarding undecodable reply"),
        }
    }
    pending.close();
}
