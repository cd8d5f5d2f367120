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

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier::prelude::*;
use courier::{FaultKind, Frame, FrameKind};
use tokio::sync::mpsc;

use crate::setup::{
    initialize_tracing,
    messages::{broker, commands_topology, registry, BatchClosed, CreateBatch, Unregistered, COMMANDS_EXCHANGE},
    wait_until,
};

mod setup;

/// An event reaches its handler exactly once, is acked, and produces no reply.
#[tokio::test]
async fn test_event_is_handled_once_and_acked() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    let registry = registry()?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let config = ConsumerConfig::new(commands_topology("worker", &[CreateBatch::TYPE])?, 2);
    let handle = Consumer::new(Arc::clone(&transport), registry.clone(), config)
        .handle(move |command: CreateBatch, context: MessageContext| {
            let tx = tx.clone();
            async move {
                tx.send((command.uuid, context.redelivery_count)).ok();
                Ok::<_, HandlerError>(())
            }
        })?
        .start()
        .await?;

    let publisher = Publisher::new(Arc::clone(&transport), registry, COMMANDS_EXCHANGE);
    publisher
        .emit(&CreateBatch {
            uuid: "batch-1".to_string(),
        })
        .await?;

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
    assert_eq!(received, Some(("batch-1".to_string(), 0)));

    let stats = handle.stats();
    wait_until(|| stats.acked() == 1).await?;
    assert_eq!(stats.received(), 1);
    assert_eq!(stats.replies_sent(), 0);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("acme:batches:worker"), Some(0));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "handler ran more than once");

    handle.shutdown().await?;
    Ok(())
}

/// A serial consumer sees messages in publish order.
#[tokio::test]
async fn test_serial_consumer_preserves_order() -> anyhow::Result<()> {
    initialize_tracing();
    let (_broker, transport) = broker();
    let registry = registry()?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let config = ConsumerConfig::new(commands_topology("ordered", &[CreateBatch::TYPE])?, 0);
    let handle = Consumer::new(Arc::clone(&transport), registry.clone(), config)
        .handle(move |command: CreateBatch, _context: MessageContext| {
            let tx = tx.clone();
            async move {
                tx.send(command.uuid).ok();
                Ok::<_, HandlerError>(())
            }
        })?
        .start()
        .await?;

    let publisher = Publisher::new(transport, registry, COMMANDS_EXCHANGE);
    let expected: Vec<String> = (0..20).map(|i| format!("batch-{i}")).collect();
    for uuid in &expected {
        publisher.emit(&CreateBatch { uuid: uuid.clone() }).await?;
    }

    let mut seen = Vec::new();
    while seen.len() < expected.len() {
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
        seen.extend(next);
    }
    assert_eq!(seen, expected);

    handle.shutdown().await?;
    Ok(())
}

/// Context entries set by the publisher arrive with the message, in order.
#[tokio::test]
async fn test_context_travels_with_the_message() -> anyhow::Result<()> {
    initialize_tracing();
    let (_broker, transport) = broker();
    let registry = registry()?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let config = ConsumerConfig::new(commands_topology("context", &[CreateBatch::TYPE])?, 0);
    let handle = Consumer::new(Arc::clone(&transport), registry.clone(), config)
        .handle(move |_command: CreateBatch, context: MessageContext| {
            let tx = tx.clone();
            async move {
                tx.send(context).ok();
                Ok::<_, HandlerError>(())
            }
        })?
        .start()
        .await?;

    Publisher::new(transport, registry, COMMANDS_EXCHANGE)
        .publish(
            &CreateBatch {
                uuid: "batch-ctx".to_string(),
            },
            PublishOptions::default()
                .context("tenant", "t-42")
                .context("trace", "abc"),
        )
        .await?;

    let context = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("handler channel closed"))?;
    assert_eq!(context.message_type, CreateBatch::TYPE);
    assert_eq!(context.correlation_id, None);
    assert_eq!(context.reply_to, None);
    let entries: Vec<(&str, &str)> = context
        .context
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    assert_eq!(entries, vec![("tenant", "t-42"), ("trace", "abc")]);

    handle.shutdown().await?;
    Ok(())
}

/// Bytes that are not a frame are acked and reported, never handed to a handler.
#[tokio::test]
async fn test_malformed_frame_is_reported_as_fault() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    let registry = registry()?;
    let (faults, mut fault_rx) = ChannelFaultSink::new();
    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invoked);

    let config = ConsumerConfig::new(commands_topology("faulty", &[CreateBatch::TYPE])?, 2);
    let handle = Consumer::new(Arc::clone(&transport), registry, config)
        .handle(move |_command: CreateBatch, _context: MessageContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HandlerError>(()) }
        })?
        .with_fault_sink(Arc::new(faults))
        .start()
        .await?;

    transport
        .publish(
            COMMANDS_EXCHANGE,
            CreateBatch::TYPE,
            bytes::Bytes::from_static(b"\x09not a frame"),
        )
        .await?;

    let fault = tokio::time::timeout(Duration::from_secs(1), fault_rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("fault channel closed"))?;
    assert_eq!(fault.queue, "acme:batches:faulty");
    assert!(matches!(fault.kind, FaultKind::Decode(_)));
    assert_eq!(fault.message_type, None);
    assert_eq!(&fault.body[..], b"\x09not a frame");

    let stats = handle.stats();
    wait_until(|| stats.acked() == 1).await?;
    assert_eq!(stats.decode_failures(), 1);
    assert_eq!(stats.requeued(), 0);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(broker.unacked_count(), 0);

    handle.shutdown().await?;
    Ok(())
}

/// A frame naming a type the registry does not know fails closed.
#[tokio::test]
async fn test_unknown_type_is_reported_as_decode_fault() -> anyhow::Result<()> {
    initialize_tracing();
    let (_broker, transport) = broker();
    let registry = registry()?;
    let (faults, mut fault_rx) = ChannelFaultSink::new();

    let config = ConsumerConfig::new(commands_topology("strict", &[Unregistered::TYPE])?, 2);
    let handle = Consumer::new(Arc::clone(&transport), registry, config)
        .handle(|_command: CreateBatch, _context: MessageContext| async {
            Ok::<_, HandlerError>(())
        })?
        .with_fault_sink(Arc::new(faults))
        .start()
        .await?;

    let frame = Frame::new(
        FrameKind::Event,
        Format::Json,
        Envelope::new(Unregistered::TYPE, br#"{"note":"x"}"#.to_vec()),
    );
    transport
        .publish(COMMANDS_EXCHANGE, Unregistered::TYPE, frame.encode()?)
        .await?;

    let fault = tokio::time::timeout(Duration::from_secs(1), fault_rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("fault channel closed"))?;
    assert!(matches!(fault.kind, FaultKind::Decode(DecodeError::UnknownType(ref t)) if t == Unregistered::TYPE));
    assert_eq!(fault.message_type.as_deref(), Some(Unregistered::TYPE));

    handle.shutdown().await?;
    Ok(())
}

/// A registered type with no handler on this queue is acked and reported.
#[tokio::test]
async fn test_message_without_handler_is_reported() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    let registry = registry()?;
    let (faults, mut fault_rx) = ChannelFaultSink::new();

    let config = ConsumerConfig::new(
        commands_topology("partial", &[CreateBatch::TYPE, BatchClosed::TYPE])?,
        2,
    );
    let handle = Consumer::new(Arc::clone(&transport), registry.clone(), config)
        .handle(|_command: CreateBatch, _context: MessageContext| async {
            Ok::<_, HandlerError>(())
        })?
        .with_fault_sink(Arc::new(faults))
        .start()
        .await?;

    Publisher::new(transport, registry, COMMANDS_EXCHANGE)
        .emit(&BatchClosed {
            uuid: "batch-9".to_string(),
            items: 3,
        })
        .await?;

    let fault = tokio::time::timeout(Duration::from_secs(1), fault_rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("fault channel closed"))?;
    assert!(matches!(fault.kind, FaultKind::NoHandler(ref t) if t == BatchClosed::TYPE));

    let stats = handle.stats();
    wait_until(|| stats.acked() == 1).await?;
    assert_eq!(stats.dispatch_failures(), 1);
    assert_eq!(broker.unacked_count(), 0);

    handle.shutdown().await?;
    Ok(())
}

/// Publishing a type missing from the registry fails before anything is sent.
#[tokio::test]
async fn test_publish_of_unregistered_type_fails_fast() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    commands_topology("fail-fast", &[Unregistered::TYPE])?
        .declare(&*transport)
        .await?;

    let publisher = Publisher::new(transport, registry()?, COMMANDS_EXCHANGE);
    let result = publisher
        .emit(&Unregistered {
            note: "never sent".to_string(),
        })
        .await;

    assert!(matches!(
        result,
        Err(PublishError::Schema(SchemaError::UnregisteredType(ref t))) if t == Unregistered::TYPE
    ));
    assert_eq!(broker.queue_depth("acme:batches:fail-fast"), Some(0));
    Ok(())
}

/// Declaring the same topology repeatedly leaves one binding per key.
#[tokio::test]
async fn test_topology_declaration_is_idempotent() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    let topology = commands_topology("repeat", &[CreateBatch::TYPE, BatchClosed::TYPE])?;

    for _ in 0..3 {
        let queue = topology.declare(&*transport).await?;
        assert_eq!(queue.name(), "acme:batches:repeat");
    }
    assert_eq!(broker.binding_count(COMMANDS_EXCHANGE), Some(2));
    Ok(())
}
