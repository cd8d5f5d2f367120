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

use crate::setup::{
    initialize_tracing,
    messages::{broker, commands_topology, registry, BatchClosed, CreateBatch, Unregistered, COMMANDS_EXCHANGE},
    wait_until,
};

mod setup;

/// Tracks how many handler runs overlap.
#[derive(Debug, Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

async fn slow_consumer(
    transport: Arc<dyn Transport>,
    worker: &str,
    concurrency: usize,
    work: Duration,
    tracker: Arc<InFlight>,
) -> anyhow::Result<ConsumerHandle> {
    slow_consumer_draining(transport, worker, concurrency, work, Duration::from_secs(2), tracker).await
}

async fn slow_consumer_draining(
    transport: Arc<dyn Transport>,
    worker: &str,
    concurrency: usize,
    work: Duration,
    drain_timeout: Duration,
    tracker: Arc<InFlight>,
) -> anyhow::Result<ConsumerHandle> {
    let config = ConsumerConfig::new(commands_topology(worker, &[CreateBatch::TYPE])?, 0)
        .with_concurrency(concurrency)
        .with_drain_timeout(drain_timeout);
    Ok(Consumer::new(transport, registry()?, config)
        .handle(move |_command: CreateBatch, _context: MessageContext| {
            let tracker = Arc::clone(&tracker);
            async move {
                tracker.enter();
                tokio::time::sleep(work).await;
                tracker.exit();
                Ok::<_, HandlerError>(())
            }
        })?
        .start()
        .await?)
}

async fn publish_batches(transport: Arc<dyn Transport>, count: usize) -> anyhow::Result<()> {
    let publisher = Publisher::new(transport, registry()?, COMMANDS_EXCHANGE);
    for i in 0..count {
        publisher
            .emit(&CreateBatch {
                uuid: format!("batch-{i}"),
            })
            .await?;
    }
    Ok(())
}

/// A concurrent consumer overlaps handlers but never exceeds its limit.
#[tokio::test]
async fn test_concurrency_is_bounded() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    let tracker = Arc::new(InFlight::default());
    let handle = slow_consumer(
        Arc::clone(&transport),
        "parallel",
        3,
        Duration::from_millis(30),
        Arc::clone(&tracker),
    )
    .await?;

    publish_batches(transport, 9).await?;

    let stats = handle.stats();
    wait_until(|| stats.acked() == 9).await?;
    let peak = tracker.peak.load(Ordering::SeqCst);
    assert!(peak > 1, "handlers never overlapped");
    assert!(peak <= 3, "ran {peak} handlers at once with a limit of 3");
    assert_eq!(broker.unacked_count(), 0);

    handle.shutdown().await?;
    Ok(())
}

/// Stopping a concurrent consumer lets in-flight handlers finish and settle.
#[tokio::test]
async fn test_shutdown_drains_in_flight_handlers() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    let tracker = Arc::new(InFlight::default());
    let handle = slow_consumer(
        Arc::clone(&transport),
        "draining",
        4,
        Duration::from_millis(100),
        Arc::clone(&tracker),
    )
    .await?;

    publish_batches(transport, 3).await?;
    wait_until(|| tracker.started.load(Ordering::SeqCst) == 3).await?;

    let stats = handle.stats();
    handle.shutdown().await?;

    assert_eq!(tracker.finished.load(Ordering::SeqCst), 3);
    assert_eq!(stats.acked(), 3);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("acme:batches:draining"), Some(0));
    Ok(())
}

/// Handlers outliving the drain timeout still run to completion and are acked.
#[tokio::test]
async fn test_drain_timeout_never_abandons_handlers() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    let tracker = Arc::new(InFlight::default());
    let handle = slow_consumer_draining(
        Arc::clone(&transport),
        "overrunning",
        4,
        Duration::from_millis(300),
        Duration::from_millis(20),
        Arc::clone(&tracker),
    )
    .await?;

    publish_batches(transport, 2).await?;
    wait_until(|| tracker.started.load(Ordering::SeqCst) == 2).await?;

    let stats = handle.stats();
    handle.shutdown().await?;

    assert_eq!(tracker.finished.load(Ordering::SeqCst), 2);
    assert_eq!(stats.acked(), 2);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("acme:batches:overrunning"), Some(0));
    Ok(())
}

/// A serial consumer settles the delivery in hand before stopping and leaves
/// the rest queued.
#[tokio::test]
async fn test_serial_stop_leaves_remaining_messages_queued() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    let tracker = Arc::new(InFlight::default());
    let handle = slow_consumer(
        Arc::clone(&transport),
        "serial-stop",
        1,
        Duration::from_millis(100),
        Arc::clone(&tracker),
    )
    .await?;

    publish_batches(transport, 3).await?;
    wait_until(|| tracker.started.load(Ordering::SeqCst) == 1).await?;

    let stats = handle.stats();
    handle.shutdown().await?;

    assert_eq!(tracker.finished.load(Ordering::SeqCst), 1);
    assert_eq!(stats.acked(), 1);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("acme:batches:serial-stop"), Some(2));
    Ok(())
}

/// The handle reports the lifecycle as the consumer moves through it.
#[tokio::test]
async fn test_consumer_state_transitions() -> anyhow::Result<()> {
    initialize_tracing();
    let (_broker, transport) = broker();
    let tracker = Arc::new(InFlight::default());
    let handle = slow_consumer(
        Arc::clone(&transport),
        "stateful",
        1,
        Duration::from_millis(100),
        Arc::clone(&tracker),
    )
    .await?;

    wait_until(|| handle.state() == ConsumerState::Receiving).await?;

    publish_batches(transport, 1).await?;
    wait_until(|| handle.state() == ConsumerState::Dispatching).await?;
    wait_until(|| handle.state() == ConsumerState::Receiving).await?;

    handle.stop();
    wait_until(|| handle.is_finished()).await?;
    assert_eq!(handle.state(), ConsumerState::Stopped);
    assert_eq!(handle.state().to_string(), "stopped");
    handle.join().await?;
    Ok(())
}

/// Losing the broker ends the subscription with a transport error.
#[tokio::test]
async fn test_broker_close_terminates_consumer() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    let tracker = Arc::new(InFlight::default());
    let handle = slow_consumer(transport, "orphaned", 1, Duration::ZERO, tracker).await?;

    broker.close();
    let result = tokio::time::timeout(Duration::from_secs(1), handle.join()).await?;
    assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    Ok(())
}

/// Registration mistakes are caught before any subscription exists.
#[tokio::test]
async fn test_setup_errors() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    let registry = registry()?;
    let config = || -> anyhow::Result<ConsumerConfig> {
        Ok(ConsumerConfig::new(commands_topology("setup", &[CreateBatch::TYPE])?, 1))
    };

    let duplicate = Consumer::new(Arc::clone(&transport), registry.clone(), config()?)
        .handle(|_command: CreateBatch, _context: MessageContext| async { Ok::<_, HandlerError>(()) })?
        .handle(|_command: CreateBatch, _context: MessageContext| async { Ok::<_, HandlerError>(()) });
    assert!(matches!(duplicate, Err(SetupError::DuplicateHandler(ref t)) if t == CreateBatch::TYPE));

    let unregistered = Consumer::new(Arc::clone(&transport), registry.clone(), config()?)
        .handle(|_command: Unregistered, _context: MessageContext| async { Ok::<_, HandlerError>(()) });
    assert!(matches!(unregistered, Err(SetupError::UnregisteredType(ref t)) if t == Unregistered::TYPE));

    let empty = Consumer::new(Arc::clone(&transport), registry.clone(), config()?)
        .start()
        .await;
    assert!(matches!(empty, Err(SetupError::NoHandlers(_))));
    assert!(!broker.queue_exists("acme:batches:setup"));

    let consumer = Consumer::new(transport, registry, config()?)
        .handle(|_command: CreateBatch, _context: MessageContext| async { Ok::<_, HandlerError>(()) })?
        .handle(|_event: BatchClosed, _context: MessageContext| async { Ok::<_, HandlerError>(()) })?;
    let mut handled: Vec<&str> = consumer.handled_types().collect();
    handled.sort_unstable();
    assert_eq!(handled, vec![CreateBatch::TYPE, BatchClosed::TYPE]);
    Ok(())
}

/// A tag registered for one Rust type cannot be handled as another.
#[tokio::test]
async fn test_type_mismatch_is_rejected() -> anyhow::Result<()> {
    #[courier_message("commands.CreateBatch")]
    struct Impostor {
        uuid: String,
    }

    initialize_tracing();
    let (_broker, transport) = broker();
    let config = ConsumerConfig::new(commands_topology("impostor", &[CreateBatch::TYPE])?, 0);
    let result = Consumer::new(transport, registry()?, config)
        .handle(|_command: Impostor, _context: MessageContext| async { Ok::<_, HandlerError>(()) });
    assert!(matches!(result, Err(SetupError::TypeMismatch { .. })));
    Ok(())
}

/// An exclusive queue accepts one subscriber at a time.
#[tokio::test]
async fn test_exclusive_queue_rejects_second_consumer() -> anyhow::Result<()> {
    initialize_tracing();
    let (_broker, transport) = broker();
    let mut topology = commands_topology("exclusive", &[CreateBatch::TYPE])?;
    topology.queue_options = QueueOptions::private();

    let consumer = Consumer::new(transport, registry()?, ConsumerConfig::new(topology, 0))
        .handle(|_command: CreateBatch, _context: MessageContext| async { Ok::<_, HandlerError>(()) })?;
    let first = consumer.clone().start().await?;
    let second = consumer.start().await;
    assert!(matches!(
        second,
        Err(SetupError::Transport(TransportError::ExclusiveQueueInUse(_)))
    ));

    first.shutdown().await?;
    Ok(())
}
