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
use courier::{RestartLimiterConfig, SupervisionError, SupervisorConfig, TerminationReason};

use crate::setup::{
    initialize_tracing,
    messages::{broker, commands_topology, registry, CreateBatch, COMMANDS_EXCHANGE},
    wait_until,
};

mod setup;

fn quick_restarts(policy: RestartPolicy, max_restarts: u32) -> SupervisorConfig {
    SupervisorConfig {
        restart_policy: policy,
        restart_limiter: RestartLimiterConfig {
            enabled: true,
            max_restarts,
            window_secs: 60,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 1.0,
        },
    }
}

/// Cancelling the shutdown token ends supervision cleanly with no restarts.
#[tokio::test]
async fn test_supervised_consumer_shuts_down_cleanly() -> anyhow::Result<()> {
    initialize_tracing();
    let (_broker, transport) = broker();
    let registry = registry()?;
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);

    let consumer = Consumer::new(
        Arc::clone(&transport),
        registry.clone(),
        ConsumerConfig::new(commands_topology("supervised", &[CreateBatch::TYPE])?, 0),
    )
    .handle(move |_command: CreateBatch, _context: MessageContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, HandlerError>(()) }
    })?;

    let supervisor = Supervisor::new("batches", &quick_restarts(RestartPolicy::Permanent, 3));
    let shutdown = supervisor.shutdown_token();
    let supervised = tokio::spawn(supervisor.supervise(move |token| consumer.clone().run(token)));

    // The subscription is declared by the first run; publishing waits for it.
    let publisher = Publisher::new(transport, registry, COMMANDS_EXCHANGE);
    let mut published = false;
    for _ in 0..100 {
        if publisher
            .emit(&CreateBatch {
                uuid: "supervised".to_string(),
            })
            .await
            .is_ok()
        {
            published = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(published, "exchange was never declared");
    wait_until(|| handled.load(Ordering::SeqCst) == 1).await?;

    shutdown.cancel();
    let report = tokio::time::timeout(Duration::from_secs(1), supervised).await???;
    assert_eq!(report.restarts, 0);
    assert!(matches!(report.last, TerminationReason::Shutdown));
    Ok(())
}

/// A subscription that keeps failing exhausts the restart limit.
#[tokio::test]
async fn test_restart_limit_stops_a_failing_subscription() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    let consumer = Consumer::new(
        transport,
        registry()?,
        ConsumerConfig::new(commands_topology("doomed", &[CreateBatch::TYPE])?, 0),
    )
    .handle(|_command: CreateBatch, _context: MessageContext| async { Ok::<_, HandlerError>(()) })?;

    let supervisor = Supervisor::new("doomed", &quick_restarts(RestartPolicy::Transient, 2));
    let supervised = tokio::spawn(supervisor.supervise(move |token| {
        counter.fetch_add(1, Ordering::SeqCst);
        consumer.clone().run(token)
    }));

    wait_until(|| broker.queue_exists("acme:batches:doomed")).await?;
    broker.close();

    let outcome = tokio::time::timeout(Duration::from_secs(2), supervised).await??;
    match outcome {
        Err(SupervisionError::RestartLimitExceeded {
            name,
            max_restarts,
            last,
            ..
        }) => {
            assert_eq!(name, "doomed");
            assert_eq!(max_restarts, 2);
            assert!(matches!(last, TerminationReason::Failed(TransportError::ConnectionClosed)));
        }
        other => panic!("expected the restart limit to trip, got {other:?}"),
    }
    assert_eq!(runs.load(Ordering::SeqCst), 3, "one run plus two restarts");
    Ok(())
}

/// A temporary subscription is never restarted, even after a failure.
#[tokio::test]
async fn test_temporary_policy_does_not_restart() -> anyhow::Result<()> {
    initialize_tracing();
    let (broker, transport) = broker();
    broker.close();

    let consumer = Consumer::new(
        transport,
        registry()?,
        ConsumerConfig::new(commands_topology("once", &[CreateBatch::TYPE])?, 0),
    )
    .handle(|_command: CreateBatch, _context: MessageContext| async { Ok::<_, HandlerError>(()) })?;

    let supervisor = Supervisor::new("once", &quick_restarts(RestartPolicy::Temporary, 5));
    let outcome = supervisor
        .supervise(move |token| consumer.clone().run(token))
        .await;
    assert!(matches!(
        outcome,
        Err(SupervisionError::Terminated {
            reason: TerminationReason::Failed(TransportError::ConnectionClosed),
            ..
        })
    ));
    Ok(())
}

/// A panicking run is observed and restarted like a failure.
#[tokio::test]
async fn test_panicking_run_is_restarted() -> anyhow::Result<()> {
    initialize_tracing();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    let supervisor = Supervisor::new("panicky", &quick_restarts(RestartPolicy::Transient, 5));
    let report = supervisor
        .supervise(move |_token| {
            let run = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if run == 0 {
                    panic!("first run explodes");
                }
                Ok(())
            }
        })
        .await?;

    assert_eq!(report.restarts, 1);
    assert!(matches!(report.last, TerminationReason::Completed));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    Ok(())
}
