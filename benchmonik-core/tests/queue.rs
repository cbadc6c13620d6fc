//! Batched queue traffic against an instrumented broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use benchmonik_core::Error;
use benchmonik_core::backend::{
    Disposition, DynPullQueue, DynPushQueue, MessageEnvelope, PullQueueStorage, PushQueueStorage,
};
use benchmonik_core::batch;
use benchmonik_core::benchmarks::queue::QueueSettings;
use benchmonik_core::benchmarks::{QueueOperation, QueueWorkload};
use benchmonik_core::lifecycle::{IterationOptions, Outcome, Phase, run_iteration};
use benchmonik_core::pool::{Capability, ClientPool};
use benchmonik_core::scenario::ScenarioParameters;
use benchmonik_test::backends::{InstrumentedQueue, QueueFaults};
use futures_util::TryStreamExt;
use tokio_util::sync::CancellationToken;

fn envelopes(count: usize) -> Vec<MessageEnvelope> {
    (0..count)
        .map(|index| MessageEnvelope {
            task_id: format!("task-{index}"),
            session_id: "session".into(),
            options: BTreeMap::new(),
        })
        .collect()
}

async fn pools(
    queue: &InstrumentedQueue,
    runners: usize,
) -> (Arc<ClientPool<DynPushQueue>>, Arc<ClientPool<DynPullQueue>>) {
    let push = ClientPool::<DynPushQueue>::acquire(Capability::PushQueue, runners, |_| {
        let client: Arc<DynPushQueue> = Arc::new(queue.clone());
        Ok(client)
    })
    .await
    .unwrap();
    let pull = ClientPool::<DynPullQueue>::acquire(Capability::PullQueue, runners, |_| {
        let client: Arc<DynPullQueue> = Arc::new(queue.clone());
        Ok(client)
    })
    .await
    .unwrap();
    (Arc::new(push), Arc::new(pull))
}

fn parameters(runners: u64, messages: u64, max: u64) -> ScenarioParameters {
    ScenarioParameters {
        concurrent_runners: runners,
        message_count: messages,
        max_items_per_operation: max,
        ..Default::default()
    }
}

#[tokio::test]
async fn pull_stops_when_partition_runs_dry() {
    benchmonik_test::tracing::init();

    let queue = InstrumentedQueue::new();
    queue.push_messages(envelopes(25), "partition").await.unwrap();

    let outcome = batch::pull_batched(40, 10, |request| {
        let queue = queue.clone();
        async move {
            let stream = queue.pull_messages("partition", request).await?;
            stream.try_collect::<Vec<_>>().await
        }
    })
    .await
    .unwrap();

    assert!(outcome.exhausted());
    assert_eq!(outcome.items.len(), 25);
    assert_eq!(outcome.calls, 3);
    assert_eq!(queue.calls().pulls, [(10, 10), (10, 10), (10, 5)]);

    for mut handle in outcome.items {
        handle.set_disposition(Disposition::Processed).unwrap();
        handle.release().await.unwrap();
    }
    assert_eq!(queue.broker().total(), 0);
}

#[tokio::test]
async fn hundred_messages_in_batches_of_ten() {
    let queue = InstrumentedQueue::new();
    let (push, pull) = pools(&queue, 1).await;
    let parameters = parameters(1, 100, 10);

    let mut workload = QueueWorkload::new(
        QueueOperation::PullMessagesAck,
        push,
        pull,
        &parameters,
        QueueSettings::default(),
    );
    let result = run_iteration(
        &mut workload,
        &IterationOptions::default(),
        None,
        &CancellationToken::new(),
    )
    .await;
    assert!(result.is_success(), "{:?}", result.outcome);
    assert_eq!(result.moved.messages, 100);

    let calls = queue.calls();
    assert_eq!(calls.pushes.len(), 10);
    assert!(
        calls
            .pushes
            .iter()
            .all(|(len, partition)| *len == 10 && partition == "benchmonik-0")
    );

    // Measured pulls drain everything, the cleanup pull finds nothing left.
    assert_eq!(calls.pulls[..10], [(10, 10); 10]);
    assert!(calls.pulls[10..].iter().all(|(_, returned)| *returned == 0));
    assert_eq!(queue.broker().total(), 0);
}

#[tokio::test]
async fn runners_push_to_their_own_partitions() {
    let queue = InstrumentedQueue::new();
    let (push, pull) = pools(&queue, 3).await;
    let parameters = parameters(3, 7, 5);

    let mut workload = QueueWorkload::new(
        QueueOperation::PushMessages,
        push,
        pull,
        &parameters,
        QueueSettings::default(),
    );
    let result = run_iteration(
        &mut workload,
        &IterationOptions::default(),
        None,
        &CancellationToken::new(),
    )
    .await;
    assert!(result.is_success(), "{:?}", result.outcome);
    assert_eq!(result.moved.messages, 21);

    let mut pushes = queue.calls().pushes;
    pushes.sort();
    let mut expected: Vec<(usize, String)> = (0..3)
        .map(|index| format!("benchmonik-{index}"))
        .flat_map(|partition| [(5, partition.clone()), (2, partition)])
        .collect();
    expected.sort();
    assert_eq!(pushes, expected);
    assert_eq!(queue.broker().total(), 0);
}

#[tokio::test]
async fn failed_push_drains_what_was_pushed() {
    let queue = InstrumentedQueue::new();
    let (push, pull) = pools(&queue, 1).await;
    let parameters = parameters(1, 30, 10);
    queue.set_faults(QueueFaults {
        fail_pushes_after: Some(2),
        ..Default::default()
    });

    let mut workload = QueueWorkload::new(
        QueueOperation::PushThenPull,
        push,
        pull,
        &parameters,
        QueueSettings::default(),
    );
    let result = run_iteration(
        &mut workload,
        &IterationOptions::default(),
        None,
        &CancellationToken::new(),
    )
    .await;

    assert!(!result.is_success());
    assert!(matches!(
        result.outcome,
        Outcome::Failed {
            phase: Phase::Measured,
            ..
        }
    ));
    assert_eq!(workload.pushed(), 20);
    assert_eq!(queue.broker().total(), 0);
}

#[tokio::test]
async fn failed_pull_is_reported() {
    let queue = InstrumentedQueue::new();
    let (push, pull) = pools(&queue, 2).await;
    let parameters = parameters(2, 10, 10);

    let mut workload = QueueWorkload::new(
        QueueOperation::PullMessagesNack,
        push,
        pull,
        &parameters,
        QueueSettings::default(),
    );
    queue.set_faults(QueueFaults {
        fail_pulls: true,
        ..Default::default()
    });
    let result = run_iteration(
        &mut workload,
        &IterationOptions::default(),
        None,
        &CancellationToken::new(),
    )
    .await;

    let error = result.error().unwrap();
    assert!(matches!(error, Error::Runners(aggregate) if aggregate.failures.len() == 2));

    // Cleanup could not pull either, so the messages are still queued.
    assert_eq!(queue.broker().total(), 20);
}

/// An acknowledging pull of 20 messages whose second pull call never returns.
fn stalled_ack_workload(
    queue: &InstrumentedQueue,
    push: Arc<ClientPool<DynPushQueue>>,
    pull: Arc<ClientPool<DynPullQueue>>,
) -> QueueWorkload {
    queue.set_faults(QueueFaults {
        stall_pull_call: Some(1),
        ..Default::default()
    });
    QueueWorkload::new(
        QueueOperation::PullMessagesAck,
        push,
        pull,
        &parameters(1, 20, 10),
        QueueSettings::default(),
    )
}

#[tokio::test]
async fn timed_out_pull_requeues_held_messages() {
    benchmonik_test::tracing::init();

    let queue = InstrumentedQueue::new();
    let (push, pull) = pools(&queue, 1).await;
    let mut workload = stalled_ack_workload(&queue, push, pull);

    let options = IterationOptions {
        timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let result = run_iteration(&mut workload, &options, None, &CancellationToken::new()).await;

    assert!(matches!(
        result.outcome,
        Outcome::Failed {
            phase: Phase::Measured,
            error: Error::TimedOut(_),
        }
    ));
    // Both the batch already received and the one held by the stalled call were drained.
    let pulls = queue.calls().pulls;
    assert_eq!(pulls[..2], [(10, 10), (10, 10)]);
    assert_eq!(queue.broker().in_flight("benchmonik-0"), 0);
    assert_eq!(queue.broker().total(), 0);
}

#[tokio::test]
async fn cancelled_pull_requeues_held_messages() {
    benchmonik_test::tracing::init();

    let queue = InstrumentedQueue::new();
    let (push, pull) = pools(&queue, 1).await;
    let mut workload = stalled_ack_workload(&queue, push, pull);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        }
    });
    let result = run_iteration(&mut workload, &IterationOptions::default(), None, &cancel).await;

    assert!(matches!(result.outcome, Outcome::Cancelled), "{:?}", result.outcome);
    assert_eq!(queue.broker().total(), 0);
}

#[tokio::test]
async fn broken_pull_stream_requeues_received_messages() {
    benchmonik_test::tracing::init();

    let queue = InstrumentedQueue::new();
    let (push, pull) = pools(&queue, 1).await;
    queue.set_faults(QueueFaults {
        break_pull_call: Some(0),
        ..Default::default()
    });
    let mut workload = QueueWorkload::new(
        QueueOperation::PullMessagesNack,
        push,
        pull,
        &parameters(1, 20, 10),
        QueueSettings::default(),
    );

    let result = run_iteration(
        &mut workload,
        &IterationOptions::default(),
        None,
        &CancellationToken::new(),
    )
    .await;

    assert!(matches!(
        result.outcome,
        Outcome::Failed {
            phase: Phase::Measured,
            ..
        }
    ));
    assert_eq!(queue.broker().total(), 0);
}
