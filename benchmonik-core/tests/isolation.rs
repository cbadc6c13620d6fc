//! Object benchmarks keep their artifacts apart and clean up after failures.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use benchmonik_core::Error;
use benchmonik_core::backend::DynObjectStorage;
use benchmonik_core::backend::local_fs::LocalFsObjectStorage;
use benchmonik_core::benchmarks::{ObjectOperation, ObjectWorkload, Shape};
use benchmonik_core::lifecycle::{IterationOptions, Outcome, Phase, Workload, run_iteration};
use benchmonik_core::payload;
use benchmonik_core::pool::{Capability, ClientPool, RunnerSlot};
use benchmonik_core::scenario::ScenarioParameters;
use benchmonik_test::backends::{InstrumentedObjectStorage, ObjectFaults};
use tokio_util::sync::CancellationToken;

fn parameters(runners: u64, objects: u64) -> ScenarioParameters {
    ScenarioParameters {
        payload_size: 2048,
        chunk_upload_size: 512,
        chunk_download_size: 512,
        concurrent_runners: runners,
        objects_per_runner: objects,
        ..Default::default()
    }
}

async fn pool(
    storage: &InstrumentedObjectStorage,
    runners: usize,
) -> Arc<ClientPool<DynObjectStorage>> {
    let pool = ClientPool::<DynObjectStorage>::acquire(Capability::ObjectStorage, runners, |_| {
        let client: Arc<DynObjectStorage> = Arc::new(storage.clone());
        Ok(client)
    })
    .await
    .unwrap();
    Arc::new(pool)
}

fn workload(
    operation: ObjectOperation,
    pool: &Arc<ClientPool<DynObjectStorage>>,
    parameters: &ScenarioParameters,
) -> ObjectWorkload {
    let payload = payload::generate(parameters.payload_size);
    ObjectWorkload::new(operation, Shape::Throughput, Arc::clone(pool), parameters, payload)
}

fn session_of(handle: &impl ToString) -> String {
    let handle = handle.to_string();
    let (session, _) = handle.split_once('/').unwrap();
    session.to_owned()
}

#[tokio::test]
async fn runners_use_distinct_sessions() {
    benchmonik_test::tracing::init();

    let storage = InstrumentedObjectStorage::new(512).with_delay(Duration::from_millis(20));
    let parameters = parameters(2, 3);
    let pool = pool(&storage, 2).await;
    let mut workload = workload(ObjectOperation::AddObject, &pool, &parameters);

    let result = run_iteration(
        &mut workload,
        &IterationOptions::default(),
        None,
        &CancellationToken::new(),
    )
    .await;
    assert!(result.is_success(), "{:?}", result.outcome);
    assert_eq!(result.moved.bytes, 2 * 3 * 2048);

    let calls = storage.calls();
    let sessions: BTreeSet<_> = calls.sessions.iter().cloned().collect();
    assert_eq!(sessions.len(), 2);
    assert_eq!(storage.max_concurrent_uploads(), 2);

    // Every delete call stays inside the session of one runner.
    assert_eq!(calls.deletes.len(), 2);
    for handles in &calls.deletes {
        assert_eq!(handles.len(), 3);
        let owners: BTreeSet<_> = handles.iter().map(session_of).collect();
        assert_eq!(owners.len(), 1);
    }
    assert!(storage.store().is_empty());
}

#[tokio::test]
async fn cleanup_leaves_other_iterations_alone() {
    let storage = InstrumentedObjectStorage::new(512);
    let parameters = parameters(2, 2);
    let pool = pool(&storage, 2).await;
    let cancel = CancellationToken::new();

    let mut first = workload(ObjectOperation::GetObject, &pool, &parameters);
    let mut second = workload(ObjectOperation::GetObject, &pool, &parameters);
    first.setup(&cancel).await.unwrap();
    second.setup(&cancel).await.unwrap();
    assert_eq!(storage.store().len(), 8);

    first.cleanup(&cancel).await.unwrap();
    assert_eq!(storage.store().len(), 4);
    for slot in RunnerSlot::range(2) {
        let session = second.session_id(slot);
        assert_eq!(storage.store().handles_for_session(&session).len(), 2);
    }

    second.measured(&cancel).await.unwrap();
    second.cleanup(&cancel).await.unwrap();
    assert!(storage.store().is_empty());
}

#[tokio::test]
async fn measured_failure_still_cleans_up() {
    let storage = InstrumentedObjectStorage::new(512);
    let parameters = parameters(3, 2);
    let pool = pool(&storage, 3).await;
    storage.set_faults(ObjectFaults {
        fail_downloads: true,
        ..Default::default()
    });

    let mut workload = workload(ObjectOperation::GetObject, &pool, &parameters);
    let result = run_iteration(
        &mut workload,
        &IterationOptions::default(),
        None,
        &CancellationToken::new(),
    )
    .await;

    let Outcome::Failed { phase, error } = &result.outcome else {
        panic!("expected failure, got {:?}", result.outcome);
    };
    assert_eq!(*phase, Phase::Measured);
    let Error::Runners(aggregate) = error else {
        panic!("expected runner failures, got {error:?}");
    };
    assert_eq!(aggregate.failures.len(), 3);
    assert!(!result.is_correctness_failure());

    assert_eq!(storage.calls().uploads.len(), 6);
    assert!(storage.store().is_empty());
    assert!(workload.tracker().is_empty());
}

#[tokio::test]
async fn partial_uploads_are_removed() {
    let storage = InstrumentedObjectStorage::new(512);
    let parameters = parameters(2, 3);
    let pool = pool(&storage, 2).await;
    storage.set_faults(ObjectFaults {
        fail_uploads_after: Some(2),
        ..Default::default()
    });

    let mut workload = workload(ObjectOperation::AddObject, &pool, &parameters);
    let result = run_iteration(
        &mut workload,
        &IterationOptions::default(),
        None,
        &CancellationToken::new(),
    )
    .await;

    let Some(Error::Runners(aggregate)) = result.error() else {
        panic!("expected runner failures, got {:?}", result.outcome);
    };
    let slots: Vec<_> = aggregate.failures.iter().map(|(slot, _)| slot.index()).collect();
    assert_eq!(slots, [0, 1]);

    let deleted: usize = storage.calls().deletes.iter().map(Vec::len).sum();
    assert_eq!(deleted, 2);
    assert!(storage.store().is_empty());
}

#[tokio::test]
async fn failed_delete_is_logged_not_reported() {
    let storage = InstrumentedObjectStorage::new(512);
    let parameters = parameters(1, 1);
    let pool = pool(&storage, 1).await;
    storage.set_faults(ObjectFaults {
        fail_deletes: true,
        ..Default::default()
    });

    let mut workload = workload(ObjectOperation::GetObjectSize, &pool, &parameters);
    let result = run_iteration(
        &mut workload,
        &IterationOptions::default(),
        None,
        &CancellationToken::new(),
    )
    .await;

    assert!(result.is_success());
    assert_eq!(storage.store().len(), 1);
}

#[tokio::test]
async fn timed_out_local_uploads_leave_no_files() {
    benchmonik_test::tracing::init();

    let root = tempfile::tempdir().unwrap();
    let parameters = ScenarioParameters {
        payload_size: 64 * 1024 * 1024,
        chunk_upload_size: 64 * 1024,
        chunk_download_size: 64 * 1024,
        concurrent_runners: 2,
        objects_per_runner: 2,
        ..Default::default()
    };
    let pool = ClientPool::<DynObjectStorage>::acquire(Capability::ObjectStorage, 2, |_| {
        let storage = LocalFsObjectStorage::new(root.path(), 64 * 1024);
        let client: Arc<DynObjectStorage> = Arc::new(storage);
        Ok(client)
    })
    .await
    .unwrap();
    let mut workload = workload(ObjectOperation::AddObject, &Arc::new(pool), &parameters);

    let options = IterationOptions {
        timeout: Some(Duration::from_millis(2)),
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

    let leftovers: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "leftover entries: {leftovers:?}");
}
