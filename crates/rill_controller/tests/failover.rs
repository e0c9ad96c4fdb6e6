//! Failover integration tests: workflow adoption after an instance crash,
//! fencing of superseded owners, and idempotent recovery re-drives.

mod common;

use std::time::Duration;

use common::{
    assert_partition, read_workflow_phase, setup_stream, wait_scale_done, TestCluster,
};
use rill_controller::model::KeyRange;
use rill_meta::{Expected, Fence, LocalOwnership, MemoryMetaStore, MetaStore, Ownership, StoreError};

const LONG: Duration = Duration::from_secs(600);
const SCALE_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn scale_resumes_on_second_instance_from_persisted_phase() {
    let cluster = TestCluster::new();
    let c1 = cluster.controller("c1");
    let stream = setup_stream(&c1, "sales", "failover", 2).await;

    // Open transaction parks the workflow in Sealing.
    let (txn, _) = c1
        .create_transaction(&stream, LONG, LONG, LONG)
        .await
        .unwrap();
    c1.start_scale(
        &stream,
        &[0],
        &[KeyRange::new(0.0, 0.25), KeyRange::new(0.25, 0.5)],
    )
    .await
    .unwrap();
    assert!(!c1.check_scale_status(&stream, 0).await.unwrap());
    assert_eq!(
        read_workflow_phase(&cluster.store, &stream).await.as_deref(),
        Some("Sealing")
    );

    // Crash the instance that started the scale.
    c1.halt();

    // A second instance against the same store and lock service adopts the
    // workflow after the takeover window.
    let c2 = cluster.controller("c2");
    tokio::time::sleep(Duration::from_millis(600)).await;

    // Resumed from the persisted phase, never from Planned, and the seal
    // barrier still holds while the transaction is open.
    assert_eq!(
        read_workflow_phase(&cluster.store, &stream).await.as_deref(),
        Some("Sealing")
    );
    assert!(!c2.check_scale_status(&stream, 0).await.unwrap());

    // Closing the transaction lets the adopted workflow commit.
    c2.abort_transaction(&stream, txn).await.expect("abort via c2");
    assert!(
        wait_scale_done(&c2, &stream, 0, SCALE_DEADLINE).await,
        "adopted workflow did not commit"
    );

    let segments = c2.current_segments(&stream).await.unwrap();
    assert_eq!(segments.len(), 3);
    assert_partition(&segments);
}

#[tokio::test]
async fn superseded_owner_writes_are_fenced_out() {
    // Two simulated owners of the same stream resource: only writes from
    // the higher token are ever applied.
    let store = MemoryMetaStore::new();
    let ownership = LocalOwnership::new();
    let resource = "stream/sales/fenced";

    let old_token = ownership.acquire(resource).await;
    let old_fence = Fence::new(resource, old_token);
    store
        .conditional_write(
            "stream/sales/fenced/scale",
            Expected::Absent,
            bytes::Bytes::from_static(b"{\"owner\":\"old\"}"),
            Some(&old_fence),
        )
        .await
        .expect("first owner writes");

    let new_token = ownership.acquire(resource).await;
    assert!(new_token > old_token);
    assert!(!ownership.is_current(resource, old_token).await);
    let new_fence = Fence::new(resource, new_token);
    let version = store
        .read("stream/sales/fenced/scale")
        .await
        .unwrap()
        .unwrap()
        .1;
    store
        .conditional_write(
            "stream/sales/fenced/scale",
            Expected::Version(version),
            bytes::Bytes::from_static(b"{\"owner\":\"new\"}"),
            Some(&new_fence),
        )
        .await
        .expect("new owner writes");

    // The old owner retries with a valid version but a stale token: the
    // store must reject it outright.
    let version = store
        .read("stream/sales/fenced/scale")
        .await
        .unwrap()
        .unwrap()
        .1;
    let err = store
        .conditional_write(
            "stream/sales/fenced/scale",
            Expected::Version(version),
            bytes::Bytes::from_static(b"{\"owner\":\"old-again\"}"),
            Some(&old_fence),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Fenced { .. }));

    let (value, _) = store
        .read("stream/sales/fenced/scale")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, bytes::Bytes::from_static(b"{\"owner\":\"new\"}"));
}

#[tokio::test]
async fn recovery_redrive_creates_no_duplicate_epochs() {
    let cluster = TestCluster::new();
    let controller = cluster.controller("c1");
    let stream = setup_stream(&controller, "sales", "redrive", 2).await;

    controller
        .start_scale(
            &stream,
            &[0],
            &[KeyRange::new(0.0, 0.25), KeyRange::new(0.25, 0.5)],
        )
        .await
        .unwrap();
    assert!(wait_scale_done(&controller, &stream, 0, SCALE_DEADLINE).await);
    let before = controller.current_segments(&stream).await.unwrap();

    // Re-running recovery over the committed workflow must change nothing:
    // no duplicate segments, no extra epoch.
    for _ in 0..3 {
        controller.recover_now().await.expect("recovery pass");
    }
    let after = controller.current_segments(&stream).await.unwrap();
    assert_eq!(before, after);
    assert!(controller.check_scale_status(&stream, 0).await.unwrap());
    assert!(matches!(
        controller.segments_at_epoch(&stream, 2).await,
        Err(rill_controller::ControllerError::EpochNotFound { .. })
    ));
}

#[tokio::test]
async fn observed_fence_advances_with_adoption() {
    let cluster = TestCluster::new();
    let c1 = cluster.controller("c1");
    let stream = setup_stream(&c1, "sales", "tokens", 2).await;

    let (_txn, _) = c1
        .create_transaction(&stream, LONG, LONG, LONG)
        .await
        .unwrap();
    c1.start_scale(
        &stream,
        &[0],
        &[KeyRange::new(0.0, 0.25), KeyRange::new(0.25, 0.5)],
    )
    .await
    .unwrap();

    let resource = format!("stream/{stream}");
    let first = cluster
        .store
        .observed_fence(&resource)
        .await
        .expect("fence registered by the first owner");

    c1.halt();
    let _c2 = cluster.controller("c2");
    tokio::time::sleep(Duration::from_millis(600)).await;

    let second = cluster
        .store
        .observed_fence(&resource)
        .await
        .expect("fence registered by the adopter");
    assert!(
        second > first,
        "adoption must register a strictly greater fencing token"
    );
}
