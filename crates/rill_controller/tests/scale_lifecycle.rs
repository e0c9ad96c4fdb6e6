//! Scale workflow integration tests: the seal barrier, commit atomicity
//! effects, status monotonicity, and conflict handling.

mod common;

use std::time::Duration;

use common::{assert_partition, setup_stream, wait_scale_done, wait_txn_status, TestCluster};
use rill_controller::model::{KeyRange, TxnStatus};
use rill_controller::ControllerError;

const LONG: Duration = Duration::from_secs(600);
const SCALE_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn scale_completes_without_open_transactions() {
    let cluster = TestCluster::new();
    let controller = cluster.controller("c1");
    let stream = setup_stream(&controller, "sales", "plain", 2).await;

    controller
        .start_scale(
            &stream,
            &[0],
            &[KeyRange::new(0.0, 0.25), KeyRange::new(0.25, 0.5)],
        )
        .await
        .expect("start scale");

    assert!(
        wait_scale_done(&controller, &stream, 0, SCALE_DEADLINE).await,
        "scale did not commit"
    );

    let segments = controller.current_segments(&stream).await.unwrap();
    assert_eq!(segments.len(), 3);
    assert_partition(&segments);

    // Epoch history is immutable: the original layout stays readable.
    let epoch0 = controller.segments_at_epoch(&stream, 0).await.unwrap();
    assert_eq!(epoch0.len(), 2);
    assert_partition(&epoch0);

    // New segment numbers continue past the originals, never reused.
    assert!(segments.iter().filter(|s| s.created_epoch == 1).all(|s| s.number >= 2));
}

#[tokio::test]
async fn seal_barrier_waits_for_open_transaction() {
    let cluster = TestCluster::new();
    let controller = cluster.controller("c1");
    let stream = setup_stream(&controller, "sales", "drain", 2).await;

    let (txn, segments) = controller
        .create_transaction(&stream, LONG, LONG, LONG)
        .await
        .unwrap();
    assert_eq!(segments.len(), 2);

    controller
        .start_scale(
            &stream,
            &[0],
            &[KeyRange::new(0.0, 0.25), KeyRange::new(0.25, 0.5)],
        )
        .await
        .expect("start scale");

    // The workflow must hold in Sealing while the transaction stays open.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        !controller.check_scale_status(&stream, 0).await.unwrap(),
        "scale committed over an open transaction"
    );

    controller.abort_transaction(&stream, txn).await.expect("abort");
    assert!(
        wait_scale_done(&controller, &stream, 0, SCALE_DEADLINE).await,
        "scale did not proceed after the transaction closed"
    );

    let segments = controller.current_segments(&stream).await.unwrap();
    assert_eq!(segments.len(), 3);
    assert_partition(&segments);
}

#[tokio::test]
async fn conflicting_scale_is_rejected_not_queued() {
    let cluster = TestCluster::new();
    let controller = cluster.controller("c1");
    let stream = setup_stream(&controller, "sales", "conflict", 2).await;

    // Keep the first workflow parked in Sealing behind an open transaction.
    let (_txn, _) = controller
        .create_transaction(&stream, LONG, LONG, LONG)
        .await
        .unwrap();
    controller
        .start_scale(
            &stream,
            &[0],
            &[KeyRange::new(0.0, 0.25), KeyRange::new(0.25, 0.5)],
        )
        .await
        .unwrap();

    let err = controller
        .start_scale(&stream, &[1], &[KeyRange::new(0.5, 1.0)])
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::ScaleConflict(_)));
}

#[tokio::test]
async fn check_scale_status_is_monotonic_across_epochs() {
    let cluster = TestCluster::new();
    let controller = cluster.controller("c1");
    let stream = setup_stream(&controller, "sales", "monotonic", 2).await;

    controller
        .start_scale(
            &stream,
            &[0],
            &[KeyRange::new(0.0, 0.25), KeyRange::new(0.25, 0.5)],
        )
        .await
        .unwrap();
    assert!(wait_scale_done(&controller, &stream, 0, SCALE_DEADLINE).await);

    // Merge everything back into one segment at epoch 2.
    let segments = controller.current_segments(&stream).await.unwrap();
    let numbers: Vec<_> = segments.iter().map(|s| s.number).collect();
    controller
        .start_scale(&stream, &numbers, &[KeyRange::new(0.0, 1.0)])
        .await
        .unwrap();
    assert!(wait_scale_done(&controller, &stream, 1, SCALE_DEADLINE).await);

    // Once true for an epoch, true forever.
    assert!(controller.check_scale_status(&stream, 0).await.unwrap());
    assert!(controller.check_scale_status(&stream, 1).await.unwrap());

    let merged = controller.current_segments(&stream).await.unwrap();
    assert_eq!(merged.len(), 1);
    assert_partition(&merged);
}

#[tokio::test]
async fn epoch_beyond_any_generation_is_not_found() {
    let cluster = TestCluster::new();
    let controller = cluster.controller("c1");
    let stream = setup_stream(&controller, "sales", "epochs", 2).await;

    let err = controller.check_scale_status(&stream, 5).await.unwrap_err();
    assert!(matches!(err, ControllerError::EpochNotFound { .. }));

    let err = controller.segments_at_epoch(&stream, 3).await.unwrap_err();
    assert!(matches!(err, ControllerError::EpochNotFound { .. }));
}

#[tokio::test]
async fn malformed_replacement_ranges_are_rejected() {
    let cluster = TestCluster::new();
    let controller = cluster.controller("c1");
    let stream = setup_stream(&controller, "sales", "invalid", 2).await;

    // Gap in the replacement ranges.
    let err = controller
        .start_scale(
            &stream,
            &[0],
            &[KeyRange::new(0.0, 0.2), KeyRange::new(0.3, 0.5)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::InvalidScaleRequest(_)));

    // Rejected requests leave no workflow behind: a valid retry goes
    // straight through.
    controller
        .start_scale(&stream, &[0], &[KeyRange::new(0.0, 0.5)])
        .await
        .expect("valid request after a rejected one");
    assert!(wait_scale_done(&controller, &stream, 0, SCALE_DEADLINE).await);
}

#[tokio::test]
async fn scale_grace_period_unblocks_a_pending_scale() {
    let cluster = TestCluster::new();
    let controller = cluster.controller("c1");
    let stream = setup_stream(&controller, "sales", "grace", 2).await;

    // Long lease, short grace: the transaction may not block the scale
    // past the window it negotiated at creation.
    let (txn, _) = controller
        .create_transaction(&stream, LONG, LONG, Duration::from_millis(200))
        .await
        .unwrap();
    controller
        .start_scale(
            &stream,
            &[0],
            &[KeyRange::new(0.0, 0.25), KeyRange::new(0.25, 0.5)],
        )
        .await
        .unwrap();

    assert!(
        wait_scale_done(&controller, &stream, 0, SCALE_DEADLINE).await,
        "grace enforcement did not unblock the scale"
    );
    assert!(
        wait_txn_status(
            &controller,
            &stream,
            txn,
            TxnStatus::Aborted,
            Duration::from_secs(2)
        )
        .await,
        "blocking transaction was not server-aborted"
    );
}
