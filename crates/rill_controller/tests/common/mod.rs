//! Shared helpers for controller integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use rill_controller::config::{
    ControllerConfig, RecoveryConfig, RetryConfig, ScaleEngineConfig, TxnSweepConfig,
};
use rill_controller::model::{
    Epoch, ScalingPolicy, SegmentDesc, StreamConfig, StreamId, TxnStatus,
};
use rill_controller::Controller;
use rill_meta::{LocalOwnership, MemoryMetaStore, MetaStore};

/// Poll cadence used by the wait helpers.
const POLL: Duration = Duration::from_millis(10);

/// Shared coordination backing for any number of simulated controller
/// instances, standing in for the store and lock service a deployment
/// would share.
pub struct TestCluster {
    pub store: Arc<MemoryMetaStore>,
    pub ownership: Arc<LocalOwnership>,
}

impl TestCluster {
    pub fn new() -> Self {
        init_tracing();
        Self {
            store: Arc::new(MemoryMetaStore::new()),
            ownership: Arc::new(LocalOwnership::new()),
        }
    }

    /// Start one controller instance against the shared backing.
    pub fn controller(&self, instance: &str) -> Controller {
        Controller::new(
            instance,
            self.store.clone(),
            self.ownership.clone(),
            fast_config(),
        )
    }
}

/// Tight intervals so workflow progression and failover complete within
/// test deadlines.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        txn_sweep: TxnSweepConfig {
            interval: Duration::from_millis(25),
        },
        scale: ScaleEngineConfig {
            interval: Duration::from_millis(20),
        },
        recovery: RecoveryConfig {
            interval: Duration::from_millis(40),
            takeover_timeout: Duration::from_millis(250),
        },
        store_retry: RetryConfig::default(),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Create a scope and a stream with `segments` fixed initial segments.
pub async fn setup_stream(
    controller: &Controller,
    scope: &str,
    name: &str,
    segments: usize,
) -> StreamId {
    controller.create_scope(scope).await.expect("create scope");
    let id = StreamId::new(scope, name);
    controller
        .create_stream(&id, StreamConfig::new(ScalingPolicy::fixed(segments)))
        .await
        .expect("create stream");
    id
}

/// Wait until `check_scale_status(stream, epoch)` turns true.
pub async fn wait_scale_done(
    controller: &Controller,
    stream: &StreamId,
    epoch: Epoch,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if controller
            .check_scale_status(stream, epoch)
            .await
            .unwrap_or(false)
        {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    false
}

/// Wait until a transaction reports the expected status.
pub async fn wait_txn_status(
    controller: &Controller,
    stream: &StreamId,
    txn: Uuid,
    status: TxnStatus,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if matches!(
            controller.transaction_status(stream, txn).await,
            Ok(observed) if observed == status
        ) {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    false
}

/// Phase string of the persisted scale workflow record, read straight
/// from the shared store.
pub async fn read_workflow_phase(store: &MemoryMetaStore, stream: &StreamId) -> Option<String> {
    let (value, _) = store.read(&format!("stream/{stream}/scale")).await.ok()??;
    let json: serde_json::Value = serde_json::from_slice(&value).ok()?;
    json.get("phase")?.as_str().map(|s| s.to_string())
}

/// Assert the segments are pairwise disjoint and cover `[0, 1)` exactly.
pub fn assert_partition(segments: &[SegmentDesc]) {
    assert!(!segments.is_empty(), "no segments");
    let mut sorted = segments.to_vec();
    sorted.sort_by(|a, b| a.range.low.total_cmp(&b.range.low));
    assert_eq!(sorted[0].range.low, 0.0, "key space must start at 0.0");
    for pair in sorted.windows(2) {
        assert_eq!(
            pair[0].range.high, pair[1].range.low,
            "gap or overlap between {:?} and {:?}",
            pair[0], pair[1]
        );
    }
    assert_eq!(
        sorted[sorted.len() - 1].range.high,
        1.0,
        "key space must end at 1.0"
    );
}
