//! Controller façade: the client-facing operation surface plus the shared
//! state its background managers run against.
//!
//! Every call records intent durably and returns promptly; completion is
//! observed by polling (`check_scale_status`, `transaction_status`), never
//! by blocking the call. A `Controller` value represents one controller
//! instance: dropping or halting it simulates an instance crash, leaving
//! all persisted state for the next instance to recover.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use rill_meta::{Expected, MetaStore, Ownership, StoreError};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::keys;
use crate::model::{
    valid_identifier, Epoch, EpochRecord, KeyRange, OpenTxnIndex, ScopeRecord, SegmentDesc,
    SegmentEntry, SegmentNumber, SegmentRegistry, SegmentState, StreamConfig, StreamId,
    StreamIndex, StreamRecord, TxnStatus,
};
use crate::store::{record_op, Catalog};
use crate::txn::TerminalVerb;
use crate::unix_time_ms;
use crate::{recovery, scale, segments, txn};

/// Bound on optimistic-concurrency retries against the stream index.
const CREATE_CAS_ATTEMPTS: u32 = 16;

/// Shared state consumed by the façade and every background manager.
pub(crate) struct ControllerState {
    pub(crate) instance: String,
    pub(crate) catalog: Catalog,
    pub(crate) ownership: Arc<dyn Ownership>,
    pub(crate) cfg: ControllerConfig,
}

/// One controller instance.
pub struct Controller {
    state: Arc<ControllerState>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Controller {
    /// Construct an instance and spawn its background managers: the
    /// transaction lease sweep, the scale progression loop, and the
    /// failover recovery coordinator.
    pub fn new(
        instance: impl Into<String>,
        store: Arc<dyn MetaStore>,
        ownership: Arc<dyn Ownership>,
        cfg: ControllerConfig,
    ) -> Self {
        let state = Arc::new(ControllerState {
            instance: instance.into(),
            catalog: Catalog::new(store, cfg.store_retry),
            ownership,
            cfg,
        });
        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            txn::spawn_sweeper(state.clone(), rx.clone()),
            scale::spawn_engine(state.clone(), rx.clone()),
            recovery::spawn(state.clone(), rx),
        ];
        tracing::info!(instance = %state.instance, "controller instance started");
        Self {
            state,
            shutdown,
            tasks,
        }
    }

    pub fn instance(&self) -> &str {
        &self.state.instance
    }

    /// Create a scope. Fails with `AlreadyExists` on re-create.
    pub async fn create_scope(&self, scope: &str) -> Result<(), ControllerError> {
        if !valid_identifier(scope) {
            return Err(ControllerError::InvalidArgument(format!(
                "invalid scope name {scope:?}"
            )));
        }
        let record = ScopeRecord {
            created_unix_ms: unix_time_ms(),
        };
        match self
            .state
            .catalog
            .put(&keys::scope_key(scope), Expected::Absent, &record, None)
            .await
        {
            Ok(_) => {
                tracing::info!(scope, "scope created");
                Ok(())
            }
            Err(StoreError::VersionMismatch { .. }) => {
                Err(ControllerError::AlreadyExists(format!("scope {scope}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Create a stream with its epoch-0 segment layout derived from the
    /// configured scaling policy.
    pub async fn create_stream(
        &self,
        stream: &StreamId,
        config: StreamConfig,
    ) -> Result<(), ControllerError> {
        if !valid_identifier(&stream.scope) || !valid_identifier(&stream.name) {
            return Err(ControllerError::InvalidArgument(format!(
                "invalid stream identity {stream:?}"
            )));
        }
        if self
            .state
            .catalog
            .load::<ScopeRecord>(&keys::scope_key(&stream.scope))
            .await?
            .is_none()
        {
            return Err(ControllerError::ScopeNotFound(stream.scope.clone()));
        }

        let now = unix_time_ms();
        let segments: Vec<SegmentDesc> = config
            .scaling
            .initial_ranges()
            .into_iter()
            .enumerate()
            .map(|(i, range)| SegmentDesc {
                number: i as SegmentNumber,
                created_epoch: 0,
                range,
            })
            .collect();
        let registry = SegmentRegistry {
            next_number: segments.len() as SegmentNumber,
            segments: segments
                .iter()
                .map(|desc| {
                    (
                        desc.number,
                        SegmentEntry {
                            desc: *desc,
                            state: SegmentState::Active,
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        };
        let epoch0 = EpochRecord {
            epoch: 0,
            segments,
            created_unix_ms: now,
        };
        let record = StreamRecord {
            config,
            current_epoch: 0,
            created_unix_ms: now,
        };

        let stream_key = keys::stream_key(stream);
        for _ in 0..CREATE_CAS_ATTEMPTS {
            let index = self
                .state
                .catalog
                .load::<StreamIndex>(keys::STREAM_INDEX_KEY)
                .await?;
            let (index_expected, mut updated) = match &index {
                Some(v) => (Expected::Version(v.version), v.record.clone()),
                None => (Expected::Absent, StreamIndex::default()),
            };
            updated.streams.insert(stream.to_string());

            let ops = vec![
                record_op(stream_key.clone(), Expected::Absent, &record)?,
                record_op(keys::registry_key(stream), Expected::Absent, &registry)?,
                record_op(keys::epoch_key(stream, 0), Expected::Absent, &epoch0)?,
                record_op(
                    keys::open_txns_key(stream),
                    Expected::Absent,
                    &OpenTxnIndex::default(),
                )?,
                record_op(keys::STREAM_INDEX_KEY.to_string(), index_expected, &updated)?,
            ];
            match self.state.catalog.multi_put(ops, None).await {
                Ok(()) => {
                    tracing::info!(
                        stream = %stream,
                        segments = epoch0.segments.len(),
                        "stream created"
                    );
                    return Ok(());
                }
                Err(StoreError::VersionMismatch { key }) if key == keys::STREAM_INDEX_KEY => {
                    continue;
                }
                Err(StoreError::VersionMismatch { .. }) => {
                    return Err(ControllerError::AlreadyExists(format!("stream {stream}")));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ControllerError::Conflict(format!(
            "create_stream kept racing on the stream index for {stream}"
        )))
    }

    /// Open a transaction against the stream's current segment set.
    pub async fn create_transaction(
        &self,
        stream: &StreamId,
        lease: Duration,
        max_execution_time: Duration,
        scale_grace_period: Duration,
    ) -> Result<(Uuid, Vec<SegmentDesc>), ControllerError> {
        txn::create(
            &self.state,
            stream,
            lease,
            max_execution_time,
            scale_grace_period,
        )
        .await
    }

    /// Renew an open transaction's lease.
    pub async fn ping_transaction(
        &self,
        stream: &StreamId,
        txn: Uuid,
        lease: Duration,
    ) -> Result<(), ControllerError> {
        txn::ping(&self.state, stream, txn, lease).await
    }

    /// Commit a transaction. Idempotent across retries and failover.
    pub async fn commit_transaction(
        &self,
        stream: &StreamId,
        txn: Uuid,
    ) -> Result<(), ControllerError> {
        txn::complete(&self.state, stream, txn, TerminalVerb::Commit, false).await
    }

    /// Abort a transaction. Idempotent across retries and failover.
    pub async fn abort_transaction(
        &self,
        stream: &StreamId,
        txn: Uuid,
    ) -> Result<(), ControllerError> {
        txn::complete(&self.state, stream, txn, TerminalVerb::Abort, false).await
    }

    pub async fn transaction_status(
        &self,
        stream: &StreamId,
        txn: Uuid,
    ) -> Result<TxnStatus, ControllerError> {
        txn::status(&self.state, stream, txn).await
    }

    /// Start a rescale sealing `segments_to_seal` and creating segments
    /// with `new_ranges`. Returns the target epoch once the intent is
    /// durable; poll `check_scale_status` for completion.
    pub async fn start_scale(
        &self,
        stream: &StreamId,
        segments_to_seal: &[SegmentNumber],
        new_ranges: &[KeyRange],
    ) -> Result<Epoch, ControllerError> {
        scale::start(&self.state, stream, segments_to_seal, new_ranges).await
    }

    /// Whether the given epoch has been superseded by a committed rescale.
    pub async fn check_scale_status(
        &self,
        stream: &StreamId,
        epoch: Epoch,
    ) -> Result<bool, ControllerError> {
        scale::check_status(&self.state, stream, epoch).await
    }

    /// Active segments at the highest committed epoch, ordered by range.
    pub async fn current_segments(
        &self,
        stream: &StreamId,
    ) -> Result<Vec<SegmentDesc>, ControllerError> {
        segments::current_segments(&self.state, stream).await
    }

    /// Active segments at one committed epoch, ordered by range.
    pub async fn segments_at_epoch(
        &self,
        stream: &StreamId,
        epoch: Epoch,
    ) -> Result<Vec<SegmentDesc>, ControllerError> {
        segments::segments_at_epoch(&self.state, stream, epoch).await
    }

    /// Run one recovery pass inline, in addition to the background cadence.
    pub async fn recover_now(&self) -> Result<(), ControllerError> {
        recovery::run_once(&self.state)
            .await
            .map_err(|err| ControllerError::StoreUnavailable(err.to_string()))
    }

    /// Graceful stop: background managers finish their current tick and
    /// exit. Persisted state is untouched.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!(instance = %self.state.instance, "controller instance stopped");
    }

    /// Abrupt stop simulating an instance crash: background tasks are
    /// aborted mid-step and nothing is cleaned up.
    pub fn halt(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!(instance = %self.state.instance, "controller instance halted");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
