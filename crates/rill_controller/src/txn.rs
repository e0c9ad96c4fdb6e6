//! Transaction lifecycle: create, ping, commit/abort, status, and the
//! background lease sweep.
//!
//! Terminal transitions are two-step:
//! 1. durably record intent (`Open -> Committing | Aborting`)
//! 2. apply the effect: terminal status plus open-index removal, one batch
//!
//! Both steps are compare-and-swap driven and idempotent, so any instance
//! can re-drive a half-finished transition after a crash and a retrying
//! caller never sees a duplicate error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use rill_meta::{Expected, StoreError};

use crate::controller::ControllerState;
use crate::error::ControllerError;
use crate::keys;
use crate::model::{
    EpochRecord, OpenTxnIndex, SegmentDesc, StreamId, StreamRecord, TxnRecord, TxnStatus,
};
use crate::store::{list_streams, record_op, Versioned};
use crate::unix_time_ms;

/// Bound on optimistic-concurrency retries against the open-txn index.
const CAS_ATTEMPTS: u32 = 16;

/// Which terminal state a completion drives toward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TerminalVerb {
    Commit,
    Abort,
}

impl TerminalVerb {
    fn intent(self) -> TxnStatus {
        match self {
            TerminalVerb::Commit => TxnStatus::Committing,
            TerminalVerb::Abort => TxnStatus::Aborting,
        }
    }

    fn terminal(self) -> TxnStatus {
        match self {
            TerminalVerb::Commit => TxnStatus::Committed,
            TerminalVerb::Abort => TxnStatus::Aborted,
        }
    }
}

/// Create an OPEN transaction referencing the stream's current segment
/// set. The record and the open-index update land in one atomic batch.
pub(crate) async fn create(
    state: &ControllerState,
    stream: &StreamId,
    lease: Duration,
    max_execution_time: Duration,
    scale_grace_period: Duration,
) -> Result<(Uuid, Vec<SegmentDesc>), ControllerError> {
    if lease.is_zero() || max_execution_time.is_zero() {
        return Err(ControllerError::InvalidArgument(
            "transaction lease and max execution time must be positive".to_string(),
        ));
    }

    for _ in 0..CAS_ATTEMPTS {
        let Some(stream_rec) = state
            .catalog
            .load::<StreamRecord>(&keys::stream_key(stream))
            .await?
        else {
            return Err(ControllerError::StreamNotFound(stream.clone()));
        };
        let epoch = stream_rec.record.current_epoch;
        let Some(epoch_rec) = state
            .catalog
            .load::<EpochRecord>(&keys::epoch_key(stream, epoch))
            .await?
        else {
            return Err(ControllerError::StoreUnavailable(format!(
                "missing epoch record {epoch} for stream {stream}"
            )));
        };
        let index_key = keys::open_txns_key(stream);
        let Some(index) = state.catalog.load::<OpenTxnIndex>(&index_key).await? else {
            return Err(ControllerError::StoreUnavailable(format!(
                "missing open-transaction index for stream {stream}"
            )));
        };

        let now = unix_time_ms();
        let id = Uuid::new_v4();
        let record = TxnRecord {
            id,
            status: TxnStatus::Open,
            lease_ms: lease.as_millis().min(u128::from(u64::MAX)) as u64,
            max_execution_ms: max_execution_time.as_millis().min(u128::from(u64::MAX)) as u64,
            scale_grace_ms: scale_grace_period.as_millis().min(u128::from(u64::MAX)) as u64,
            created_unix_ms: now,
            last_ping_unix_ms: now,
            epoch,
            server_aborted: false,
        };
        let mut updated = index.record.clone();
        updated.open.insert(id);

        let ops = vec![
            record_op(keys::txn_key(stream, id), Expected::Absent, &record)?,
            record_op(index_key, Expected::Version(index.version), &updated)?,
        ];
        match state.catalog.multi_put(ops, None).await {
            Ok(()) => {
                tracing::debug!(stream = %stream, txn = %id, epoch, "transaction created");
                return Ok((id, epoch_rec.record.segments.clone()));
            }
            // Raced another create/close or a scale commit; re-read and retry.
            Err(StoreError::VersionMismatch { .. }) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(ControllerError::Conflict(format!(
        "create_transaction kept racing on stream {stream}"
    )))
}

/// Extend an OPEN transaction's lease. A lease that has already elapsed
/// cannot be revived.
pub(crate) async fn ping(
    state: &ControllerState,
    stream: &StreamId,
    txn: Uuid,
    lease: Duration,
) -> Result<(), ControllerError> {
    let key = keys::txn_key(stream, txn);
    for _ in 0..CAS_ATTEMPTS {
        let Some(cur) = state.catalog.load::<TxnRecord>(&key).await? else {
            return Err(ControllerError::TransactionNotFound {
                stream: stream.clone(),
                txn,
            });
        };
        if !cur.record.is_open() {
            return Err(ControllerError::TransactionAlreadyClosed {
                txn,
                status: cur.record.status,
            });
        }
        let now = unix_time_ms();
        if cur.record.is_expired(now) {
            return Err(ControllerError::LeaseExpired(txn));
        }

        let mut updated = cur.record.clone();
        updated.last_ping_unix_ms = now;
        updated.lease_ms = lease.as_millis().min(u128::from(u64::MAX)) as u64;
        match state
            .catalog
            .put(&key, Expected::Version(cur.version), &updated, None)
            .await
        {
            Ok(_) => return Ok(()),
            Err(StoreError::VersionMismatch { .. }) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(ControllerError::Conflict(format!(
        "ping kept racing for transaction {txn}"
    )))
}

/// Read-only status lookup.
pub(crate) async fn status(
    state: &ControllerState,
    stream: &StreamId,
    txn: Uuid,
) -> Result<TxnStatus, ControllerError> {
    let Some(cur) = state
        .catalog
        .load::<TxnRecord>(&keys::txn_key(stream, txn))
        .await?
    else {
        return Err(ControllerError::TransactionNotFound {
            stream: stream.clone(),
            txn,
        });
    };
    Ok(cur.record.status)
}

/// Drive a transaction to its terminal state. Idempotent: repeating the
/// verb on an already-terminal transaction succeeds with no side effect;
/// the opposite verb reports the conflicting state.
pub(crate) async fn complete(
    state: &ControllerState,
    stream: &StreamId,
    txn: Uuid,
    verb: TerminalVerb,
    server_initiated: bool,
) -> Result<(), ControllerError> {
    let key = keys::txn_key(stream, txn);
    for _ in 0..CAS_ATTEMPTS {
        let Some(cur) = state.catalog.load::<TxnRecord>(&key).await? else {
            return Err(ControllerError::TransactionNotFound {
                stream: stream.clone(),
                txn,
            });
        };
        match (cur.record.status, verb) {
            (TxnStatus::Open, _) => {
                let mut updated = cur.record.clone();
                updated.status = verb.intent();
                if server_initiated && verb == TerminalVerb::Abort {
                    updated.server_aborted = true;
                }
                match state
                    .catalog
                    .put(&key, Expected::Version(cur.version), &updated, None)
                    .await
                {
                    // Intent durable; next iteration applies the effect.
                    Ok(_) => continue,
                    Err(StoreError::VersionMismatch { .. }) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            (TxnStatus::Committing, TerminalVerb::Commit)
            | (TxnStatus::Aborting, TerminalVerb::Abort) => {
                if apply_effect(state, stream, &cur, verb).await? {
                    return Ok(());
                }
                continue;
            }
            (TxnStatus::Committed, TerminalVerb::Commit)
            | (TxnStatus::Aborted, TerminalVerb::Abort) => return Ok(()),
            (status, _) => {
                return Err(ControllerError::TransactionAlreadyClosed { txn, status });
            }
        }
    }
    Err(ControllerError::Conflict(format!(
        "completion kept racing for transaction {txn}"
    )))
}

/// Effect step: terminal status plus open-index removal in one batch.
/// Returns false when the batch lost an index race and must be rebuilt.
async fn apply_effect(
    state: &ControllerState,
    stream: &StreamId,
    cur: &Versioned<TxnRecord>,
    verb: TerminalVerb,
) -> Result<bool, ControllerError> {
    let mut updated = cur.record.clone();
    updated.status = verb.terminal();

    let index_key = keys::open_txns_key(stream);
    let index = state.catalog.load::<OpenTxnIndex>(&index_key).await?;

    let mut ops = vec![record_op(
        keys::txn_key(stream, cur.record.id),
        Expected::Version(cur.version),
        &updated,
    )?];
    if let Some(index) = index {
        if index.record.open.contains(&cur.record.id) {
            let mut trimmed = index.record.clone();
            trimmed.open.remove(&cur.record.id);
            ops.push(record_op(
                index_key,
                Expected::Version(index.version),
                &trimmed,
            )?);
        }
    }

    match state.catalog.multi_put(ops, None).await {
        Ok(()) => {
            tracing::debug!(
                stream = %stream,
                txn = %cur.record.id,
                status = ?updated.status,
                server_initiated = updated.server_aborted,
                "transaction closed"
            );
            Ok(true)
        }
        Err(StoreError::VersionMismatch { .. }) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Spawn the background lease sweep.
pub(crate) fn spawn_sweeper(
    state: Arc<ControllerState>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.cfg.txn_sweep.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(err) = sweep_once(&state).await {
                tracing::warn!(error = ?err, "transaction lease sweep failed");
            }
        }
    })
}

async fn sweep_once(state: &ControllerState) -> anyhow::Result<()> {
    for stream in list_streams(&state.catalog).await? {
        if let Err(err) = sweep_stream(state, &stream).await {
            tracing::warn!(stream = %stream, error = ?err, "lease sweep failed for stream");
        }
    }
    Ok(())
}

/// Auto-abort any OPEN transaction past its lease or max-execution bound.
async fn sweep_stream(state: &ControllerState, stream: &StreamId) -> anyhow::Result<()> {
    let Some(index) = state
        .catalog
        .load::<OpenTxnIndex>(&keys::open_txns_key(stream))
        .await?
    else {
        return Ok(());
    };
    let now = unix_time_ms();
    for txn in &index.record.open {
        let Some(rec) = state
            .catalog
            .load::<TxnRecord>(&keys::txn_key(stream, *txn))
            .await?
        else {
            continue;
        };
        if rec.record.is_open() && rec.record.is_expired(now) {
            tracing::info!(stream = %stream, txn = %txn, "auto-aborting expired transaction");
            match complete(state, stream, *txn, TerminalVerb::Abort, true).await {
                Ok(()) => {}
                // Raced a concurrent close; nothing left to do.
                Err(ControllerError::TransactionAlreadyClosed { .. })
                | Err(ControllerError::TransactionNotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}
