//! Failover recovery: adopt orphaned scale workflows and finish
//! half-completed transaction transitions left behind by dead instances.
//!
//! Recovery is crash-safe by construction: every step it drives is a
//! fenced CAS or an idempotent transition, so if the recovering instance
//! dies mid-pass the next instance repeats the same scan and converges.

use std::sync::Arc;

use tokio::sync::watch;

use rill_meta::{Expected, Fence, StoreError};

use crate::controller::ControllerState;
use crate::error::ControllerError;
use crate::keys;
use crate::model::{OpenTxnIndex, ScaleWorkflow, StreamId, TxnRecord, TxnStatus};
use crate::store::list_streams;
use crate::txn::{self, TerminalVerb};
use crate::unix_time_ms;

/// Spawn the recovery coordinator. The first tick fires immediately, so a
/// freshly promoted instance scans for orphaned work before settling into
/// its periodic cadence.
pub(crate) fn spawn(
    state: Arc<ControllerState>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.cfg.recovery.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(err) = run_once(&state).await {
                tracing::warn!(error = ?err, "recovery scan failed");
            }
        }
    })
}

pub(crate) async fn run_once(state: &ControllerState) -> anyhow::Result<()> {
    for stream in list_streams(&state.catalog).await? {
        if let Err(err) = adopt_stale_workflow(state, &stream).await {
            tracing::warn!(stream = %stream, error = ?err, "workflow adoption failed");
        }
        if let Err(err) = finish_pending_transactions(state, &stream).await {
            tracing::warn!(stream = %stream, error = ?err, "pending transaction recovery failed");
        }
    }
    Ok(())
}

/// Take over a non-terminal workflow whose owner is gone: superseded
/// fencing token, or no heartbeat within the takeover window. The adopted
/// workflow resumes from its persisted phase; validation already happened
/// at `start_scale`, so it never restarts from `Planned`.
async fn adopt_stale_workflow(state: &ControllerState, stream: &StreamId) -> anyhow::Result<()> {
    let wf_key = keys::workflow_key(stream);
    let Some(wf) = state.catalog.load::<ScaleWorkflow>(&wf_key).await? else {
        return Ok(());
    };
    if wf.record.is_terminal() {
        return Ok(());
    }

    let resource = keys::stream_resource(stream);
    let token_current = state
        .ownership
        .is_current(&resource, wf.record.owner_token)
        .await;
    if wf.record.owner_instance == state.instance && token_current {
        // Still ours; the progression loop drives it.
        return Ok(());
    }

    let now = unix_time_ms();
    let last = wf
        .record
        .last_progress_unix_ms
        .max(wf.record.started_unix_ms);
    let idle_ms = now.saturating_sub(last);
    let takeover_ms = state
        .cfg
        .recovery
        .takeover_timeout
        .as_millis()
        .min(u128::from(u64::MAX)) as u64;
    if token_current && idle_ms < takeover_ms {
        // Respect a healthy incumbent while its heartbeat is fresh.
        return Ok(());
    }

    let token = state.ownership.acquire(&resource).await;
    let fence = Fence::new(resource, token);
    let mut adopted = wf.record.clone();
    adopted.owner_instance = state.instance.clone();
    adopted.owner_token = token;
    adopted.last_progress_unix_ms = now;
    match state
        .catalog
        .put(&wf_key, Expected::Version(wf.version), &adopted, Some(&fence))
        .await
    {
        Ok(_) => {
            tracing::info!(
                stream = %stream,
                phase = ?adopted.phase,
                token = adopted.owner_token.0,
                previous_owner = %wf.record.owner_instance,
                idle_ms,
                "adopted scale workflow"
            );
        }
        Err(StoreError::VersionMismatch { .. }) | Err(StoreError::Fenced { .. }) => {
            tracing::debug!(stream = %stream, "workflow adoption raced another instance");
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

/// Complete transactions stuck between durable intent and effect,
/// regardless of which instance initiated the transition.
async fn finish_pending_transactions(
    state: &ControllerState,
    stream: &StreamId,
) -> anyhow::Result<()> {
    let Some(index) = state
        .catalog
        .load::<OpenTxnIndex>(&keys::open_txns_key(stream))
        .await?
    else {
        return Ok(());
    };
    for txn_id in &index.record.open {
        let Some(rec) = state
            .catalog
            .load::<TxnRecord>(&keys::txn_key(stream, *txn_id))
            .await?
        else {
            continue;
        };
        let verb = match rec.record.status {
            TxnStatus::Committing => TerminalVerb::Commit,
            TxnStatus::Aborting => TerminalVerb::Abort,
            _ => continue,
        };
        tracing::info!(
            stream = %stream,
            txn = %txn_id,
            status = ?rec.record.status,
            "completing half-finished transaction transition"
        );
        match txn::complete(state, stream, *txn_id, verb, false).await {
            Ok(())
            | Err(ControllerError::TransactionAlreadyClosed { .. })
            | Err(ControllerError::TransactionNotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
