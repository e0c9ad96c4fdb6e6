//! Scale workflow engine: request validation, the seal barrier, and the
//! fenced state machine that reshapes a stream's segment layout.
//!
//! Workflow lifecycle:
//! - `Planned`: intent durably recorded, replacement segment numbers
//!   reserved.
//! - `Sealing`: waiting for open transactions to drain (the seal barrier).
//! - `Creating`: drained at least once; attempting the atomic commit.
//! - `Committed` / `Failed`: terminal.
//!
//! Runtime safety model:
//! - Every workflow write carries the owner's fencing token; the store
//!   rejects writes from a superseded owner.
//! - The commit batch pins the open-transaction index at its drained
//!   version, so a transaction racing the commit conflicts instead of
//!   being sealed over.
//! - All long waits happen here in the background progression loop, never
//!   in a façade call.

use std::sync::Arc;

use tokio::sync::watch;

use rill_meta::{Expected, Fence, StoreError};

use crate::controller::ControllerState;
use crate::error::ControllerError;
use crate::keys;
use crate::model::{
    Epoch, EpochRecord, KeyRange, OpenTxnIndex, ScalePhase, ScaleWorkflow, SegmentDesc,
    SegmentEntry, SegmentNumber, SegmentRegistry, SegmentState, StreamId, StreamRecord, TxnRecord,
};
use crate::store::{list_streams, record_op, Versioned};
use crate::txn::{self, TerminalVerb};
use crate::unix_time_ms;

/// Validate a rescale request against the current active segment set.
///
/// The segments to seal must form a contiguous key-range block, and the
/// replacement ranges must partition exactly that block: no gaps, no
/// overlaps, bounds within `[0, 1]`. Returns the replacement ranges
/// sorted by lower bound.
pub(crate) fn validate_request(
    current: &[SegmentDesc],
    seal: &[SegmentNumber],
    new_ranges: &[KeyRange],
) -> Result<Vec<KeyRange>, ControllerError> {
    if seal.is_empty() {
        return Err(ControllerError::InvalidScaleRequest(
            "no segments to seal".to_string(),
        ));
    }
    let mut seal_sorted = seal.to_vec();
    seal_sorted.sort_unstable();
    if seal_sorted.windows(2).any(|w| w[0] == w[1]) {
        return Err(ControllerError::InvalidScaleRequest(
            "duplicate segment number in seal set".to_string(),
        ));
    }

    let mut sealed = Vec::with_capacity(seal_sorted.len());
    for number in &seal_sorted {
        let Some(desc) = current.iter().find(|s| s.number == *number) else {
            return Err(ControllerError::InvalidScaleRequest(format!(
                "segment {number} is not active in the current epoch"
            )));
        };
        sealed.push(*desc);
    }
    sealed.sort_by(|a, b| a.range.low.total_cmp(&b.range.low));
    for pair in sealed.windows(2) {
        if pair[1].range.low != pair[0].range.high {
            return Err(ControllerError::InvalidScaleRequest(
                "segments to seal must cover a contiguous key-range block".to_string(),
            ));
        }
    }
    let block = KeyRange::new(
        sealed[0].range.low,
        sealed[sealed.len() - 1].range.high,
    );

    if new_ranges.is_empty() {
        return Err(ControllerError::InvalidScaleRequest(
            "no replacement ranges".to_string(),
        ));
    }
    let mut sorted = new_ranges.to_vec();
    sorted.sort_by(|a, b| a.low.total_cmp(&b.low));
    for range in &sorted {
        if !range.is_valid() {
            return Err(ControllerError::InvalidScaleRequest(format!(
                "replacement range {range} is out of bounds"
            )));
        }
    }
    if sorted[0].low != block.low {
        return Err(ControllerError::InvalidScaleRequest(format!(
            "replacement ranges must start at {} (got {})",
            block.low, sorted[0].low
        )));
    }
    for pair in sorted.windows(2) {
        if pair[1].low != pair[0].high {
            return Err(ControllerError::InvalidScaleRequest(format!(
                "replacement ranges leave a gap or overlap between {} and {}",
                pair[0], pair[1]
            )));
        }
    }
    if sorted[sorted.len() - 1].high != block.high {
        return Err(ControllerError::InvalidScaleRequest(format!(
            "replacement ranges must end at {} (got {})",
            block.high,
            sorted[sorted.len() - 1].high
        )));
    }
    Ok(sorted)
}

/// Record a new scale workflow and advance it into `Sealing`.
///
/// Asynchronous contract: this returns once the intent is durable; the
/// background progression loop (or a recovering instance) finishes the
/// work. Returns the target epoch for status polling.
pub(crate) async fn start(
    state: &ControllerState,
    stream: &StreamId,
    seal: &[SegmentNumber],
    new_ranges: &[KeyRange],
) -> Result<Epoch, ControllerError> {
    let Some(stream_rec) = state
        .catalog
        .load::<StreamRecord>(&keys::stream_key(stream))
        .await?
    else {
        return Err(ControllerError::StreamNotFound(stream.clone()));
    };

    let wf_key = keys::workflow_key(stream);
    let existing = state.catalog.load::<ScaleWorkflow>(&wf_key).await?;
    if let Some(wf) = &existing {
        if !wf.record.is_terminal() {
            return Err(ControllerError::ScaleConflict(stream.clone()));
        }
    }

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
    let ranges = validate_request(&epoch_rec.record.segments, seal, new_ranges)?;

    let Some(registry) = state
        .catalog
        .load::<SegmentRegistry>(&keys::registry_key(stream))
        .await?
    else {
        return Err(ControllerError::StoreUnavailable(format!(
            "missing segment registry for stream {stream}"
        )));
    };

    let resource = keys::stream_resource(stream);
    let token = state.ownership.acquire(&resource).await;
    let fence = Fence::new(resource, token);

    let now = unix_time_ms();
    let target = epoch + 1;
    let mut reg = registry.record.clone();
    let create: Vec<SegmentDesc> = ranges
        .iter()
        .map(|range| {
            let number = reg.next_number;
            reg.next_number += 1;
            SegmentDesc {
                number,
                created_epoch: target,
                range: *range,
            }
        })
        .collect();
    let mut seal_sorted = seal.to_vec();
    seal_sorted.sort_unstable();

    let workflow = ScaleWorkflow {
        target_epoch: target,
        seal: seal_sorted,
        create,
        phase: ScalePhase::Planned,
        owner_instance: state.instance.clone(),
        owner_token: token,
        started_unix_ms: now,
        last_progress_unix_ms: now,
    };

    let wf_expected = match &existing {
        Some(wf) => Expected::Version(wf.version),
        None => Expected::Absent,
    };
    let ops = vec![
        record_op(wf_key.clone(), wf_expected, &workflow)?,
        record_op(
            keys::registry_key(stream),
            Expected::Version(registry.version),
            &reg,
        )?,
    ];
    match state.catalog.multi_put(ops, Some(&fence)).await {
        Ok(()) => {}
        Err(StoreError::VersionMismatch { .. }) | Err(StoreError::Fenced { .. }) => {
            return Err(ControllerError::ScaleConflict(stream.clone()));
        }
        Err(err) => return Err(err.into()),
    }
    tracing::info!(
        stream = %stream,
        target_epoch = target,
        sealing = ?workflow.seal,
        "scale workflow recorded"
    );

    // Advance into Sealing before returning; the progression loop re-drives
    // this transition if we crash in between.
    if let Some(wf) = state.catalog.load::<ScaleWorkflow>(&wf_key).await? {
        if wf.record.phase == ScalePhase::Planned && wf.record.owner_token == token {
            if let Err(err) = advance_phase(state, stream, &wf, ScalePhase::Sealing, &fence).await
            {
                tracing::debug!(stream = %stream, error = ?err, "deferred sealing transition");
            }
        }
    }
    Ok(target)
}

/// True once the epoch the stream held when a scale started has been
/// superseded by a committed rescale.
pub(crate) async fn check_status(
    state: &ControllerState,
    stream: &StreamId,
    epoch: Epoch,
) -> Result<bool, ControllerError> {
    let Some(stream_rec) = state
        .catalog
        .load::<StreamRecord>(&keys::stream_key(stream))
        .await?
    else {
        return Err(ControllerError::StreamNotFound(stream.clone()));
    };
    let current = stream_rec.record.current_epoch;
    let mut max_known = current;
    if let Some(wf) = state
        .catalog
        .load::<ScaleWorkflow>(&keys::workflow_key(stream))
        .await?
    {
        if !wf.record.is_terminal() {
            max_known = max_known.max(wf.record.target_epoch);
        }
    }
    if epoch > max_known {
        return Err(ControllerError::EpochNotFound {
            stream: stream.clone(),
            epoch,
        });
    }
    Ok(current > epoch)
}

/// Spawn the background workflow progression loop.
pub(crate) fn spawn_engine(
    state: Arc<ControllerState>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.cfg.scale.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(err) = progress_once(&state).await {
                tracing::warn!(error = ?err, "scale progression failed");
            }
        }
    })
}

pub(crate) async fn progress_once(state: &ControllerState) -> anyhow::Result<()> {
    for stream in list_streams(&state.catalog).await? {
        if let Err(err) = progress_stream(state, &stream).await {
            tracing::warn!(stream = %stream, error = ?err, "scale progression failed for stream");
        }
    }
    Ok(())
}

/// Drive one workflow one step, if this instance owns it.
async fn progress_stream(state: &ControllerState, stream: &StreamId) -> anyhow::Result<()> {
    let Some(wf) = state
        .catalog
        .load::<ScaleWorkflow>(&keys::workflow_key(stream))
        .await?
    else {
        return Ok(());
    };
    if wf.record.is_terminal() {
        return Ok(());
    }
    if wf.record.owner_instance != state.instance {
        // Orphaned workflows are adopted by the recovery coordinator.
        return Ok(());
    }
    let resource = keys::stream_resource(stream);
    if !state
        .ownership
        .is_current(&resource, wf.record.owner_token)
        .await
    {
        tracing::debug!(stream = %stream, "ownership superseded; leaving workflow to the new owner");
        return Ok(());
    }
    let fence = Fence::new(resource, wf.record.owner_token);

    match wf.record.phase {
        ScalePhase::Planned => {
            advance_phase(state, stream, &wf, ScalePhase::Sealing, &fence).await?;
        }
        ScalePhase::Sealing => seal_step(state, stream, &wf, &fence).await?,
        ScalePhase::Creating => commit_step(state, stream, &wf, &fence).await?,
        ScalePhase::Committed | ScalePhase::Failed => {}
    }
    Ok(())
}

/// Seal barrier: hold in `Sealing` until no OPEN transaction remains,
/// aborting transactions that outlived their scale grace period.
async fn seal_step(
    state: &ControllerState,
    stream: &StreamId,
    wf: &Versioned<ScaleWorkflow>,
    fence: &Fence,
) -> anyhow::Result<()> {
    enforce_scale_grace(state, stream).await?;
    let Some(index) = state
        .catalog
        .load::<OpenTxnIndex>(&keys::open_txns_key(stream))
        .await?
    else {
        anyhow::bail!("missing open-transaction index for stream {stream}");
    };
    if index.record.open.is_empty() {
        advance_phase(state, stream, wf, ScalePhase::Creating, fence).await?;
        return Ok(());
    }
    tracing::debug!(
        stream = %stream,
        open = index.record.open.len(),
        "seal barrier waiting for open transactions to drain"
    );
    heartbeat(state, stream, wf, fence).await
}

/// Commit step: one atomic batch seals the old segments, writes the new
/// epoch record, bumps the current-epoch pointer, and marks the workflow
/// committed. The open-transaction index participates at its drained
/// version, so a transaction racing the batch forces a retry instead of
/// ever being sealed over.
async fn commit_step(
    state: &ControllerState,
    stream: &StreamId,
    wf: &Versioned<ScaleWorkflow>,
    fence: &Fence,
) -> anyhow::Result<()> {
    let target = wf.record.target_epoch;
    let epoch_key = keys::epoch_key(stream, target);

    // Replay after a crash or an ownership handover: the epoch may already
    // be committed with only the workflow mark missing.
    if state
        .catalog
        .load::<EpochRecord>(&epoch_key)
        .await?
        .is_some()
    {
        advance_phase(state, stream, wf, ScalePhase::Committed, fence).await?;
        return Ok(());
    }

    let Some(stream_rec) = state
        .catalog
        .load::<StreamRecord>(&keys::stream_key(stream))
        .await?
    else {
        anyhow::bail!("missing stream record for {stream}");
    };
    let Some(cur_epoch) = state
        .catalog
        .load::<EpochRecord>(&keys::epoch_key(stream, stream_rec.record.current_epoch))
        .await?
    else {
        anyhow::bail!(
            "missing epoch record {} for stream {stream}",
            stream_rec.record.current_epoch
        );
    };
    let Some(registry) = state
        .catalog
        .load::<SegmentRegistry>(&keys::registry_key(stream))
        .await?
    else {
        anyhow::bail!("missing segment registry for stream {stream}");
    };

    if let Some(number) = wf
        .record
        .seal
        .iter()
        .find(|n| !cur_epoch.record.segments.iter().any(|s| s.number == **n))
    {
        tracing::error!(
            stream = %stream,
            segment = *number,
            "segment to seal is no longer active; failing workflow"
        );
        advance_phase(state, stream, wf, ScalePhase::Failed, fence).await?;
        return Ok(());
    }

    enforce_scale_grace(state, stream).await?;
    let Some(index) = state
        .catalog
        .load::<OpenTxnIndex>(&keys::open_txns_key(stream))
        .await?
    else {
        anyhow::bail!("missing open-transaction index for stream {stream}");
    };
    if !index.record.open.is_empty() {
        tracing::debug!(
            stream = %stream,
            open = index.record.open.len(),
            "commit waiting for transactions opened during sealing"
        );
        return heartbeat(state, stream, wf, fence).await;
    }

    let now = unix_time_ms();
    let mut segments: Vec<SegmentDesc> = cur_epoch
        .record
        .segments
        .iter()
        .filter(|s| !wf.record.seal.contains(&s.number))
        .copied()
        .collect();
    segments.extend(wf.record.create.iter().copied());
    segments.sort_by(|a, b| a.range.low.total_cmp(&b.range.low));
    let epoch_record = EpochRecord {
        epoch: target,
        segments,
        created_unix_ms: now,
    };

    let mut reg = registry.record.clone();
    for number in &wf.record.seal {
        if let Some(entry) = reg.segments.get_mut(number) {
            entry.state = SegmentState::Sealed;
        }
    }
    for desc in &wf.record.create {
        reg.segments.insert(
            desc.number,
            SegmentEntry {
                desc: *desc,
                state: SegmentState::Active,
            },
        );
    }

    let mut stream_updated = stream_rec.record.clone();
    stream_updated.current_epoch = target;

    let mut committed = wf.record.clone();
    committed.phase = ScalePhase::Committed;
    committed.last_progress_unix_ms = now;

    let ops = vec![
        record_op(epoch_key, Expected::Absent, &epoch_record)?,
        record_op(
            keys::stream_key(stream),
            Expected::Version(stream_rec.version),
            &stream_updated,
        )?,
        record_op(
            keys::registry_key(stream),
            Expected::Version(registry.version),
            &reg,
        )?,
        // Rewritten unchanged: pins the drained index at this version so a
        // racing transaction create conflicts with the whole batch.
        record_op(
            keys::open_txns_key(stream),
            Expected::Version(index.version),
            &index.record,
        )?,
        record_op(
            keys::workflow_key(stream),
            Expected::Version(wf.version),
            &committed,
        )?,
    ];
    match state.catalog.multi_put(ops, Some(fence)).await {
        Ok(()) => {
            tracing::info!(
                stream = %stream,
                epoch = target,
                sealed = ?wf.record.seal,
                created = committed.create.len(),
                "scale committed"
            );
            Ok(())
        }
        Err(StoreError::VersionMismatch { .. }) | Err(StoreError::Fenced { .. }) => {
            tracing::debug!(stream = %stream, "scale commit raced; will retry");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Abort OPEN transactions that have outlived their scale grace period
/// while a rescale is pending, so a long-lived transaction cannot block a
/// scale indefinitely beyond the window it negotiated at creation.
async fn enforce_scale_grace(state: &ControllerState, stream: &StreamId) -> anyhow::Result<()> {
    let Some(index) = state
        .catalog
        .load::<OpenTxnIndex>(&keys::open_txns_key(stream))
        .await?
    else {
        return Ok(());
    };
    let now = unix_time_ms();
    for txn_id in &index.record.open {
        let Some(rec) = state
            .catalog
            .load::<TxnRecord>(&keys::txn_key(stream, *txn_id))
            .await?
        else {
            continue;
        };
        if rec.record.is_open() && rec.record.past_scale_grace(now) {
            tracing::info!(stream = %stream, txn = %txn_id, "aborting transaction past scale grace period");
            match txn::complete(state, stream, *txn_id, TerminalVerb::Abort, true).await {
                Ok(())
                | Err(ControllerError::TransactionAlreadyClosed { .. })
                | Err(ControllerError::TransactionNotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

/// Fenced CAS moving a workflow to `phase`. Returns false when the record
/// moved underneath us or the fence was superseded.
async fn advance_phase(
    state: &ControllerState,
    stream: &StreamId,
    wf: &Versioned<ScaleWorkflow>,
    phase: ScalePhase,
    fence: &Fence,
) -> Result<bool, StoreError> {
    let mut updated = wf.record.clone();
    updated.phase = phase;
    updated.last_progress_unix_ms = unix_time_ms();
    match state
        .catalog
        .put(
            &keys::workflow_key(stream),
            Expected::Version(wf.version),
            &updated,
            Some(fence),
        )
        .await
    {
        Ok(_) => {
            tracing::info!(
                stream = %stream,
                phase = ?phase,
                target_epoch = updated.target_epoch,
                "scale workflow advanced"
            );
            Ok(true)
        }
        Err(StoreError::VersionMismatch { .. }) | Err(StoreError::Fenced { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Bump the workflow heartbeat so recovery can tell a blocked owner from a
/// dead one. Lost races are fine; any successful write refreshed it.
async fn heartbeat(
    state: &ControllerState,
    stream: &StreamId,
    wf: &Versioned<ScaleWorkflow>,
    fence: &Fence,
) -> anyhow::Result<()> {
    let mut updated = wf.record.clone();
    updated.last_progress_unix_ms = unix_time_ms();
    match state
        .catalog
        .put(
            &keys::workflow_key(stream),
            Expected::Version(wf.version),
            &updated,
            Some(fence),
        )
        .await
    {
        Ok(_) | Err(StoreError::VersionMismatch { .. }) | Err(StoreError::Fenced { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
