//! Segment table read model, computed from committed epoch records only.

use crate::controller::ControllerState;
use crate::error::ControllerError;
use crate::keys;
use crate::model::{Epoch, EpochRecord, SegmentDesc, StreamId, StreamRecord};

/// Active segments at the highest committed epoch, ordered by range.
pub(crate) async fn current_segments(
    state: &ControllerState,
    stream: &StreamId,
) -> Result<Vec<SegmentDesc>, ControllerError> {
    let Some(stream_rec) = state
        .catalog
        .load::<StreamRecord>(&keys::stream_key(stream))
        .await?
    else {
        return Err(ControllerError::StreamNotFound(stream.clone()));
    };
    let epoch = stream_rec.record.current_epoch;
    segments_at_epoch(state, stream, epoch).await
}

/// Active segments at one committed epoch, ordered by range.
pub(crate) async fn segments_at_epoch(
    state: &ControllerState,
    stream: &StreamId,
    epoch: Epoch,
) -> Result<Vec<SegmentDesc>, ControllerError> {
    if state
        .catalog
        .load::<StreamRecord>(&keys::stream_key(stream))
        .await?
        .is_none()
    {
        return Err(ControllerError::StreamNotFound(stream.clone()));
    }
    let Some(rec) = state
        .catalog
        .load::<EpochRecord>(&keys::epoch_key(stream, epoch))
        .await?
    else {
        return Err(ControllerError::EpochNotFound {
            stream: stream.clone(),
            epoch,
        });
    };
    Ok(rec.record.segments)
}
