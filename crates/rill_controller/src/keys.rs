//! Persisted key layout.
//!
//! Every record lives under a flat string key; index records make
//! enumeration possible through the read/conditional-write interface.

use uuid::Uuid;

use crate::model::{Epoch, StreamId};

/// Global index of created streams.
pub(crate) const STREAM_INDEX_KEY: &str = "streams";

pub(crate) fn scope_key(scope: &str) -> String {
    format!("scope/{scope}")
}

pub(crate) fn stream_key(id: &StreamId) -> String {
    format!("stream/{id}/config")
}

pub(crate) fn registry_key(id: &StreamId) -> String {
    format!("stream/{id}/segments")
}

pub(crate) fn epoch_key(id: &StreamId, epoch: Epoch) -> String {
    format!("stream/{id}/epoch/{epoch}")
}

pub(crate) fn workflow_key(id: &StreamId) -> String {
    format!("stream/{id}/scale")
}

pub(crate) fn txn_key(id: &StreamId, txn: Uuid) -> String {
    format!("stream/{id}/txn/{txn}")
}

pub(crate) fn open_txns_key(id: &StreamId) -> String {
    format!("stream/{id}/txn-open")
}

/// Fencing/ownership resource name for one stream's workflow state.
pub(crate) fn stream_resource(id: &StreamId) -> String {
    format!("stream/{id}")
}
