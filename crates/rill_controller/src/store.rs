//! Typed record access over the metadata store client.
//!
//! Records are JSON-encoded; transient store failures are retried with
//! bounded exponential backoff before surfacing, conflict and fencing
//! failures pass straight through to the caller's CAS loop.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use rill_meta::{Expected, Fence, MetaStore, StoreError, Version, WriteOp};

use crate::config::RetryConfig;
use crate::keys;
use crate::model::{StreamId, StreamIndex};

/// A decoded record together with the store version it was read at.
#[derive(Clone, Debug)]
pub(crate) struct Versioned<T> {
    pub record: T,
    pub version: Version,
}

/// Shared, retry-aware typed store handle.
#[derive(Clone)]
pub(crate) struct Catalog {
    store: Arc<dyn MetaStore>,
    retry: RetryConfig,
}

impl Catalog {
    pub(crate) fn new(store: Arc<dyn MetaStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    pub(crate) async fn load<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.read(key).await {
                Ok(None) => return Ok(None),
                Ok(Some((value, version))) => {
                    let record = decode(key, &value)?;
                    return Ok(Some(Versioned { record, version }));
                }
                Err(StoreError::Unavailable(msg)) if attempt + 1 < self.retry.attempts => {
                    tracing::debug!(key, attempt, error = %msg, "retrying read after transient failure");
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub(crate) async fn put<T: Serialize>(
        &self,
        key: &str,
        expected: Expected,
        record: &T,
        fence: Option<&Fence>,
    ) -> Result<Version, StoreError> {
        let value = encode(key, record)?;
        let mut attempt = 0;
        loop {
            match self
                .store
                .conditional_write(key, expected, value.clone(), fence)
                .await
            {
                Err(StoreError::Unavailable(msg)) if attempt + 1 < self.retry.attempts => {
                    tracing::debug!(key, attempt, error = %msg, "retrying write after transient failure");
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub(crate) async fn multi_put(
        &self,
        ops: Vec<WriteOp>,
        fence: Option<&Fence>,
    ) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.multi_write(ops.clone(), fence).await {
                Err(StoreError::Unavailable(msg)) if attempt + 1 < self.retry.attempts => {
                    tracing::debug!(attempt, error = %msg, "retrying batch after transient failure");
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        self.retry
            .base
            .saturating_mul(1u32 << shift)
            .min(self.retry.max)
    }
}

/// Build one JSON-encoded write op for a batch.
pub(crate) fn record_op<T: Serialize>(
    key: String,
    expected: Expected,
    record: &T,
) -> Result<WriteOp, StoreError> {
    let value = encode(&key, record)?;
    Ok(WriteOp::new(key, expected, value))
}

/// Enumerate created streams through the global index record.
pub(crate) async fn list_streams(catalog: &Catalog) -> Result<Vec<StreamId>, StoreError> {
    let Some(index) = catalog
        .load::<StreamIndex>(keys::STREAM_INDEX_KEY)
        .await?
    else {
        return Ok(Vec::new());
    };
    Ok(index
        .record
        .streams
        .iter()
        .filter_map(|qualified| StreamId::parse(qualified))
        .collect())
}

fn encode<T: Serialize>(key: &str, record: &T) -> Result<Bytes, StoreError> {
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(|err| StoreError::Unavailable(format!("encode record {key}: {err}")))
}

fn decode<T: DeserializeOwned>(key: &str, value: &Bytes) -> Result<T, StoreError> {
    serde_json::from_slice(value)
        .map_err(|err| StoreError::Unavailable(format!("decode record {key}: {err}")))
}
