//! Transactional metadata key-value client.
//!
//! All controller state lives behind this interface: versioned reads,
//! compare-and-swap conditional writes, and atomic multi-key updates.
//! Writes may carry a fence naming a resource and a token; the store
//! remembers the highest token it has observed per resource and rejects
//! writes carrying a lower one. This is what guarantees at most one
//! effective writer per workflow during an ownership handover window.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::ownership::FencingToken;

/// Version of one stored key. Starts at 1 on creation and increments on
/// every successful write to that key.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl Version {
    pub fn next(self) -> Version {
        Version(self.0.saturating_add(1))
    }
}

/// Precondition for a conditional write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expected {
    /// The key must not exist yet.
    Absent,
    /// The key must exist at exactly this version.
    Version(Version),
}

/// Fence attached to writes performed on behalf of a workflow owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fence {
    /// Resource the fence protects, e.g. one stream's workflow state.
    pub resource: String,
    pub token: FencingToken,
}

impl Fence {
    pub fn new(resource: impl Into<String>, token: FencingToken) -> Self {
        Self {
            resource: resource.into(),
            token,
        }
    }
}

/// One key update inside a `multi_write` batch.
#[derive(Clone, Debug)]
pub struct WriteOp {
    pub key: String,
    pub expected: Expected,
    pub value: Bytes,
}

impl WriteOp {
    pub fn new(key: impl Into<String>, expected: Expected, value: Bytes) -> Self {
        Self {
            key: key.into(),
            expected,
            value,
        }
    }
}

/// Store-level failure taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A conditional write lost: the key's version no longer matches.
    #[error("version mismatch on key {key}")]
    VersionMismatch { key: String },
    /// The write carried a fencing token older than the highest observed
    /// for its resource. The caller is no longer the legitimate owner.
    #[error("fenced out on resource {resource}")]
    Fenced { resource: String },
    /// Transient store failure; safe to retry with backoff.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

/// Abstract transactional key-value interface used for all persisted state.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    /// Read one key, returning its value and current version.
    async fn read(&self, key: &str) -> Result<Option<(Bytes, Version)>, StoreError>;

    /// Conditionally write one key. Returns the new version on success.
    async fn conditional_write(
        &self,
        key: &str,
        expected: Expected,
        value: Bytes,
        fence: Option<&Fence>,
    ) -> Result<Version, StoreError>;

    /// Apply a batch of conditional writes atomically: either every op's
    /// precondition holds and every op is applied, or nothing is.
    async fn multi_write(&self, ops: Vec<WriteOp>, fence: Option<&Fence>)
        -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    entries: BTreeMap<String, (Bytes, Version)>,
    /// Highest fencing token observed per resource.
    fences: BTreeMap<String, FencingToken>,
    /// Fault injection: fail this many upcoming writes with `Unavailable`.
    fail_writes: u32,
}

impl MemoryInner {
    fn check_expected(&self, key: &str, expected: Expected) -> Result<Version, StoreError> {
        let current = self.entries.get(key).map(|(_, v)| *v);
        match (expected, current) {
            (Expected::Absent, None) => Ok(Version(1)),
            (Expected::Version(v), Some(cur)) if v == cur => Ok(cur.next()),
            _ => Err(StoreError::VersionMismatch {
                key: key.to_string(),
            }),
        }
    }

    fn check_fence(&mut self, fence: Option<&Fence>) -> Result<(), StoreError> {
        let Some(fence) = fence else {
            return Ok(());
        };
        let highest = self.fences.entry(fence.resource.clone()).or_insert(fence.token);
        if fence.token < *highest {
            return Err(StoreError::Fenced {
                resource: fence.resource.clone(),
            });
        }
        *highest = fence.token;
        Ok(())
    }

    fn take_injected_failure(&mut self) -> Result<(), StoreError> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

/// In-process `MetaStore` with full conditional-write, multi-key, and
/// fencing semantics. Shared across simulated controller instances in
/// tests the way a real deployment shares its coordination service.
#[derive(Default)]
pub struct MemoryMetaStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes with `StoreError::Unavailable`.
    /// Reads are unaffected.
    pub async fn fail_next_writes(&self, count: u32) {
        self.inner.lock().await.fail_writes = count;
    }

    /// Highest fencing token observed for a resource, if any write has
    /// carried one.
    pub async fn observed_fence(&self, resource: &str) -> Option<FencingToken> {
        self.inner.lock().await.fences.get(resource).copied()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn read(&self, key: &str) -> Result<Option<(Bytes, Version)>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(key).cloned())
    }

    async fn conditional_write(
        &self,
        key: &str,
        expected: Expected,
        value: Bytes,
        fence: Option<&Fence>,
    ) -> Result<Version, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.take_injected_failure()?;
        inner.check_fence(fence)?;
        let next = inner.check_expected(key, expected)?;
        inner.entries.insert(key.to_string(), (value, next));
        Ok(next)
    }

    async fn multi_write(
        &self,
        ops: Vec<WriteOp>,
        fence: Option<&Fence>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.take_injected_failure()?;
        inner.check_fence(fence)?;
        // Validate every precondition before mutating anything so a batch
        // is all-or-nothing.
        let mut staged = Vec::with_capacity(ops.len());
        for op in &ops {
            let next = inner.check_expected(&op.key, op.expected)?;
            staged.push(next);
        }
        for (op, next) in ops.into_iter().zip(staged) {
            inner.entries.insert(op.key, (op.value, next));
        }
        Ok(())
    }
}
