//! Persisted data model: streams, segments, epochs, scale workflows, and
//! transactions.
//!
//! Records are serialized as JSON through the metadata store client.
//! Fields added after first release carry `#[serde(default)]` so older
//! records deserialize cleanly.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rill_meta::FencingToken;

/// Scale generation counter for one stream.
pub type Epoch = u64;
/// Per-stream segment number; allocated monotonically, never reused.
pub type SegmentNumber = u64;

/// Stream identity: `(scope, name)`, immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub scope: String,
    pub name: String,
}

impl StreamId {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }

    /// Parse the `scope/name` form used by index records.
    pub(crate) fn parse(qualified: &str) -> Option<StreamId> {
        let (scope, name) = qualified.split_once('/')?;
        if scope.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(StreamId::new(scope, name))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

/// Identifier validity shared by scope and stream names.
pub(crate) fn valid_identifier(name: &str) -> bool {
    !name.is_empty() && !name.contains('/')
}

/// Half-open interval `[low, high)` of the hashed key space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    pub low: f64,
    pub high: f64,
}

impl KeyRange {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn is_valid(&self) -> bool {
        self.low >= 0.0 && self.low < self.high && self.high <= 1.0
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

/// Scaling policy applied at stream creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingPolicy {
    /// Fixed number of initial segments partitioning `[0, 1)` evenly.
    Fixed { segments: usize },
}

impl ScalingPolicy {
    pub fn fixed(segments: usize) -> Self {
        ScalingPolicy::Fixed { segments }
    }

    pub(crate) fn initial_ranges(&self) -> Vec<KeyRange> {
        match *self {
            ScalingPolicy::Fixed { segments } => {
                let count = segments.max(1);
                (0..count)
                    .map(|i| {
                        KeyRange::new(i as f64 / count as f64, (i + 1) as f64 / count as f64)
                    })
                    .collect()
            }
        }
    }
}

/// Stream configuration supplied to `create_stream`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub scaling: ScalingPolicy,
}

impl StreamConfig {
    pub fn new(scaling: ScalingPolicy) -> Self {
        Self { scaling }
    }
}

/// One segment of a stream's key space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentDesc {
    pub number: SegmentNumber,
    /// Epoch in which this segment was created.
    pub created_epoch: Epoch,
    pub range: KeyRange,
}

/// Lifecycle state of a segment in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    Active,
    Sealed,
}

/// Registry entry for one allocated segment.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub desc: SegmentDesc,
    pub state: SegmentState,
}

/// Per-stream segment allocation state plus lifecycle of every segment
/// ever created for the stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentRegistry {
    pub next_number: SegmentNumber,
    pub segments: BTreeMap<SegmentNumber, SegmentEntry>,
}

/// Immutable record of the active segment set at one committed epoch,
/// ordered by range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: Epoch,
    pub segments: Vec<SegmentDesc>,
    pub created_unix_ms: u64,
}

/// Persisted scope record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScopeRecord {
    pub created_unix_ms: u64,
}

/// Persisted stream record; `current_epoch` moves only when a scale
/// workflow commits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamRecord {
    pub config: StreamConfig,
    pub current_epoch: Epoch,
    pub created_unix_ms: u64,
}

/// Global index of created streams, keyed by the `scope/name` form.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamIndex {
    pub streams: BTreeSet<String>,
}

/// Per-stream index of OPEN transaction ids. Maintained atomically with
/// transaction records so the seal barrier and the lease sweep can
/// enumerate open transactions through the narrow store interface.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OpenTxnIndex {
    pub open: BTreeSet<Uuid>,
}

/// Transaction lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    Open,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

/// Persisted transaction record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxnRecord {
    pub id: Uuid,
    pub status: TxnStatus,
    pub lease_ms: u64,
    pub max_execution_ms: u64,
    pub scale_grace_ms: u64,
    pub created_unix_ms: u64,
    pub last_ping_unix_ms: u64,
    /// Epoch whose segment set the transaction references.
    pub epoch: Epoch,
    /// Set when the controller (lease sweep or scale grace enforcement)
    /// initiated the abort rather than the client.
    #[serde(default)]
    pub server_aborted: bool,
}

impl TxnRecord {
    pub fn is_open(&self) -> bool {
        self.status == TxnStatus::Open
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TxnStatus::Committed | TxnStatus::Aborted)
    }

    /// A transaction is alive only while both its lease window and its
    /// max-execution window hold.
    pub fn is_expired(&self, now_unix_ms: u64) -> bool {
        now_unix_ms >= self.last_ping_unix_ms.saturating_add(self.lease_ms)
            || now_unix_ms >= self.created_unix_ms.saturating_add(self.max_execution_ms)
    }

    /// Past the scale grace period: a pending rescale may abort it.
    pub fn past_scale_grace(&self, now_unix_ms: u64) -> bool {
        now_unix_ms >= self.created_unix_ms.saturating_add(self.scale_grace_ms)
    }
}

/// Phase of a scale workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalePhase {
    Planned,
    Sealing,
    Creating,
    Committed,
    Failed,
}

/// Persisted per-stream scale workflow record. One non-terminal workflow
/// may exist per stream at a time; terminal records are replaced by the
/// next `start_scale`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScaleWorkflow {
    pub target_epoch: Epoch,
    /// Segment numbers to seal, sorted.
    pub seal: Vec<SegmentNumber>,
    /// Replacement segments with pre-allocated numbers, sorted by range.
    pub create: Vec<SegmentDesc>,
    pub phase: ScalePhase,
    pub owner_instance: String,
    pub owner_token: FencingToken,
    pub started_unix_ms: u64,
    /// Heartbeat; bumped by the owning engine even while blocked on the
    /// seal barrier, so recovery can detect a wedged or dead owner.
    #[serde(default)]
    pub last_progress_unix_ms: u64,
}

impl ScaleWorkflow {
    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, ScalePhase::Committed | ScalePhase::Failed)
    }
}
