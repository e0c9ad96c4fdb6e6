//! Coordination substrate for the rill stream controller.
//!
//! This crate provides the two narrow interfaces the controller consumes:
//! a transactional, versioned metadata key-value client (`MetaStore`) and
//! an ownership primitive issuing monotonic fencing tokens (`Ownership`).
//! The API surface is intentionally small: higher layers persist opaque
//! record bytes through `MetaStore` and guard workflow mutations with
//! fencing tokens from `Ownership`.
//!
//! The in-process implementations (`MemoryMetaStore`, `LocalOwnership`)
//! carry the full semantics, including per-resource fence enforcement and
//! write fault injection, so controller behavior can be tested without a
//! real coordination service behind them.

pub mod ownership;
pub mod store;

pub use ownership::{FencingToken, LocalOwnership, Ownership};
pub use store::{
    Expected, Fence, MemoryMetaStore, MetaStore, StoreError, Version, WriteOp,
};
