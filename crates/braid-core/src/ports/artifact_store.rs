//! ArtifactStore port - artifact のバージョン管理
//!
//! artifact の version を進められるのは integrator の commit だけです。
//! 1 batch = 1 transaction（begin → apply* → commit | rollback）。

use crate::domain::{ArtifactId, ArtifactMutation, BatchId, MutationFingerprint};
use crate::error::ApplyError;

/// Versioned artifact storage with batch-level transactions.
///
/// # Contract
/// - `apply` outside a transaction is allowed but cannot be undone.
/// - `rollback` restores artifacts, the applied-mutation ledger and the
///   committed-batch set to their state at `begin`.
/// - version 0 means "never existed".
pub trait ArtifactStore: Send {
    /// Current version (0 if the artifact never existed). Tombstones keep their version.
    fn version(&self, artifact: &ArtifactId) -> u64;

    /// True if the artifact exists and is not deleted.
    fn exists(&self, artifact: &ArtifactId) -> bool;

    fn begin(&mut self);

    /// Applies one mutation and returns the artifact's new version.
    fn apply(
        &mut self,
        fingerprint: &MutationFingerprint,
        mutation: &ArtifactMutation,
    ) -> Result<u64, ApplyError>;

    /// Seals the open transaction and remembers `batch` as committed.
    fn commit(&mut self, batch: BatchId);

    fn rollback(&mut self);

    fn is_applied(&self, fingerprint: &MutationFingerprint) -> bool;

    fn is_committed(&self, batch: &BatchId) -> bool;
}
