#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use nsalloc_contracts::allocation::{
    AllocationRecord, AllocationRecordInput, AllocationStatus, NamespaceName, NamespaceRecord,
    PrefixClass, Priority, SequenceId,
};
use nsalloc_contracts::request::Fingerprint;
use nsalloc_contracts::ContractViolation;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{table} row not found: {key}")]
    NotFound { table: &'static str, key: String },
    #[error("duplicate key in {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("illegal status transition {from} -> {to} for sequence_id={sequence_id}")]
    InvalidTransition {
        sequence_id: SequenceId,
        from: AllocationStatus,
        to: AllocationStatus,
    },
    #[error("namespace {namespace} cannot be claimed: {reason}")]
    NamespaceConflict {
        namespace: String,
        reason: &'static str,
    },
    #[error("corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
    #[error("database error: {0}")]
    Backend(#[from] rusqlite::Error),
}

/// Forward-only lifecycle, plus the re-queue edge back to `YetToAssign`.
pub fn is_allowed_status_transition(from: AllocationStatus, to: AllocationStatus) -> bool {
    use AllocationStatus::*;
    matches!(
        (from, to),
        (YetToAssign, Queued)
            | (YetToAssign, Assigned)
            | (Queued, Assigned)
            | (Hardcode, Assigned)
            | (_, YetToAssign)
    )
}

/// Operations available inside one database transaction.
///
/// Ledger rows and pool rows are mutated through the same handle so a grant
/// (bind record + commit namespace) lands atomically or not at all.
pub trait AllocationTx {
    fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<AllocationRecord>, StorageError>;
    fn find_by_namespace(
        &self,
        namespace: &NamespaceName,
    ) -> Result<Option<AllocationRecord>, StorageError>;
    fn get_record(&self, id: SequenceId) -> Result<Option<AllocationRecord>, StorageError>;
    fn records(&self) -> Result<Vec<AllocationRecord>, StorageError>;

    /// Inserts a `YetToAssign` or `Hardcode` row. Fails with `DuplicateKey` when the
    /// fingerprint already has a row.
    fn create_record(
        &mut self,
        input: AllocationRecordInput,
    ) -> Result<AllocationRecord, StorageError>;

    /// Moves a row along the state machine. Entering `Queued` stamps the queue
    /// timestamp once; re-entering `YetToAssign` clears namespace and queue stamp.
    fn transition(
        &mut self,
        id: SequenceId,
        to: AllocationStatus,
        now: DateTime<Utc>,
    ) -> Result<AllocationRecord, StorageError>;

    /// Binds a namespace and marks the row `Assigned`.
    fn bind_namespace(
        &mut self,
        id: SequenceId,
        namespace: &NamespaceName,
        pipeline_reference: Option<&str>,
    ) -> Result<AllocationRecord, StorageError>;

    fn record_pipeline_reference(
        &mut self,
        id: SequenceId,
        pipeline_reference: &str,
    ) -> Result<(), StorageError>;

    /// Overwrites an existing row with a pinned (`Hardcode`) binding.
    fn repin(
        &mut self,
        id: SequenceId,
        input: AllocationRecordInput,
    ) -> Result<AllocationRecord, StorageError>;

    fn delete_by_namespace(
        &mut self,
        namespace: &NamespaceName,
    ) -> Result<Option<AllocationRecord>, StorageError>;

    /// Sum of `cpu_estimate` over rows that currently hold a namespace.
    fn committed_cpu(&self) -> Result<f64, StorageError>;

    /// Sum of `cpu_estimate` over pending rows of the given priorities registered at or
    /// after `since`.
    fn pending_cpu(&self, priorities: &[Priority], since: DateTime<Utc>)
        -> Result<f64, StorageError>;

    /// True when some other `Queued` row of the same priority was queued before `queued_at`.
    fn older_queued_peer_exists(
        &self,
        id: SequenceId,
        priority: Priority,
        queued_at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    fn register_namespace(&mut self, name: &NamespaceName)
        -> Result<NamespaceRecord, StorageError>;
    fn namespace(&self, name: &NamespaceName) -> Result<Option<NamespaceRecord>, StorageError>;
    fn namespaces(&self) -> Result<Vec<NamespaceRecord>, StorageError>;

    /// First allocatable namespace of the class in name order.
    fn find_available(&self, class: &PrefixClass)
        -> Result<Option<NamespaceRecord>, StorageError>;

    fn lock_namespace(&mut self, name: &NamespaceName, now: DateTime<Utc>)
        -> Result<(), StorageError>;
    fn commit_namespace(&mut self, name: &NamespaceName) -> Result<(), StorageError>;

    /// Marks a pinned namespace in use without the lock phase. Unknown names are ignored
    /// since pinned namespaces may live outside the pool. A namespace held by an
    /// allocation lock is refused with `NamespaceConflict`.
    fn mark_in_use(&mut self, name: &NamespaceName) -> Result<bool, StorageError>;

    fn release_namespace(&mut self, name: &NamespaceName) -> Result<(), StorageError>;

    fn stale_locks(&self, locked_before: DateTime<Utc>)
        -> Result<Vec<NamespaceRecord>, StorageError>;
}

pub trait AllocationStore {
    /// Runs `f` inside one transaction: committed when `f` returns `Ok`, rolled back
    /// when it returns `Err`.
    fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut dyn AllocationTx) -> Result<T, E>;
}

impl<S: AllocationStore> AllocationStore for Arc<Mutex<S>> {
    fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut dyn AllocationTx) -> Result<T, E>,
    {
        let mut guard = self.lock().map_err(|_| E::from(StorageError::LockPoisoned))?;
        guard.transaction(f)
    }
}
