#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use nsalloc_contracts::allocation::{
    AllocationRecord, AllocationRecordInput, AllocationStatus, AvailabilityStatus, NamespaceName,
    NamespaceRecord, PrefixClass, Priority, SequenceId,
};
use nsalloc_contracts::request::Fingerprint;
use nsalloc_contracts::Validate;
use tracing::debug;

use crate::ledger::{is_allowed_status_transition, AllocationStore, AllocationTx, StorageError};

#[derive(Debug, Clone, Default)]
struct LedgerTables {
    records: BTreeMap<SequenceId, AllocationRecord>,
    by_fingerprint: BTreeMap<Fingerprint, SequenceId>,
    namespaces: BTreeMap<NamespaceName, NamespaceRecord>,
    next_sequence_id: u64,
}

/// In-memory ledger + pool. A transaction snapshots the tables and restores them on error.
#[derive(Debug, Clone, Default)]
pub struct LedgerStore {
    tables: LedgerTables,
    committed_transactions: u64,
}

impl LedgerStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    pub fn committed_transactions(&self) -> u64 {
        self.committed_transactions
    }

    pub fn record_rows(&self) -> Vec<&AllocationRecord> {
        self.tables.records.values().collect()
    }

    pub fn namespace_row(&self, name: &NamespaceName) -> Option<&NamespaceRecord> {
        self.tables.namespaces.get(name)
    }

    /// Test and repair hook: sets lock state directly, bypassing the protocol.
    pub fn force_namespace_lock(&mut self, name: &NamespaceName, locked_at: DateTime<Utc>) {
        if let Some(row) = self.tables.namespaces.get_mut(name) {
            row.availability = AvailabilityStatus::LockedForAllocation;
            row.allocation_lock = true;
            row.locked_at = Some(locked_at);
        }
    }
}

impl AllocationStore for LedgerStore {
    fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut dyn AllocationTx) -> Result<T, E>,
    {
        let snapshot = self.tables.clone();
        match f(&mut self.tables) {
            Ok(v) => {
                self.committed_transactions += 1;
                Ok(v)
            }
            Err(e) => {
                self.tables = snapshot;
                debug!("in-memory transaction rolled back");
                Err(e)
            }
        }
    }
}

impl LedgerTables {
    fn record_mut(&mut self, id: SequenceId) -> Result<&mut AllocationRecord, StorageError> {
        self.records.get_mut(&id).ok_or_else(|| StorageError::NotFound {
            table: "allocation_record",
            key: id.to_string(),
        })
    }

    fn namespace_mut(&mut self, name: &NamespaceName) -> Result<&mut NamespaceRecord, StorageError> {
        self.namespaces
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound {
                table: "namespace",
                key: name.to_string(),
            })
    }

    fn holder_of(&self, namespace: &NamespaceName) -> Option<SequenceId> {
        self.records
            .values()
            .find(|r| r.namespace.as_ref() == Some(namespace))
            .map(|r| r.sequence_id)
    }
}

impl AllocationTx for LedgerTables {
    fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<AllocationRecord>, StorageError> {
        Ok(self
            .by_fingerprint
            .get(fingerprint)
            .and_then(|id| self.records.get(id))
            .cloned())
    }

    fn find_by_namespace(
        &self,
        namespace: &NamespaceName,
    ) -> Result<Option<AllocationRecord>, StorageError> {
        Ok(self
            .holder_of(namespace)
            .and_then(|id| self.records.get(&id))
            .cloned())
    }

    fn get_record(&self, id: SequenceId) -> Result<Option<AllocationRecord>, StorageError> {
        Ok(self.records.get(&id).cloned())
    }

    fn records(&self) -> Result<Vec<AllocationRecord>, StorageError> {
        Ok(self.records.values().cloned().collect())
    }

    fn create_record(
        &mut self,
        input: AllocationRecordInput,
    ) -> Result<AllocationRecord, StorageError> {
        input.validate()?;
        let fingerprint = input.fingerprint();
        if self.by_fingerprint.contains_key(&fingerprint) {
            return Err(StorageError::DuplicateKey {
                table: "allocation_record",
                key: fingerprint.to_string(),
            });
        }
        if let Some(ns) = &input.namespace {
            if self.holder_of(ns).is_some() {
                return Err(StorageError::NamespaceConflict {
                    namespace: ns.to_string(),
                    reason: "already bound to another record",
                });
            }
        }
        self.next_sequence_id += 1;
        let record = AllocationRecord {
            sequence_id: SequenceId(self.next_sequence_id),
            fingerprint: fingerprint.clone(),
            identity: input.identity,
            status: input.status,
            namespace: input.namespace,
            priority: input.priority,
            owner: input.owner,
            pipeline_reference: input.pipeline_reference,
            cpu_estimate: input.cpu_estimate,
            registered_at: input.now,
            queue_timestamp: None,
        };
        self.by_fingerprint.insert(fingerprint, record.sequence_id);
        self.records.insert(record.sequence_id, record.clone());
        Ok(record)
    }

    fn transition(
        &mut self,
        id: SequenceId,
        to: AllocationStatus,
        now: DateTime<Utc>,
    ) -> Result<AllocationRecord, StorageError> {
        let row = self.record_mut(id)?;
        if !is_allowed_status_transition(row.status, to) {
            return Err(StorageError::InvalidTransition {
                sequence_id: id,
                from: row.status,
                to,
            });
        }
        match to {
            AllocationStatus::Queued => {
                if row.queue_timestamp.is_none() {
                    row.queue_timestamp = Some(now);
                }
            }
            AllocationStatus::YetToAssign => {
                row.namespace = None;
                row.queue_timestamp = None;
                row.registered_at = now;
            }
            AllocationStatus::Assigned | AllocationStatus::Hardcode => {}
        }
        row.status = to;
        Ok(row.clone())
    }

    fn bind_namespace(
        &mut self,
        id: SequenceId,
        namespace: &NamespaceName,
        pipeline_reference: Option<&str>,
    ) -> Result<AllocationRecord, StorageError> {
        if let Some(holder) = self.holder_of(namespace) {
            if holder != id {
                return Err(StorageError::NamespaceConflict {
                    namespace: namespace.to_string(),
                    reason: "already bound to another record",
                });
            }
        }
        let row = self.record_mut(id)?;
        if !is_allowed_status_transition(row.status, AllocationStatus::Assigned) {
            return Err(StorageError::InvalidTransition {
                sequence_id: id,
                from: row.status,
                to: AllocationStatus::Assigned,
            });
        }
        row.namespace = Some(namespace.clone());
        row.status = AllocationStatus::Assigned;
        if let Some(p) = pipeline_reference {
            row.pipeline_reference = Some(p.to_string());
        }
        Ok(row.clone())
    }

    fn record_pipeline_reference(
        &mut self,
        id: SequenceId,
        pipeline_reference: &str,
    ) -> Result<(), StorageError> {
        self.record_mut(id)?.pipeline_reference = Some(pipeline_reference.to_string());
        Ok(())
    }

    fn repin(
        &mut self,
        id: SequenceId,
        input: AllocationRecordInput,
    ) -> Result<AllocationRecord, StorageError> {
        input.validate()?;
        let fingerprint = input.fingerprint();
        if let Some(other) = self.by_fingerprint.get(&fingerprint) {
            if *other != id {
                return Err(StorageError::DuplicateKey {
                    table: "allocation_record",
                    key: fingerprint.to_string(),
                });
            }
        }
        if let Some(ns) = &input.namespace {
            if let Some(holder) = self.holder_of(ns) {
                if holder != id {
                    return Err(StorageError::NamespaceConflict {
                        namespace: ns.to_string(),
                        reason: "already bound to another record",
                    });
                }
            }
        }
        let row = self.record_mut(id)?;
        let old_fingerprint = row.fingerprint.clone();
        row.fingerprint = fingerprint.clone();
        row.identity = input.identity;
        row.status = input.status;
        row.namespace = input.namespace;
        row.priority = input.priority;
        row.owner = input.owner;
        if input.pipeline_reference.is_some() {
            row.pipeline_reference = input.pipeline_reference;
        }
        row.cpu_estimate = input.cpu_estimate;
        row.registered_at = input.now;
        row.queue_timestamp = None;
        let out = row.clone();
        self.by_fingerprint.remove(&old_fingerprint);
        self.by_fingerprint.insert(fingerprint, id);
        Ok(out)
    }

    fn delete_by_namespace(
        &mut self,
        namespace: &NamespaceName,
    ) -> Result<Option<AllocationRecord>, StorageError> {
        let Some(id) = self.holder_of(namespace) else {
            return Ok(None);
        };
        let removed = self.records.remove(&id);
        if let Some(r) = &removed {
            self.by_fingerprint.remove(&r.fingerprint);
        }
        Ok(removed)
    }

    fn committed_cpu(&self) -> Result<f64, StorageError> {
        Ok(self
            .records
            .values()
            .filter(|r| r.status.is_bound())
            .map(|r| r.cpu_estimate)
            .sum())
    }

    fn pending_cpu(
        &self,
        priorities: &[Priority],
        since: DateTime<Utc>,
    ) -> Result<f64, StorageError> {
        Ok(self
            .records
            .values()
            .filter(|r| r.status.is_pending())
            .filter(|r| priorities.contains(&r.priority))
            .filter(|r| r.registered_at >= since)
            .map(|r| r.cpu_estimate)
            .sum())
    }

    fn older_queued_peer_exists(
        &self,
        id: SequenceId,
        priority: Priority,
        queued_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        Ok(self.records.values().any(|r| {
            r.sequence_id != id
                && r.status == AllocationStatus::Queued
                && r.priority == priority
                && r.queue_timestamp.map(|t| t < queued_at).unwrap_or(false)
        }))
    }

    fn register_namespace(
        &mut self,
        name: &NamespaceName,
    ) -> Result<NamespaceRecord, StorageError> {
        if self.namespaces.contains_key(name) {
            return Err(StorageError::DuplicateKey {
                table: "namespace",
                key: name.to_string(),
            });
        }
        let row = NamespaceRecord::available(name.clone());
        self.namespaces.insert(name.clone(), row.clone());
        Ok(row)
    }

    fn namespace(&self, name: &NamespaceName) -> Result<Option<NamespaceRecord>, StorageError> {
        Ok(self.namespaces.get(name).cloned())
    }

    fn namespaces(&self) -> Result<Vec<NamespaceRecord>, StorageError> {
        Ok(self.namespaces.values().cloned().collect())
    }

    fn find_available(
        &self,
        class: &PrefixClass,
    ) -> Result<Option<NamespaceRecord>, StorageError> {
        Ok(self
            .namespaces
            .values()
            .find(|n| class.contains(&n.name) && n.is_allocatable())
            .cloned())
    }

    fn lock_namespace(
        &mut self,
        name: &NamespaceName,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let row = self.namespace_mut(name)?;
        if !row.is_allocatable() {
            return Err(StorageError::NamespaceConflict {
                namespace: name.to_string(),
                reason: "not available or already locked",
            });
        }
        row.availability = AvailabilityStatus::LockedForAllocation;
        row.allocation_lock = true;
        row.locked_at = Some(now);
        Ok(())
    }

    fn commit_namespace(&mut self, name: &NamespaceName) -> Result<(), StorageError> {
        let row = self.namespace_mut(name)?;
        if !row.allocation_lock {
            return Err(StorageError::NamespaceConflict {
                namespace: name.to_string(),
                reason: "commit requires a held allocation lock",
            });
        }
        row.availability = AvailabilityStatus::InUse;
        row.allocation_lock = false;
        row.locked_at = None;
        Ok(())
    }

    fn mark_in_use(&mut self, name: &NamespaceName) -> Result<bool, StorageError> {
        let Some(row) = self.namespaces.get_mut(name) else {
            return Ok(false);
        };
        if row.allocation_lock {
            return Err(StorageError::NamespaceConflict {
                namespace: name.to_string(),
                reason: "locked for allocation by another request",
            });
        }
        row.availability = AvailabilityStatus::InUse;
        row.allocation_lock = false;
        row.locked_at = None;
        Ok(true)
    }

    fn release_namespace(&mut self, name: &NamespaceName) -> Result<(), StorageError> {
        let row = self.namespace_mut(name)?;
        row.availability = AvailabilityStatus::Available;
        row.allocation_lock = false;
        row.locked_at = None;
        Ok(())
    }

    fn stale_locks(
        &self,
        locked_before: DateTime<Utc>,
    ) -> Result<Vec<NamespaceRecord>, StorageError> {
        Ok(self
            .namespaces
            .values()
            .filter(|n| n.allocation_lock && n.locked_at.map(|t| t < locked_before).unwrap_or(true))
            .cloned()
            .collect())
    }
}
