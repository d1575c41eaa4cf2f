#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use nsalloc_contracts::allocation::{
    AllocationRecord, AllocationRecordInput, AllocationStatus, NamespaceName, NamespaceRecord,
    Priority, SequenceId,
};
use nsalloc_contracts::request::{Request, RequestIdentity};
use nsalloc_contracts::{ContractViolation, Validate};
use nsalloc_engines::arbiter::PriorityArbiter;
use nsalloc_engines::capacity::{CapacitySource, CapacitySourceError};
use nsalloc_engines::config::AllocatorConfig;
use nsalloc_engines::notify::NotificationSink;
use nsalloc_engines::priority::PriorityPolicy;
use nsalloc_engines::scheduler::{to_time_delta, AllocationContext, Scheduler, WaitInterrupted};
use nsalloc_storage::{AllocationStore, AllocationTx, StorageError};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::gate::{CapacityGate, GateMode, GateOutcome, QueueEpisode};
use crate::publish::{OutputChannel, PublishError};

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("capacity source unavailable: {0}")]
    CapacitySourceUnavailable(CapacitySourceError),
    #[error("no namespace available for {0}")]
    NoNamespaceAvailable(String),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StorageError),
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] ContractViolation),
    #[error("allocation wait cancelled")]
    Cancelled,
    #[error("allocation deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl AllocationError {
    /// Conditions the gate absorbs into its retry loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AllocationError::CapacitySourceUnavailable(_) | AllocationError::NoNamespaceAvailable(_)
        )
    }
}

impl From<WaitInterrupted> for AllocationError {
    fn from(value: WaitInterrupted) -> Self {
        match value {
            WaitInterrupted::Cancelled => AllocationError::Cancelled,
            WaitInterrupted::DeadlineExceeded => AllocationError::DeadlineExceeded,
        }
    }
}

enum LedgerEntry {
    Bound(NamespaceName),
    Pending(AllocationRecord),
}

/// Orchestrates ledger lookup, the capacity gate, the two-phase namespace grant and
/// publishing of the result.
pub struct AllocationEngine<S, C, N, W> {
    config: AllocatorConfig,
    arbiter: PriorityArbiter,
    priority_policy: PriorityPolicy,
    store: S,
    capacity: C,
    notifier: N,
    scheduler: W,
    outputs: Vec<Box<dyn OutputChannel>>,
}

impl<S, C, N, W> AllocationEngine<S, C, N, W>
where
    S: AllocationStore,
    C: CapacitySource,
    N: NotificationSink,
    W: Scheduler,
{
    pub fn new(
        config: AllocatorConfig,
        store: S,
        capacity: C,
        notifier: N,
        scheduler: W,
    ) -> Result<Self, ContractViolation> {
        config.validate()?;
        let arbiter = PriorityArbiter::new(config.limits)?;
        let priority_policy = PriorityPolicy::from_config(&config);
        Ok(Self {
            config,
            arbiter,
            priority_policy,
            store,
            capacity,
            notifier,
            scheduler,
            outputs: Vec::new(),
        })
    }

    pub fn with_output(mut self, output: Box<dyn OutputChannel>) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn derive_priority(&self, identity: &RequestIdentity) -> Priority {
        self.priority_policy.derive(
            identity.official_build,
            &identity.release_tag,
            identity.rollback,
        )
    }

    /// Returns the namespace bound to the request's fingerprint, waiting in the capacity
    /// gate until one can be granted.
    pub fn allocate(
        &mut self,
        request: &Request,
        ctx: &AllocationContext,
    ) -> Result<NamespaceName, AllocationError> {
        request.validate()?;
        if let Some(pinned) = request.pinned_namespace.clone() {
            return self.allocate_pinned(request, pinned, ctx);
        }

        let fingerprint = request.fingerprint();
        let now = self.scheduler.now();
        let input = self.pending_input(request, now)?;
        let pipeline_reference = request.pipeline_reference.as_deref();
        let entry = self.store.transaction(|tx| -> Result<LedgerEntry, AllocationError> {
            match tx.find_by_fingerprint(&fingerprint)? {
                Some(record) => {
                    if let Some(p) = pipeline_reference {
                        tx.record_pipeline_reference(record.sequence_id, p)?;
                    }
                    match record.bound_namespace() {
                        Some(ns) => Ok(LedgerEntry::Bound(ns.clone())),
                        None => Ok(LedgerEntry::Pending(record)),
                    }
                }
                None => Ok(LedgerEntry::Pending(tx.create_record(input)?)),
            }
        })?;

        let record = match entry {
            LedgerEntry::Bound(namespace) => {
                info!(
                    fingerprint = fingerprint.short(),
                    namespace = %namespace,
                    "fingerprint already holds a namespace"
                );
                self.publish(&namespace)?;
                return Ok(namespace);
            }
            LedgerEntry::Pending(record) => record,
        };

        let class = self
            .config
            .prefix_class_for(request.identity.workload_kind)?;
        info!(
            sequence_id = %record.sequence_id,
            fingerprint = fingerprint.short(),
            priority = %record.priority,
            prefix_class = class.as_str(),
            "entering capacity gate"
        );
        let mode = GateMode::Pool(class.clone());
        let mut episode = QueueEpisode::new();
        loop {
            let outcome = CapacityGate {
                config: &self.config,
                arbiter: &self.arbiter,
                capacity: &self.capacity,
                notifier: &self.notifier,
                scheduler: &self.scheduler,
            }
            .run(
                &mut self.store,
                record.sequence_id,
                &mode,
                ctx,
                &mut episode,
            )?;
            let namespace = match outcome {
                GateOutcome::Locked { namespace, .. } => namespace,
                GateOutcome::AlreadyBound(namespace) => {
                    self.publish(&namespace)?;
                    return Ok(namespace);
                }
                GateOutcome::Admitted { .. } => {
                    return Err(AllocationError::NoNamespaceAvailable(
                        class.as_str().to_string(),
                    ))
                }
            };

            match self.grant(
                record.sequence_id,
                &namespace,
                request.pipeline_reference.as_deref(),
            ) {
                Ok(_) => {
                    self.publish(&namespace)?;
                    return Ok(namespace);
                }
                // Lost the namespace between lock and bind; pick another one.
                Err(AllocationError::Persistence(StorageError::NamespaceConflict { .. })) => {
                    warn!(
                        sequence_id = %record.sequence_id,
                        namespace = %namespace,
                        "namespace claimed during grant; re-entering capacity gate"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Explicit pin: keeps the binding when it already matches, otherwise re-validates
    /// capacity before moving the fingerprint onto the pinned namespace.
    fn allocate_pinned(
        &mut self,
        request: &Request,
        pinned: NamespaceName,
        ctx: &AllocationContext,
    ) -> Result<NamespaceName, AllocationError> {
        self.ensure_pinned_prefix(&pinned)?;
        let fingerprint = request.fingerprint();
        let now = self.scheduler.now();
        let pending = self.pending_input(request, now)?;
        let pipeline_reference = request.pipeline_reference.as_deref();

        let rebind = self.store.transaction(|tx| -> Result<Option<AllocationRecord>, AllocationError> {
            let holder = tx.find_by_namespace(&pinned)?;
            let own = tx.find_by_fingerprint(&fingerprint)?;
            match (holder, own) {
                (Some(holder), _) if holder.fingerprint == fingerprint => {
                    if holder.status == AllocationStatus::Hardcode {
                        tx.transition(holder.sequence_id, AllocationStatus::Assigned, now)?;
                    }
                    if let Some(p) = pipeline_reference {
                        tx.record_pipeline_reference(holder.sequence_id, p)?;
                    }
                    tx.mark_in_use(&pinned)?;
                    Ok(None)
                }
                (Some(_), _) => Err(pinned_conflict(&pinned).into()),
                (None, Some(own)) => Ok(Some(own)),
                (None, None) => Ok(Some(tx.create_record(pending)?)),
            }
        })?;

        let Some(record) = rebind else {
            info!(namespace = %pinned, "pinned namespace already bound to this request");
            self.publish(&pinned)?;
            return Ok(pinned);
        };

        info!(
            sequence_id = %record.sequence_id,
            namespace = %pinned,
            "pinned binding changes; re-validating capacity"
        );
        let mode = GateMode::Pinned(pinned.clone());
        let mut episode = QueueEpisode::new();
        let gate = CapacityGate {
            config: &self.config,
            arbiter: &self.arbiter,
            capacity: &self.capacity,
            notifier: &self.notifier,
            scheduler: &self.scheduler,
        };
        gate.run(&mut self.store, record.sequence_id, &mode, ctx, &mut episode)?;

        let now = self.scheduler.now();
        let input = self.hardcode_input(request, pinned.clone(), now)?;
        let id = record.sequence_id;
        self.store.transaction(|tx| -> Result<(), AllocationError> {
            let previous = tx
                .get_record(id)?
                .and_then(|r| r.bound_namespace().cloned());
            tx.repin(id, input)?;
            tx.transition(id, AllocationStatus::Assigned, now)?;
            tx.mark_in_use(&pinned)?;
            if let Some(previous) = previous.filter(|p| *p != pinned) {
                release_if_pooled(tx, &previous)?;
            }
            Ok(())
        })?;
        info!(sequence_id = %id, namespace = %pinned, "pinned namespace assigned");
        self.publish(&pinned)?;
        Ok(pinned)
    }

    /// Registers an upcoming request without admission. Pinned requests are bound
    /// directly as `HARDCODE`.
    pub fn insert_or_update(&mut self, request: &Request) -> Result<AllocationRecord, AllocationError> {
        request.validate()?;
        let fingerprint = request.fingerprint();
        let now = self.scheduler.now();
        let pipeline_reference = request.pipeline_reference.as_deref();

        if let Some(pinned) = request.pinned_namespace.clone() {
            self.ensure_pinned_prefix(&pinned)?;
            let input = self.hardcode_input(request, pinned.clone(), now)?;
            let record = self.store.transaction(|tx| -> Result<AllocationRecord, AllocationError> {
                let holder = tx.find_by_namespace(&pinned)?;
                let own = tx.find_by_fingerprint(&fingerprint)?;
                let record = match (holder, own) {
                    (Some(holder), Some(own)) if holder.sequence_id != own.sequence_id => {
                        return Err(pinned_conflict(&pinned).into());
                    }
                    (Some(holder), _) if holder.fingerprint == fingerprint => {
                        if let Some(p) = pipeline_reference {
                            tx.record_pipeline_reference(holder.sequence_id, p)?;
                        }
                        holder
                    }
                    (Some(holder), _) => tx.repin(holder.sequence_id, input)?,
                    (None, Some(own)) => {
                        let previous = own.bound_namespace().cloned();
                        let record = tx.repin(own.sequence_id, input)?;
                        if let Some(previous) = previous {
                            release_if_pooled(tx, &previous)?;
                        }
                        record
                    }
                    (None, None) => tx.create_record(input)?,
                };
                tx.mark_in_use(&pinned)?;
                Ok(record)
            })?;
            info!(
                sequence_id = %record.sequence_id,
                namespace = %pinned,
                status = %record.status,
                "pinned request registered"
            );
            return Ok(record);
        }

        let input = self.pending_input(request, now)?;
        let record = self.store.transaction(|tx| -> Result<AllocationRecord, AllocationError> {
            let Some(existing) = tx.find_by_fingerprint(&fingerprint)? else {
                return Ok(tx.create_record(input)?);
            };
            if let Some(p) = pipeline_reference {
                tx.record_pipeline_reference(existing.sequence_id, p)?;
            }
            match existing.status {
                // Re-registering an unassigned row re-queues it and refreshes the
                // pending window start.
                AllocationStatus::YetToAssign | AllocationStatus::Queued => {
                    Ok(tx.transition(existing.sequence_id, AllocationStatus::YetToAssign, now)?)
                }
                _ => Ok(existing),
            }
        })?;
        match record.bound_namespace() {
            Some(ns) => info!(
                sequence_id = %record.sequence_id,
                namespace = %ns,
                "request already allocated"
            ),
            None => info!(
                sequence_id = %record.sequence_id,
                status = %record.status,
                priority = %record.priority,
                "request registered"
            ),
        }
        Ok(record)
    }

    /// Deletes the record bound to `namespace` and frees the namespace. Unknown namespaces
    /// with no record are reported as not found.
    pub fn release(
        &mut self,
        namespace: &NamespaceName,
    ) -> Result<Option<AllocationRecord>, AllocationError> {
        let removed = self.store.transaction(|tx| -> Result<_, AllocationError> {
            let removed = tx.delete_by_namespace(namespace)?;
            let pooled = release_if_pooled(tx, namespace)?;
            if !pooled && removed.is_none() {
                return Err(StorageError::NotFound {
                    table: "namespace",
                    key: namespace.to_string(),
                }
                .into());
            }
            Ok(removed)
        })?;
        info!(
            namespace = %namespace,
            sequence_id = ?removed.as_ref().map(|r| r.sequence_id.0),
            "namespace released"
        );
        Ok(removed)
    }

    pub fn register_namespace(
        &mut self,
        name: &NamespaceName,
    ) -> Result<NamespaceRecord, AllocationError> {
        let row = self
            .store
            .transaction(|tx| -> Result<_, AllocationError> { Ok(tx.register_namespace(name)?) })?;
        info!(namespace = %name, "namespace registered");
        Ok(row)
    }

    /// Releases namespaces whose allocation lock outlived `stale_lock_timeout`. A lock whose
    /// namespace is already bound to a record is completed instead.
    pub fn reconcile_stale_locks(&mut self) -> Result<Vec<NamespaceName>, AllocationError> {
        let now = self.scheduler.now();
        let cutoff = now - to_time_delta(self.config.stale_lock_timeout);
        let released = self.store.transaction(|tx| -> Result<_, AllocationError> {
            let mut released = Vec::new();
            for row in tx.stale_locks(cutoff)? {
                match tx.find_by_namespace(&row.name)? {
                    Some(record) if record.status.is_bound() => {
                        tx.commit_namespace(&row.name)?;
                    }
                    _ => {
                        tx.release_namespace(&row.name)?;
                        released.push(row.name);
                    }
                }
            }
            Ok(released)
        })?;
        for name in &released {
            warn!(namespace = %name, "stale allocation lock released");
        }
        Ok(released)
    }

    /// Second phase of the grant: bind and commit atomically, or give the lock back.
    fn grant(
        &mut self,
        id: SequenceId,
        namespace: &NamespaceName,
        pipeline_reference: Option<&str>,
    ) -> Result<AllocationRecord, AllocationError> {
        let bound = self.store.transaction(|tx| {
            let record = tx.bind_namespace(id, namespace, pipeline_reference)?;
            tx.commit_namespace(namespace)?;
            Ok::<_, StorageError>(record)
        });
        match bound {
            Ok(record) => {
                info!(
                    sequence_id = %id,
                    namespace = %namespace,
                    priority = %record.priority,
                    "namespace assigned"
                );
                Ok(record)
            }
            Err(err) => {
                error!(sequence_id = %id, namespace = %namespace, error = %err, "grant failed");
                // Only a lock nobody else has bound is given back to the pool.
                let cleanup = self.store.transaction(|tx| -> Result<bool, StorageError> {
                    let locked = tx.namespace(namespace)?.is_some_and(|row| row.allocation_lock);
                    let unclaimed = tx
                        .find_by_namespace(namespace)?
                        .map_or(true, |holder| holder.sequence_id == id);
                    if locked && unclaimed {
                        tx.release_namespace(namespace)?;
                    }
                    Ok(locked && unclaimed)
                });
                match cleanup {
                    Ok(true) => info!(namespace = %namespace, "allocation lock returned to the pool"),
                    Ok(false) => {
                        warn!(namespace = %namespace, "namespace held elsewhere; left untouched")
                    }
                    Err(release_err) => warn!(
                        namespace = %namespace,
                        error = %release_err,
                        "lock left in place for the stale-lock sweep"
                    ),
                }
                Err(err.into())
            }
        }
    }

    fn publish(&self, namespace: &NamespaceName) -> Result<(), AllocationError> {
        for output in &self.outputs {
            output.publish(namespace)?;
        }
        Ok(())
    }

    fn ensure_pinned_prefix(&self, pinned: &NamespaceName) -> Result<(), ContractViolation> {
        if self.config.is_pinned_namespace(pinned.as_str()) {
            Ok(())
        } else {
            Err(ContractViolation::InvalidValue {
                field: "request.pinned_namespace",
                reason: "must carry the pinned namespace prefix",
            })
        }
    }

    fn pending_input(
        &self,
        request: &Request,
        now: DateTime<Utc>,
    ) -> Result<AllocationRecordInput, ContractViolation> {
        self.record_input(request, AllocationStatus::YetToAssign, None, now)
    }

    fn hardcode_input(
        &self,
        request: &Request,
        pinned: NamespaceName,
        now: DateTime<Utc>,
    ) -> Result<AllocationRecordInput, ContractViolation> {
        self.record_input(request, AllocationStatus::Hardcode, Some(pinned), now)
    }

    fn record_input(
        &self,
        request: &Request,
        status: AllocationStatus,
        namespace: Option<NamespaceName>,
        now: DateTime<Utc>,
    ) -> Result<AllocationRecordInput, ContractViolation> {
        AllocationRecordInput::v1(
            request.identity.clone(),
            status,
            namespace,
            self.derive_priority(&request.identity),
            request.owner.clone(),
            request.pipeline_reference.clone(),
            self.config.cpu_estimate_for(request.identity.workload_kind),
            now,
        )
    }
}

fn pinned_conflict(pinned: &NamespaceName) -> StorageError {
    StorageError::NamespaceConflict {
        namespace: pinned.to_string(),
        reason: "pinned namespace is bound to a different request",
    }
}

/// Returns the namespace to the pool when the pool knows it; pinned namespaces may not.
fn release_if_pooled(
    tx: &mut dyn AllocationTx,
    namespace: &NamespaceName,
) -> Result<bool, StorageError> {
    if tx.namespace(namespace)?.is_some() {
        tx.release_namespace(namespace)?;
        Ok(true)
    } else {
        Ok(false)
    }
}
