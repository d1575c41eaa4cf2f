#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nsalloc_contracts::allocation::{
    AllocationRecord, AllocationStatus, CapacitySnapshot, NamespaceName, PrefixClass, SequenceId,
};
use nsalloc_engines::arbiter::{AdmissionDecision, AdmissionInput, PriorityArbiter};
use nsalloc_engines::capacity::CapacitySource;
use nsalloc_engines::config::AllocatorConfig;
use nsalloc_engines::notify::{compose_message, NotificationCategory, NotificationSink};
use nsalloc_engines::scheduler::{to_time_delta, AllocationContext, Scheduler};
use nsalloc_storage::{AllocationStore, AllocationTx, StorageError};
use tracing::{debug, info, warn};

use crate::engine::AllocationError;

/// Per-wait state carried across gate iterations for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueEpisode {
    first_refusal_at: Option<DateTime<Utc>>,
    queued_marked: bool,
    notified: BTreeSet<NotificationCategory>,
    consecutive_source_failures: u32,
    iterations: u64,
}

impl QueueEpisode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first_refusal_at(&self) -> Option<DateTime<Utc>> {
        self.first_refusal_at
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn was_notified(&self, category: NotificationCategory) -> bool {
        self.notified.contains(&category)
    }

    fn record_wait(&mut self, now: DateTime<Utc>) {
        if self.first_refusal_at.is_none() {
            self.first_refusal_at = Some(now);
        }
    }

    /// True the first time a category is claimed in this episode.
    fn claim_notification(&mut self, category: NotificationCategory) -> bool {
        self.notified.insert(category)
    }

    fn watchdog_due(&self, now: DateTime<Utc>, stuck_after: Duration) -> bool {
        match self.first_refusal_at {
            Some(first) => {
                now - first >= to_time_delta(stuck_after)
                    && !self.was_notified(NotificationCategory::StuckInQueue)
            }
            None => false,
        }
    }

    /// Poll interval, doubled per consecutive capacity-source failure up to `max_backoff`.
    fn next_wait(&self, poll: Duration, max_backoff: Duration) -> Duration {
        let exp = self.consecutive_source_failures.min(16);
        poll.saturating_mul(1u32 << exp).min(max_backoff.max(poll))
    }
}

/// What the gate is acquiring for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateMode {
    /// Admission, then lock the first free namespace of the class.
    Pool(PrefixClass),
    /// Admission only; the caller already names the namespace.
    Pinned(NamespaceName),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Namespace locked for allocation; the caller must commit or release it.
    Locked {
        namespace: NamespaceName,
        combined_usage: f64,
    },
    Admitted { combined_usage: f64 },
    /// Another caller with the same fingerprint finished first.
    AlreadyBound(NamespaceName),
}

enum IterationStop {
    Refused(AdmissionDecision),
    PoolExhausted,
    Failed(AllocationError),
}

impl From<StorageError> for IterationStop {
    fn from(err: StorageError) -> Self {
        IterationStop::Failed(AllocationError::Persistence(err))
    }
}

/// Builds the snapshot for one record inside an open transaction and asks the arbiter.
pub fn evaluate_admission(
    tx: &mut dyn AllocationTx,
    arbiter: &PriorityArbiter,
    config: &AllocatorConfig,
    record: &AllocationRecord,
    observed_usage: f64,
    now: DateTime<Utc>,
) -> Result<AdmissionDecision, AllocationError> {
    let window_start = now - to_time_delta(config.priority_check_interval);
    let higher = record.priority.strictly_higher();
    let higher_pending_estimates = if higher.is_empty() {
        0.0
    } else {
        tx.pending_cpu(&higher, window_start)?
    };
    let snapshot = CapacitySnapshot {
        observed_usage,
        committed_estimates: tx.committed_cpu()?,
        higher_pending_estimates,
    };
    let queued_at = record.queue_timestamp.unwrap_or(now);
    let older_peer_waiting =
        tx.older_queued_peer_exists(record.sequence_id, record.priority, queued_at)?;
    let decision = arbiter.decide(&AdmissionInput {
        priority: record.priority,
        snapshot,
        older_peer_waiting,
    })?;
    debug!(
        sequence_id = %record.sequence_id,
        priority = %record.priority,
        observed_cpu = observed_usage,
        committed_cpu = snapshot.committed_estimates,
        higher_pending_cpu = snapshot.higher_pending_estimates,
        reason_code = decision.reason_code(),
        "admission evaluated"
    );
    Ok(decision)
}

/// The admission loop. Borrowed collaborators only; all state lives in [`QueueEpisode`].
pub struct CapacityGate<'a, C, N, W> {
    pub config: &'a AllocatorConfig,
    pub arbiter: &'a PriorityArbiter,
    pub capacity: &'a C,
    pub notifier: &'a N,
    pub scheduler: &'a W,
}

impl<'a, C, N, W> CapacityGate<'a, C, N, W>
where
    C: CapacitySource,
    N: NotificationSink,
    W: Scheduler,
{
    /// Retries until both capacity admission and (in pool mode) namespace selection
    /// clear, the context is cancelled, or a hard error occurs. No transaction is held
    /// across a wait.
    pub fn run<S: AllocationStore>(
        &self,
        store: &mut S,
        record_id: SequenceId,
        mode: &GateMode,
        ctx: &AllocationContext,
        episode: &mut QueueEpisode,
    ) -> Result<GateOutcome, AllocationError> {
        loop {
            ctx.check(self.scheduler.now())?;
            episode.iterations += 1;

            let observed = match self.capacity.current_usage() {
                Ok(usage) => {
                    episode.consecutive_source_failures = 0;
                    usage
                }
                Err(err) => {
                    let err = AllocationError::CapacitySourceUnavailable(err);
                    warn!(sequence_id = %record_id, error = %err, "capacity source unavailable; will retry");
                    episode.consecutive_source_failures =
                        episode.consecutive_source_failures.saturating_add(1);
                    self.wait(store, record_id, None, ctx, episode)?;
                    continue;
                }
            };

            let now = self.scheduler.now();
            let attempt = store.transaction(|tx| -> Result<GateOutcome, IterationStop> {
                let record = tx
                    .get_record(record_id)?
                    .ok_or_else(|| StorageError::NotFound {
                        table: "allocation_record",
                        key: record_id.to_string(),
                    })?;
                if let (GateMode::Pool(_), Some(ns)) = (mode, record.bound_namespace()) {
                    return Ok(GateOutcome::AlreadyBound(ns.clone()));
                }
                let decision =
                    evaluate_admission(tx, self.arbiter, self.config, &record, observed, now)
                        .map_err(IterationStop::Failed)?;
                if !decision.is_admit() {
                    return Err(IterationStop::Refused(decision));
                }
                let combined_usage = decision.combined_usage();
                match mode {
                    GateMode::Pinned(_) => Ok(GateOutcome::Admitted { combined_usage }),
                    GateMode::Pool(class) => {
                        let Some(candidate) = tx.find_available(class)? else {
                            return Err(IterationStop::PoolExhausted);
                        };
                        tx.lock_namespace(&candidate.name, now)?;
                        Ok(GateOutcome::Locked {
                            namespace: candidate.name,
                            combined_usage,
                        })
                    }
                }
            });

            match attempt {
                Ok(outcome) => {
                    if let GateOutcome::Locked {
                        namespace,
                        combined_usage,
                    } = &outcome
                    {
                        info!(
                            sequence_id = %record_id,
                            namespace = %namespace,
                            combined_cpu = combined_usage,
                            iterations = episode.iterations,
                            "admission granted; namespace locked"
                        );
                    }
                    return Ok(outcome);
                }
                Err(IterationStop::Failed(err)) => return Err(err),
                Err(IterationStop::Refused(decision)) => {
                    info!(
                        sequence_id = %record_id,
                        combined_cpu = decision.combined_usage(),
                        reason_code = decision.reason_code(),
                        "admission refused; waiting"
                    );
                    let mut categories = Vec::new();
                    if let AdmissionDecision::Refuse { reason, .. } = decision {
                        if reason.is_over_capacity() {
                            categories.push(NotificationCategory::NoCapacity);
                        }
                    }
                    if self.advisory_due(store, record_id, &decision)? {
                        categories.push(NotificationCategory::PriorityAdvisory);
                    }
                    self.wait(store, record_id, Some(&categories), ctx, episode)?;
                }
                Err(IterationStop::PoolExhausted) => {
                    let err = match mode {
                        GateMode::Pool(class) => {
                            AllocationError::NoNamespaceAvailable(class.as_str().to_string())
                        }
                        GateMode::Pinned(ns) => {
                            AllocationError::NoNamespaceAvailable(ns.to_string())
                        }
                    };
                    info!(sequence_id = %record_id, error = %err, "waiting for a namespace");
                    self.wait(
                        store,
                        record_id,
                        Some(&[NotificationCategory::PoolExhausted]),
                        ctx,
                        episode,
                    )?;
                }
            }
        }
    }

    fn advisory_due<S: AllocationStore>(
        &self,
        store: &mut S,
        record_id: SequenceId,
        decision: &AdmissionDecision,
    ) -> Result<bool, AllocationError> {
        let priority = store.transaction(|tx| {
            Ok::<_, AllocationError>(tx.get_record(record_id)?.map(|r| r.priority))
        })?;
        Ok(priority.is_some_and(|p| decision.advisory_due(p)))
    }

    /// Marks the record queued (once), sends due notifications, then sleeps.
    fn wait<S: AllocationStore>(
        &self,
        store: &mut S,
        record_id: SequenceId,
        categories: Option<&[NotificationCategory]>,
        ctx: &AllocationContext,
        episode: &mut QueueEpisode,
    ) -> Result<(), AllocationError> {
        let now = self.scheduler.now();
        episode.record_wait(now);
        let record = self.mark_queued(store, record_id, now, episode)?;

        let mut due: Vec<NotificationCategory> = categories
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(|c| episode.claim_notification(*c))
            .collect();
        if episode.watchdog_due(now, self.config.stuck_watchdog) {
            episode.claim_notification(NotificationCategory::StuckInQueue);
            due.push(NotificationCategory::StuckInQueue);
        }
        if let Some(record) = record {
            for category in due {
                let detail = match category {
                    NotificationCategory::StuckInQueue => {
                        let hours = self.config.stuck_watchdog.as_secs() / 3_600;
                        format!("Still queued after {hours}h.")
                    }
                    _ => String::new(),
                };
                let message = compose_message(category, &record.identity, &detail);
                if let Err(err) = self.notifier.notify(category, &record.identity, &message) {
                    warn!(
                        sequence_id = %record_id,
                        category = category.as_str(),
                        error = %err,
                        "notification failed"
                    );
                }
            }
        }

        let wait = episode.next_wait(self.config.poll_interval, self.config.max_backoff);
        self.scheduler.sleep(wait, ctx)?;
        Ok(())
    }

    fn mark_queued<S: AllocationStore>(
        &self,
        store: &mut S,
        record_id: SequenceId,
        now: DateTime<Utc>,
        episode: &mut QueueEpisode,
    ) -> Result<Option<AllocationRecord>, AllocationError> {
        let marked = episode.queued_marked;
        let record = store.transaction(|tx| {
            let Some(record) = tx.get_record(record_id)? else {
                return Ok::<_, AllocationError>(None);
            };
            if !marked && record.status == AllocationStatus::YetToAssign {
                return Ok(Some(tx.transition(record_id, AllocationStatus::Queued, now)?));
            }
            Ok(Some(record))
        })?;
        if !marked {
            if let Some(r) = &record {
                debug!(sequence_id = %record_id, status = %r.status, "request queued");
            }
            episode.queued_marked = true;
        }
        Ok(record)
    }
}
