#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{validate_bounded_text, validate_cpu, validate_token_ascii};
use crate::request::{Fingerprint, RequestIdentity};
use crate::{ContractViolation, Validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceId(pub u64);

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NamespaceName(String);

impl NamespaceName {
    pub fn new(name: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(name.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl Validate for NamespaceName {
    fn validate(&self) -> Result<(), ContractViolation> {
        // Kubernetes namespace names are DNS labels.
        validate_token_ascii("namespace_name", &self.0, 63)?;
        if self.0.contains('_') || self.0.contains('.') || self.0.starts_with('-') {
            return Err(ContractViolation::InvalidValue {
                field: "namespace_name",
                reason: "must be a DNS label",
            });
        }
        Ok(())
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The name prefix that partitions the pool by workload kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrefixClass(String);

impl PrefixClass {
    pub fn new(prefix: impl Into<String>) -> Result<Self, ContractViolation> {
        let prefix = prefix.into();
        validate_token_ascii("prefix_class", &prefix, 48)?;
        Ok(Self(prefix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn contains(&self, name: &NamespaceName) -> bool {
        name.has_prefix(&self.0)
    }
}

impl fmt::Display for PrefixClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvailabilityStatus {
    Available,
    LockedForAllocation,
    InUse,
}

impl AvailabilityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AvailabilityStatus::Available => "AVAILABLE",
            AvailabilityStatus::LockedForAllocation => "LOCKED_FOR_ALLOCATION",
            AvailabilityStatus::InUse => "IN_USE",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        match raw {
            "AVAILABLE" => Ok(AvailabilityStatus::Available),
            "LOCKED_FOR_ALLOCATION" => Ok(AvailabilityStatus::LockedForAllocation),
            "IN_USE" => Ok(AvailabilityStatus::InUse),
            _ => Err(ContractViolation::InvalidValue {
                field: "namespace.availability_status",
                reason: "unknown availability status",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationStatus {
    YetToAssign,
    Queued,
    Assigned,
    Hardcode,
}

impl AllocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStatus::YetToAssign => "YET_TO_ASSIGN",
            AllocationStatus::Queued => "QUEUED",
            AllocationStatus::Assigned => "ASSIGNED",
            AllocationStatus::Hardcode => "HARDCODE",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        match raw {
            "YET_TO_ASSIGN" => Ok(AllocationStatus::YetToAssign),
            "QUEUED" => Ok(AllocationStatus::Queued),
            "ASSIGNED" => Ok(AllocationStatus::Assigned),
            "HARDCODE" => Ok(AllocationStatus::Hardcode),
            _ => Err(ContractViolation::InvalidValue {
                field: "allocation_record.status",
                reason: "unknown allocation status",
            }),
        }
    }

    /// Statuses that hold a namespace.
    pub fn is_bound(self) -> bool {
        matches!(self, AllocationStatus::Assigned | AllocationStatus::Hardcode)
    }

    /// Statuses still waiting for admission.
    pub fn is_pending(self) -> bool {
        matches!(self, AllocationStatus::YetToAssign | AllocationStatus::Queued)
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration order is the priority order: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "MEDIUM" => Ok(Priority::Medium),
            "HIGH" => Ok(Priority::High),
            "CRITICAL" => Ok(Priority::Critical),
            _ => Err(ContractViolation::InvalidValue {
                field: "priority",
                reason: "must be one of: low, medium, high, critical",
            }),
        }
    }

    /// Every class strictly above `self`.
    pub fn strictly_higher(self) -> Vec<Priority> {
        Priority::ALL.into_iter().filter(|p| *p > self).collect()
    }

    pub fn is_high_or_critical(self) -> bool {
        self >= Priority::High
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationRecord {
    pub sequence_id: SequenceId,
    pub fingerprint: Fingerprint,
    pub identity: RequestIdentity,
    pub status: AllocationStatus,
    pub namespace: Option<NamespaceName>,
    pub priority: Priority,
    pub owner: Option<String>,
    pub pipeline_reference: Option<String>,
    pub cpu_estimate: f64,
    pub registered_at: DateTime<Utc>,
    pub queue_timestamp: Option<DateTime<Utc>>,
}

impl AllocationRecord {
    pub fn bound_namespace(&self) -> Option<&NamespaceName> {
        if self.status.is_bound() {
            self.namespace.as_ref()
        } else {
            None
        }
    }
}

/// Everything needed to create or re-pin a ledger row; the store assigns the sequence id.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRecordInput {
    pub identity: RequestIdentity,
    pub status: AllocationStatus,
    pub namespace: Option<NamespaceName>,
    pub priority: Priority,
    pub owner: Option<String>,
    pub pipeline_reference: Option<String>,
    pub cpu_estimate: f64,
    pub now: DateTime<Utc>,
}

impl AllocationRecordInput {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        identity: RequestIdentity,
        status: AllocationStatus,
        namespace: Option<NamespaceName>,
        priority: Priority,
        owner: Option<String>,
        pipeline_reference: Option<String>,
        cpu_estimate: f64,
        now: DateTime<Utc>,
    ) -> Result<Self, ContractViolation> {
        let input = Self {
            identity,
            status,
            namespace,
            priority,
            owner,
            pipeline_reference,
            cpu_estimate,
            now,
        };
        input.validate()?;
        Ok(input)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }
}

impl Validate for AllocationRecordInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.identity.validate()?;
        validate_cpu("allocation_record_input.cpu_estimate", self.cpu_estimate)?;
        match (self.status, &self.namespace) {
            (AllocationStatus::YetToAssign, None) => {}
            (AllocationStatus::Hardcode, Some(ns)) => ns.validate()?,
            (AllocationStatus::YetToAssign, Some(_)) => {
                return Err(ContractViolation::InvalidValue {
                    field: "allocation_record_input.namespace",
                    reason: "must be empty for YET_TO_ASSIGN",
                })
            }
            (AllocationStatus::Hardcode, None) => {
                return Err(ContractViolation::InvalidValue {
                    field: "allocation_record_input.namespace",
                    reason: "must be present for HARDCODE",
                })
            }
            (AllocationStatus::Queued | AllocationStatus::Assigned, _) => {
                return Err(ContractViolation::InvalidValue {
                    field: "allocation_record_input.status",
                    reason: "records are created as YET_TO_ASSIGN or HARDCODE",
                })
            }
        }
        if let Some(owner) = &self.owner {
            validate_token_ascii("allocation_record_input.owner", owner, 128)?;
        }
        if let Some(pipeline) = &self.pipeline_reference {
            validate_bounded_text("allocation_record_input.pipeline_reference", pipeline, 512)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceRecord {
    pub name: NamespaceName,
    pub availability: AvailabilityStatus,
    pub allocation_lock: bool,
    pub locked_at: Option<DateTime<Utc>>,
}

impl NamespaceRecord {
    pub fn available(name: NamespaceName) -> Self {
        Self {
            name,
            availability: AvailabilityStatus::Available,
            allocation_lock: false,
            locked_at: None,
        }
    }

    pub fn is_allocatable(&self) -> bool {
        self.availability == AvailabilityStatus::Available && !self.allocation_lock
    }
}

/// Recomputed every admission iteration; never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacitySnapshot {
    pub observed_usage: f64,
    pub committed_estimates: f64,
    pub higher_pending_estimates: f64,
}

impl CapacitySnapshot {
    pub fn combined(&self) -> f64 {
        self.observed_usage + self.committed_estimates
    }

    pub fn combined_with_pending(&self) -> f64 {
        self.combined() + self.higher_pending_estimates
    }
}

impl Validate for CapacitySnapshot {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_cpu("capacity_snapshot.observed_usage", self.observed_usage)?;
        validate_cpu("capacity_snapshot.committed_estimates", self.committed_estimates)?;
        validate_cpu(
            "capacity_snapshot.higher_pending_estimates",
            self.higher_pending_estimates,
        )
    }
}
