#![forbid(unsafe_code)]

use nsalloc_contracts::allocation::{CapacitySnapshot, Priority};
use nsalloc_contracts::{ContractViolation, Validate};

use crate::config::CapacityLimits;

pub mod reason_codes {
    pub const ADMIT_NOMINAL: &str = "ADMIT_NOMINAL";
    pub const ADMIT_MEDIUM_BAND: &str = "ADMIT_MEDIUM_BAND";
    pub const REFUSE_OBSERVED_OVER_HIGH: &str = "REFUSE_OBSERVED_OVER_HIGH";
    pub const REFUSE_COMBINED_OVER_HIGH: &str = "REFUSE_COMBINED_OVER_HIGH";
    pub const REFUSE_HIGHER_PRIORITY_PENDING: &str = "REFUSE_HIGHER_PRIORITY_PENDING";
    pub const REFUSE_OLDER_PEER_WAITING: &str = "REFUSE_OLDER_PEER_WAITING";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    ObservedOverHigh,
    CombinedOverHigh,
    HigherPriorityPending,
    OlderPeerWaiting,
}

impl RefusalReason {
    pub fn reason_code(self) -> &'static str {
        match self {
            RefusalReason::ObservedOverHigh => reason_codes::REFUSE_OBSERVED_OVER_HIGH,
            RefusalReason::CombinedOverHigh => reason_codes::REFUSE_COMBINED_OVER_HIGH,
            RefusalReason::HigherPriorityPending => reason_codes::REFUSE_HIGHER_PRIORITY_PENDING,
            RefusalReason::OlderPeerWaiting => reason_codes::REFUSE_OLDER_PEER_WAITING,
        }
    }

    /// Refusals that count as "no capacity" rather than a fairness hold.
    pub fn is_over_capacity(self) -> bool {
        !matches!(self, RefusalReason::OlderPeerWaiting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionInput {
    pub priority: Priority,
    pub snapshot: CapacitySnapshot,
    /// Another `Queued` request of the same priority was queued earlier.
    pub older_peer_waiting: bool,
}

impl Validate for AdmissionInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.snapshot.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdmissionDecision {
    Admit {
        combined_usage: f64,
        medium_band: bool,
    },
    Refuse {
        reason: RefusalReason,
        combined_usage: f64,
        medium_band: bool,
    },
}

impl AdmissionDecision {
    pub fn is_admit(&self) -> bool {
        matches!(self, AdmissionDecision::Admit { .. })
    }

    pub fn combined_usage(&self) -> f64 {
        match self {
            AdmissionDecision::Admit { combined_usage, .. }
            | AdmissionDecision::Refuse { combined_usage, .. } => *combined_usage,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            AdmissionDecision::Admit {
                medium_band: true, ..
            } => reason_codes::ADMIT_MEDIUM_BAND,
            AdmissionDecision::Admit { .. } => reason_codes::ADMIT_NOMINAL,
            AdmissionDecision::Refuse { reason, .. } => reason.reason_code(),
        }
    }

    /// Operators should be told a non-urgent request is competing for scarce capacity.
    pub fn advisory_due(&self, priority: Priority) -> bool {
        let medium_band = match self {
            AdmissionDecision::Admit { medium_band, .. }
            | AdmissionDecision::Refuse { medium_band, .. } => *medium_band,
        };
        medium_band && !priority.is_high_or_critical()
    }
}

/// Pure admission policy over one capacity snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityArbiter {
    limits: CapacityLimits,
}

impl PriorityArbiter {
    pub fn new(limits: CapacityLimits) -> Result<Self, ContractViolation> {
        limits.validate()?;
        Ok(Self { limits })
    }

    pub fn limits(&self) -> CapacityLimits {
        self.limits
    }

    pub fn decide(&self, input: &AdmissionInput) -> Result<AdmissionDecision, ContractViolation> {
        input.validate()?;
        let snapshot = input.snapshot;
        let combined_usage = snapshot.combined();
        let medium_band = combined_usage > self.limits.medium;
        let refuse = |reason| AdmissionDecision::Refuse {
            reason,
            combined_usage,
            medium_band,
        };

        if snapshot.observed_usage > self.limits.high {
            return Ok(refuse(RefusalReason::ObservedOverHigh));
        }
        if combined_usage > self.limits.high {
            return Ok(refuse(RefusalReason::CombinedOverHigh));
        }
        if snapshot.combined_with_pending() > self.limits.high {
            return Ok(refuse(RefusalReason::HigherPriorityPending));
        }
        if medium_band && !input.priority.is_high_or_critical() && input.older_peer_waiting {
            return Ok(refuse(RefusalReason::OlderPeerWaiting));
        }
        Ok(AdmissionDecision::Admit {
            combined_usage,
            medium_band,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbiter() -> PriorityArbiter {
        PriorityArbiter::new(CapacityLimits::from_max(800.0)).unwrap()
    }

    fn input(priority: Priority, observed: f64, committed: f64, pending: f64) -> AdmissionInput {
        AdmissionInput {
            priority,
            snapshot: CapacitySnapshot {
                observed_usage: observed,
                committed_estimates: committed,
                higher_pending_estimates: pending,
            },
            older_peer_waiting: false,
        }
    }

    #[test]
    fn at_arbiter_01_nominal_load_admits() {
        let out = arbiter().decide(&input(Priority::Low, 100.0, 50.0, 0.0)).unwrap();
        assert_eq!(
            out,
            AdmissionDecision::Admit {
                combined_usage: 150.0,
                medium_band: false
            }
        );
        assert_eq!(out.reason_code(), reason_codes::ADMIT_NOMINAL);
    }

    #[test]
    fn at_arbiter_02_over_high_refuses_every_priority() {
        for p in Priority::ALL {
            let out = arbiter().decide(&input(p, 601.0, 0.0, 0.0)).unwrap();
            assert_eq!(out.reason_code(), reason_codes::REFUSE_OBSERVED_OVER_HIGH);
            let out = arbiter().decide(&input(p, 500.0, 150.0, 0.0)).unwrap();
            assert_eq!(out.reason_code(), reason_codes::REFUSE_COMBINED_OVER_HIGH);
        }
    }

    #[test]
    fn at_arbiter_03_higher_pending_demand_preempts() {
        let out = arbiter().decide(&input(Priority::Low, 400.0, 100.0, 160.0)).unwrap();
        assert_eq!(
            out.reason_code(),
            reason_codes::REFUSE_HIGHER_PRIORITY_PENDING
        );
        let out = arbiter().decide(&input(Priority::Low, 400.0, 100.0, 100.0)).unwrap();
        assert!(out.is_admit());
    }

    #[test]
    fn at_arbiter_04_fifo_hold_applies_only_in_medium_band_below_high_priority() {
        let mut held = input(Priority::Medium, 350.0, 0.0, 0.0);
        held.older_peer_waiting = true;
        let out = arbiter().decide(&held).unwrap();
        assert_eq!(out.reason_code(), reason_codes::REFUSE_OLDER_PEER_WAITING);
        assert!(out.advisory_due(Priority::Medium));

        held.priority = Priority::High;
        assert!(arbiter().decide(&held).unwrap().is_admit());

        let mut calm = input(Priority::Medium, 100.0, 0.0, 0.0);
        calm.older_peer_waiting = true;
        assert!(arbiter().decide(&calm).unwrap().is_admit());
    }

    #[test]
    fn at_arbiter_05_boundary_equal_to_high_is_admitted() {
        let out = arbiter().decide(&input(Priority::Low, 600.0, 0.0, 0.0)).unwrap();
        assert!(out.is_admit());
        assert_eq!(out.reason_code(), reason_codes::ADMIT_MEDIUM_BAND);
        assert!(out.advisory_due(Priority::Low));
        assert!(!out.advisory_due(Priority::Critical));
    }

    #[test]
    fn at_arbiter_06_invalid_snapshot_rejected() {
        assert!(arbiter()
            .decide(&input(Priority::Low, f64::NAN, 0.0, 0.0))
            .is_err());
        assert!(PriorityArbiter::new(CapacityLimits {
            high: 100.0,
            medium: 200.0
        })
        .is_err());
    }
}
