#![forbid(unsafe_code)]

use std::env;
use std::time::Duration;

use nsalloc_contracts::allocation::{PrefixClass, Priority};
use nsalloc_contracts::request::WorkloadKind;
use nsalloc_contracts::{ContractViolation, Validate};

pub const MAX_CPU_LIMIT_DEFAULT: f64 = 800.0;
pub const POLICY_CPU_ESTIMATE_DEFAULT: f64 = 80.0;
pub const BSF_CPU_ESTIMATE_DEFAULT: f64 = 50.0;
pub const PINNED_NAMESPACE_PREFIX_DEFAULT: &str = "o-devops-";
pub const PRE_DEVELOPMENT_MARKER_DEFAULT: &str = "ocngf-pre-dev";

/// Admission thresholds in CPU cores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityLimits {
    pub high: f64,
    pub medium: f64,
}

impl CapacityLimits {
    /// `high = max - 200`, `medium = max - 500`.
    pub fn from_max(max_cpu: f64) -> Self {
        Self {
            high: max_cpu - 200.0,
            medium: max_cpu - 500.0,
        }
    }
}

impl Validate for CapacityLimits {
    fn validate(&self) -> Result<(), ContractViolation> {
        if !self.high.is_finite() {
            return Err(ContractViolation::NotFinite {
                field: "capacity_limits.high",
            });
        }
        if !self.medium.is_finite() {
            return Err(ContractViolation::NotFinite {
                field: "capacity_limits.medium",
            });
        }
        if self.high <= 0.0 {
            return Err(ContractViolation::InvalidValue {
                field: "capacity_limits.high",
                reason: "must be > 0",
            });
        }
        if self.medium < 0.0 || self.medium > self.high {
            return Err(ContractViolation::InvalidRange {
                field: "capacity_limits.medium",
                min: 0.0,
                max: self.high,
                got: self.medium,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorConfig {
    pub limits: CapacityLimits,
    pub poll_interval: Duration,
    /// Upper bound for the backoff applied while the capacity source is unreachable.
    pub max_backoff: Duration,
    pub priority_check_interval: Duration,
    pub stuck_watchdog: Duration,
    pub stale_lock_timeout: Duration,
    pub default_priority: Priority,
    pub pre_development_marker: String,
    pub policy_cpu_estimate: f64,
    pub bsf_cpu_estimate: f64,
    pub pinned_namespace_prefix: String,
    pub policy_pool_prefix: String,
    pub bsf_pool_prefix: String,
}

impl AllocatorConfig {
    pub fn mvp_v1() -> Self {
        Self {
            limits: CapacityLimits::from_max(MAX_CPU_LIMIT_DEFAULT),
            poll_interval: Duration::from_secs(600),
            max_backoff: Duration::from_secs(4_800),
            priority_check_interval: Duration::from_secs(60 * 60),
            stuck_watchdog: Duration::from_secs(4 * 60 * 60),
            stale_lock_timeout: Duration::from_secs(30 * 60),
            default_priority: Priority::Low,
            pre_development_marker: PRE_DEVELOPMENT_MARKER_DEFAULT.to_string(),
            policy_cpu_estimate: POLICY_CPU_ESTIMATE_DEFAULT,
            bsf_cpu_estimate: BSF_CPU_ESTIMATE_DEFAULT,
            pinned_namespace_prefix: PINNED_NAMESPACE_PREFIX_DEFAULT.to_string(),
            policy_pool_prefix: "o-devops-pol".to_string(),
            bsf_pool_prefix: "o-devops-bsf".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, ContractViolation> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Applies `NSALLOC_*` overrides on top of [`AllocatorConfig::mvp_v1`]. Values that fail
    /// to parse or fall outside their range are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ContractViolation> {
        let mut cfg = Self::mvp_v1();
        if let Some(max) = parse_in_range::<f64>(&lookup, "NSALLOC_MAX_CPU_LIMIT", 1.0, 1.0e5) {
            cfg.limits = CapacityLimits::from_max(max);
        }
        if let Some(v) = parse_in_range::<f64>(&lookup, "NSALLOC_HIGH_LIMIT", 1.0, 1.0e5) {
            cfg.limits.high = v;
        }
        if let Some(v) = parse_in_range::<f64>(&lookup, "NSALLOC_MEDIUM_LIMIT", 0.0, 1.0e5) {
            cfg.limits.medium = v;
        }
        if let Some(v) = parse_in_range::<u64>(&lookup, "NSALLOC_POLL_INTERVAL_SECS", 1, 86_400) {
            cfg.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) =
            parse_in_range::<u64>(&lookup, "NSALLOC_PRIORITY_CHECK_INTERVAL_MINS", 1, 10_080)
        {
            cfg.priority_check_interval = Duration::from_secs(v * 60);
        }
        if let Some(v) = parse_in_range::<u64>(&lookup, "NSALLOC_STUCK_WATCHDOG_MINS", 1, 10_080) {
            cfg.stuck_watchdog = Duration::from_secs(v * 60);
        }
        if let Some(v) =
            parse_in_range::<u64>(&lookup, "NSALLOC_STALE_LOCK_TIMEOUT_MINS", 1, 10_080)
        {
            cfg.stale_lock_timeout = Duration::from_secs(v * 60);
        }
        if let Some(raw) = lookup("NSALLOC_DEFAULT_PRIORITY") {
            cfg.default_priority = Priority::parse(&raw)?;
        }
        cfg.max_backoff = cfg.poll_interval.saturating_mul(8);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn prefix_class_for(&self, kind: WorkloadKind) -> Result<PrefixClass, ContractViolation> {
        match kind {
            WorkloadKind::Policy => PrefixClass::new(self.policy_pool_prefix.clone()),
            WorkloadKind::Bsf => PrefixClass::new(self.bsf_pool_prefix.clone()),
        }
    }

    pub fn cpu_estimate_for(&self, kind: WorkloadKind) -> f64 {
        match kind {
            WorkloadKind::Policy => self.policy_cpu_estimate,
            WorkloadKind::Bsf => self.bsf_cpu_estimate,
        }
    }

    pub fn is_pinned_namespace(&self, name: &str) -> bool {
        name.starts_with(&self.pinned_namespace_prefix)
    }
}

impl Validate for AllocatorConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.limits.validate()?;
        if self.poll_interval.is_zero() {
            return Err(ContractViolation::InvalidValue {
                field: "allocator_config.poll_interval",
                reason: "must be > 0",
            });
        }
        if self.max_backoff < self.poll_interval {
            return Err(ContractViolation::InvalidValue {
                field: "allocator_config.max_backoff",
                reason: "must be >= poll_interval",
            });
        }
        if self.stale_lock_timeout.is_zero() {
            return Err(ContractViolation::InvalidValue {
                field: "allocator_config.stale_lock_timeout",
                reason: "must be > 0",
            });
        }
        PrefixClass::new(self.policy_pool_prefix.clone())?;
        PrefixClass::new(self.bsf_pool_prefix.clone())?;
        if self.pinned_namespace_prefix.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "allocator_config.pinned_namespace_prefix",
                reason: "must be non-empty",
            });
        }
        Ok(())
    }
}

fn parse_in_range<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    min: T,
    max: T,
) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v >= min && *v <= max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn at_config_01_defaults_follow_max_cpu() {
        let cfg = AllocatorConfig::mvp_v1();
        assert_eq!(cfg.limits.high, 600.0);
        assert_eq!(cfg.limits.medium, 300.0);
        assert_eq!(cfg.default_priority, Priority::Low);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn at_config_02_env_overrides_apply_and_bad_values_are_ignored() {
        let cfg = AllocatorConfig::from_lookup(lookup(&[
            ("NSALLOC_MAX_CPU_LIMIT", "1000"),
            ("NSALLOC_POLL_INTERVAL_SECS", "30"),
            ("NSALLOC_STALE_LOCK_TIMEOUT_MINS", "not-a-number"),
        ]))
        .unwrap();
        assert_eq!(cfg.limits.high, 800.0);
        assert_eq!(cfg.limits.medium, 500.0);
        assert_eq!(cfg.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.max_backoff, Duration::from_secs(240));
        assert_eq!(cfg.stale_lock_timeout, Duration::from_secs(30 * 60));
    }

    #[test]
    fn at_config_03_inconsistent_limits_are_rejected() {
        let out = AllocatorConfig::from_lookup(lookup(&[
            ("NSALLOC_HIGH_LIMIT", "100"),
            ("NSALLOC_MEDIUM_LIMIT", "200"),
        ]));
        assert!(out.is_err());
        assert!(AllocatorConfig::from_lookup(lookup(&[("NSALLOC_DEFAULT_PRIORITY", "urgent")]))
            .is_err());
    }

    #[test]
    fn at_config_04_prefix_classes_by_workload() {
        let cfg = AllocatorConfig::mvp_v1();
        assert_eq!(
            cfg.prefix_class_for(WorkloadKind::Bsf).unwrap().as_str(),
            "o-devops-bsf"
        );
        assert_eq!(cfg.cpu_estimate_for(WorkloadKind::Policy), 80.0);
        assert!(cfg.is_pinned_namespace("o-devops-manual1"));
        assert!(!cfg.is_pinned_namespace("team-a"));
    }
}
