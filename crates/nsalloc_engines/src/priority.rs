#![forbid(unsafe_code)]

use std::sync::LazyLock;

use nsalloc_contracts::allocation::Priority;
use regex::Regex;

use crate::config::AllocatorConfig;

/// Finalized release, e.g. `23.4.1`.
static FINAL_RELEASE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{2}\.[0-9]{1,2}\.[0-9]{1,2}$").expect("final release regex is valid")
});

/// Pre-release build, e.g. `23.4.1-ocngf-4000` with any trailing suffix.
static PRE_RELEASE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{2}\.[0-9]{1,2}\.[0-9]{1,2}-ocngf-[0-9]+")
        .expect("pre-release regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityPolicy {
    pub default_priority: Priority,
    pub pre_development_marker: String,
}

impl PriorityPolicy {
    pub fn from_config(config: &AllocatorConfig) -> Self {
        Self {
            default_priority: config.default_priority,
            pre_development_marker: config.pre_development_marker.clone(),
        }
    }

    /// Total over all inputs; rules are tried in order and the first match wins.
    pub fn derive(&self, official_build: bool, release_tag: &str, rollback: bool) -> Priority {
        if official_build {
            if rollback {
                Priority::Medium
            } else if FINAL_RELEASE_TAG.is_match(release_tag) {
                Priority::Critical
            } else if PRE_RELEASE_TAG.is_match(release_tag) {
                Priority::Low
            } else {
                Priority::High
            }
        } else if !self.pre_development_marker.is_empty()
            && release_tag.contains(&self.pre_development_marker)
        {
            Priority::Medium
        } else {
            self.default_priority
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PriorityPolicy {
        PriorityPolicy::from_config(&AllocatorConfig::mvp_v1())
    }

    #[test]
    fn at_priority_01_official_build_rules() {
        let p = policy();
        assert_eq!(p.derive(true, "23.4.1", true), Priority::Medium);
        assert_eq!(p.derive(true, "23.4.1", false), Priority::Critical);
        assert_eq!(p.derive(true, "24.12.10", false), Priority::Critical);
        assert_eq!(p.derive(true, "23.4.1-ocngf-4000", false), Priority::Low);
        assert_eq!(p.derive(true, "23.4.1-ocngf-4000-rc2", false), Priority::Low);
        assert_eq!(p.derive(true, "garbage", false), Priority::High);
    }

    #[test]
    fn at_priority_02_near_miss_tags_fall_through_to_high() {
        let p = policy();
        assert_eq!(p.derive(true, "3.4.1", false), Priority::High);
        assert_eq!(p.derive(true, "23.4.123", false), Priority::High);
        assert_eq!(p.derive(true, "23.4.1-rc1", false), Priority::High);
        assert_eq!(p.derive(true, "23.4.1-ocngf-", false), Priority::High);
        assert_eq!(p.derive(true, "", false), Priority::High);
    }

    #[test]
    fn at_priority_03_unofficial_builds() {
        let p = policy();
        assert_eq!(p.derive(false, "x-ocngf-pre-dev-y", false), Priority::Medium);
        assert_eq!(p.derive(false, "x-ocngf-pre-dev-y", true), Priority::Medium);
        assert_eq!(p.derive(false, "x", false), Priority::Low);
        assert_eq!(p.derive(false, "23.4.1", false), Priority::Low);
    }

    #[test]
    fn at_priority_04_default_is_configurable() {
        let p = PriorityPolicy {
            default_priority: Priority::High,
            pre_development_marker: "ocngf-pre-dev".to_string(),
        };
        assert_eq!(p.derive(false, "x", false), Priority::High);
    }

    #[test]
    fn at_priority_05_rule_order_is_deterministic() {
        let p = policy();
        for _ in 0..3 {
            assert_eq!(p.derive(true, "23.4.1-ocngf-1", true), Priority::Medium);
        }
    }
}
