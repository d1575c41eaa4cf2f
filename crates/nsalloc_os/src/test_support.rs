#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use nsalloc_contracts::allocation::NamespaceName;
use nsalloc_contracts::request::{RequestIdentity, WorkloadKind};
use nsalloc_engines::capacity::{CapacitySource, CapacitySourceError};
use nsalloc_engines::notify::{NotificationCategory, NotificationSink, NotifyError};

use crate::publish::{OutputChannel, PublishError};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub fn policy_request_identity(tag: &str) -> RequestIdentity {
    RequestIdentity::v1(WorkloadKind::Policy, tag, true, false).unwrap()
}

/// Replays scripted readings; the last one repeats forever.
#[derive(Debug)]
pub struct ScriptedCapacity {
    readings: Mutex<VecDeque<Result<f64, CapacitySourceError>>>,
    calls: AtomicUsize,
}

impl ScriptedCapacity {
    pub fn new(readings: Vec<Result<f64, CapacitySourceError>>) -> Self {
        assert!(!readings.is_empty());
        Self {
            readings: Mutex::new(readings.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CapacitySource for ScriptedCapacity {
    fn current_usage(&self) -> Result<f64, CapacitySourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut readings = self.readings.lock().unwrap();
        if readings.len() > 1 {
            readings.pop_front().unwrap()
        } else {
            readings.front().cloned().unwrap()
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(NotificationCategory, String)>>,
}

impl RecordingSink {
    pub fn count(&self, category: NotificationCategory) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == category)
            .count()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(
        &self,
        category: NotificationCategory,
        identity: &RequestIdentity,
        _message: &str,
    ) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((category, identity.release_tag.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    pub published: Arc<Mutex<Vec<String>>>,
}

impl RecordingPublisher {
    pub fn names(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

impl OutputChannel for RecordingPublisher {
    fn publish(&self, namespace: &NamespaceName) -> Result<(), PublishError> {
        self.published
            .lock()
            .unwrap()
            .push(namespace.as_str().to_string());
        Ok(())
    }
}
