#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use nsalloc_contracts::allocation::{
    AllocationRecordInput, AllocationStatus, NamespaceName, Priority,
};
use nsalloc_contracts::request::{RequestIdentity, WorkloadKind};
use nsalloc_storage::{AllocationStore, LedgerStore, SqliteLedgerStore, StorageError};

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn ns(name: &str) -> NamespaceName {
    NamespaceName::new(name).unwrap()
}

fn pending(tag: &str, priority: Priority, at: i64) -> AllocationRecordInput {
    AllocationRecordInput::v1(
        RequestIdentity::v1(WorkloadKind::Policy, tag, true, false).unwrap(),
        AllocationStatus::YetToAssign,
        None,
        priority,
        Some("alice".to_string()),
        None,
        80.0,
        t(at),
    )
    .unwrap()
}

fn pinned(tag: &str, namespace: &str) -> AllocationRecordInput {
    AllocationRecordInput::v1(
        RequestIdentity::v1(WorkloadKind::Policy, tag, false, false).unwrap(),
        AllocationStatus::Hardcode,
        Some(ns(namespace)),
        Priority::Low,
        None,
        None,
        80.0,
        t(0),
    )
    .unwrap()
}

fn for_each_backend(check: impl Fn(&mut dyn FnMut() -> Backend)) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    check(&mut || Backend::Memory(LedgerStore::new_in_memory()));
    check(&mut || Backend::Sqlite(SqliteLedgerStore::open(&path).unwrap()));
}

enum Backend {
    Memory(LedgerStore),
    Sqlite(SqliteLedgerStore),
}

impl AllocationStore for Backend {
    fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut dyn nsalloc_storage::AllocationTx) -> Result<T, E>,
    {
        match self {
            Backend::Memory(s) => s.transaction(f),
            Backend::Sqlite(s) => s.transaction(f),
        }
    }
}

#[test]
fn at_ledger_db_01_one_row_per_fingerprint() {
    for_each_backend(|fresh| {
        let mut s = fresh();
        s.transaction(|tx| tx.create_record(pending("24.1.2", Priority::Critical, 0)))
            .unwrap();
        let dup = s.transaction(|tx| tx.create_record(pending("24.1.2", Priority::Critical, 5)));
        assert!(matches!(dup, Err(StorageError::DuplicateKey { .. })));
        let rows = s.transaction(|tx| tx.records()).unwrap();
        assert_eq!(rows.len(), 1);
    });
}

#[test]
fn at_ledger_db_02_status_machine_is_forward_only() {
    for_each_backend(|fresh| {
        let mut s = fresh();
        let rec = s
            .transaction(|tx| tx.create_record(pending("24.1.2", Priority::High, 0)))
            .unwrap();
        assert_eq!(rec.status, AllocationStatus::YetToAssign);
        assert_eq!(rec.namespace, None);

        let queued = s
            .transaction(|tx| tx.transition(rec.sequence_id, AllocationStatus::Queued, t(10)))
            .unwrap();
        assert_eq!(queued.queue_timestamp, Some(t(10)));

        let again = s.transaction(|tx| tx.transition(rec.sequence_id, AllocationStatus::Queued, t(20)));
        assert!(matches!(again, Err(StorageError::InvalidTransition { .. })));

        let bound = s
            .transaction(|tx| tx.bind_namespace(rec.sequence_id, &ns("o-devops-pol1"), Some("p/7")))
            .unwrap();
        assert_eq!(bound.status, AllocationStatus::Assigned);
        assert_eq!(bound.namespace, Some(ns("o-devops-pol1")));
        assert_eq!(bound.pipeline_reference.as_deref(), Some("p/7"));

        let back = s.transaction(|tx| tx.transition(rec.sequence_id, AllocationStatus::Queued, t(30)));
        assert!(matches!(back, Err(StorageError::InvalidTransition { .. })));
    });
}

#[test]
fn at_ledger_db_03_namespace_held_by_at_most_one_record() {
    for_each_backend(|fresh| {
        let mut s = fresh();
        let (a, b) = s
            .transaction(|tx| {
                let a = tx.create_record(pending("24.1.2", Priority::High, 0))?;
                let b = tx.create_record(pending("24.1.3", Priority::High, 0))?;
                Ok::<_, StorageError>((a, b))
            })
            .unwrap();
        s.transaction(|tx| tx.bind_namespace(a.sequence_id, &ns("o-devops-pol1"), None))
            .unwrap();
        let clash = s.transaction(|tx| tx.bind_namespace(b.sequence_id, &ns("o-devops-pol1"), None));
        assert!(matches!(clash, Err(StorageError::NamespaceConflict { .. })));
        let pin_clash = s.transaction(|tx| tx.create_record(pinned("x", "o-devops-pol1")));
        assert!(matches!(pin_clash, Err(StorageError::NamespaceConflict { .. })));
    });
}

#[test]
fn at_ledger_db_04_committed_cpu_counts_bound_rows_only() {
    for_each_backend(|fresh| {
        let mut s = fresh();
        let committed = s
            .transaction(|tx| {
                let a = tx.create_record(pending("24.1.2", Priority::High, 0))?;
                tx.create_record(pending("24.1.3", Priority::High, 0))?;
                tx.create_record(pinned("manual", "o-devops-manual1"))?;
                tx.bind_namespace(a.sequence_id, &ns("o-devops-pol1"), None)?;
                tx.committed_cpu()
            })
            .unwrap();
        assert_eq!(committed, 160.0);
    });
}

#[test]
fn at_ledger_db_05_delete_by_namespace_frees_fingerprint() {
    for_each_backend(|fresh| {
        let mut s = fresh();
        s.transaction(|tx| tx.create_record(pinned("manual", "o-devops-manual1")))
            .unwrap();
        let removed = s
            .transaction(|tx| tx.delete_by_namespace(&ns("o-devops-manual1")))
            .unwrap();
        assert_eq!(removed.map(|r| r.status), Some(AllocationStatus::Hardcode));
        let none = s
            .transaction(|tx| tx.delete_by_namespace(&ns("o-devops-manual1")))
            .unwrap();
        assert!(none.is_none());
        s.transaction(|tx| tx.create_record(pinned("manual", "o-devops-manual1")))
            .unwrap();
    });
}

#[test]
fn at_ledger_db_06_older_queued_peer_detection() {
    for_each_backend(|fresh| {
        let mut s = fresh();
        let (a, b) = s
            .transaction(|tx| {
                let a = tx.create_record(pending("a", Priority::Medium, 0))?;
                let b = tx.create_record(pending("b", Priority::Medium, 0))?;
                tx.transition(a.sequence_id, AllocationStatus::Queued, t(100))?;
                tx.transition(b.sequence_id, AllocationStatus::Queued, t(200))?;
                Ok::<_, StorageError>((a, b))
            })
            .unwrap();
        let (b_waits, a_waits, low_waits) = s
            .transaction(|tx| {
                Ok::<_, StorageError>((
                    tx.older_queued_peer_exists(b.sequence_id, Priority::Medium, t(200))?,
                    tx.older_queued_peer_exists(a.sequence_id, Priority::Medium, t(100))?,
                    tx.older_queued_peer_exists(b.sequence_id, Priority::Low, t(200))?,
                ))
            })
            .unwrap();
        assert!(b_waits);
        assert!(!a_waits);
        assert!(!low_waits);
    });
}

#[test]
fn at_ledger_db_07_requeue_clears_binding_and_restamps() {
    for_each_backend(|fresh| {
        let mut s = fresh();
        let rec = s
            .transaction(|tx| {
                let r = tx.create_record(pending("24.1.2", Priority::High, 0))?;
                tx.transition(r.sequence_id, AllocationStatus::Queued, t(5))
            })
            .unwrap();
        let requeued = s
            .transaction(|tx| tx.transition(rec.sequence_id, AllocationStatus::YetToAssign, t(60)))
            .unwrap();
        assert_eq!(requeued.queue_timestamp, None);
        assert_eq!(requeued.registered_at, t(60));
        let window = s
            .transaction(|tx| tx.pending_cpu(&[Priority::High], t(60) - Duration::seconds(1)))
            .unwrap();
        assert_eq!(window, 80.0);
    });
}

#[test]
fn at_ledger_db_08_sqlite_rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    {
        let mut s = SqliteLedgerStore::open(&path).unwrap();
        s.transaction(|tx| tx.create_record(pending("24.1.2", Priority::Critical, 0)))
            .unwrap();
    }
    let mut s = SqliteLedgerStore::open(&path).unwrap();
    let rows = s.transaction(|tx| tx.records()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].priority, Priority::Critical);
}
