#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use nsalloc_contracts::allocation::{AvailabilityStatus, NamespaceName, PrefixClass};
use nsalloc_storage::{AllocationStore, LedgerStore, SqliteLedgerStore, StorageError};

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn ns(name: &str) -> NamespaceName {
    NamespaceName::new(name).unwrap()
}

fn policy() -> PrefixClass {
    PrefixClass::new("o-devops-pol").unwrap()
}

fn seed<S: AllocationStore>(s: &mut S, names: &[&str]) {
    s.transaction(|tx| {
        for n in names {
            tx.register_namespace(&ns(n))?;
        }
        Ok::<_, StorageError>(())
    })
    .unwrap();
}

fn pool_scenarios<S: AllocationStore>(mut fresh: impl FnMut() -> S) {
    // first match in name order, filtered by class
    let mut s = fresh();
    seed(&mut s, &["o-devops-bsf1", "o-devops-pol2", "o-devops-pol1"]);
    let first = s.transaction(|tx| tx.find_available(&policy())).unwrap();
    assert_eq!(first.map(|r| r.name), Some(ns("o-devops-pol1")));

    // locked namespaces are skipped; double lock conflicts
    s.transaction(|tx| tx.lock_namespace(&ns("o-devops-pol1"), t(0)))
        .unwrap();
    let second = s.transaction(|tx| tx.find_available(&policy())).unwrap();
    assert_eq!(second.map(|r| r.name), Some(ns("o-devops-pol2")));
    let relock = s.transaction(|tx| tx.lock_namespace(&ns("o-devops-pol1"), t(1)));
    assert!(matches!(relock, Err(StorageError::NamespaceConflict { .. })));

    // commit requires the lock, and clears it
    let premature = s.transaction(|tx| tx.commit_namespace(&ns("o-devops-pol2")));
    assert!(matches!(premature, Err(StorageError::NamespaceConflict { .. })));
    s.transaction(|tx| tx.commit_namespace(&ns("o-devops-pol1")))
        .unwrap();
    let row = s
        .transaction(|tx| tx.namespace(&ns("o-devops-pol1")))
        .unwrap()
        .unwrap();
    assert_eq!(row.availability, AvailabilityStatus::InUse);
    assert!(!row.allocation_lock);
    assert_eq!(row.locked_at, None);

    // release round-trips back into find_available
    s.transaction(|tx| tx.lock_namespace(&ns("o-devops-pol2"), t(2)))
        .unwrap();
    s.transaction(|tx| tx.commit_namespace(&ns("o-devops-pol2")))
        .unwrap();
    assert!(s.transaction(|tx| tx.find_available(&policy())).unwrap().is_none());
    s.transaction(|tx| tx.release_namespace(&ns("o-devops-pol2")))
        .unwrap();
    let back = s.transaction(|tx| tx.find_available(&policy())).unwrap();
    assert_eq!(back.map(|r| r.name), Some(ns("o-devops-pol2")));

    // unknown names
    let missing = s.transaction(|tx| tx.release_namespace(&ns("o-devops-pol9")));
    assert!(matches!(missing, Err(StorageError::NotFound { .. })));
    assert!(!s.transaction(|tx| tx.mark_in_use(&ns("o-devops-manual1"))).unwrap());

    // duplicates
    let dup = s.transaction(|tx| tx.register_namespace(&ns("o-devops-bsf1")));
    assert!(matches!(dup, Err(StorageError::DuplicateKey { .. })));

    // stale locks
    let mut s = fresh();
    seed(&mut s, &["o-devops-pol1", "o-devops-pol2", "o-devops-pol3"]);
    s.transaction(|tx| {
        tx.lock_namespace(&ns("o-devops-pol1"), t(0))?;
        tx.lock_namespace(&ns("o-devops-pol2"), t(500))
    })
    .unwrap();
    let stale = s.transaction(|tx| tx.stale_locks(t(100))).unwrap();
    assert_eq!(
        stale.into_iter().map(|r| r.name).collect::<Vec<_>>(),
        vec![ns("o-devops-pol1")]
    );

    // a pin cannot take a namespace held by an allocation lock
    let pinned = s.transaction(|tx| tx.mark_in_use(&ns("o-devops-pol2")));
    assert!(matches!(pinned, Err(StorageError::NamespaceConflict { .. })));
    let held = s
        .transaction(|tx| tx.namespace(&ns("o-devops-pol2")))
        .unwrap()
        .unwrap();
    assert!(held.allocation_lock);
    assert_eq!(held.availability, AvailabilityStatus::LockedForAllocation);
    assert!(s.transaction(|tx| tx.mark_in_use(&ns("o-devops-pol3"))).unwrap());
}

#[test]
fn at_pool_db_01_in_memory_pool_protocol() {
    pool_scenarios(LedgerStore::new_in_memory);
}

#[test]
fn at_pool_db_02_sqlite_pool_protocol() {
    pool_scenarios(|| SqliteLedgerStore::open_in_memory().unwrap());
}

#[test]
fn at_pool_db_03_prefix_with_underscore_is_literal() {
    let mut s = SqliteLedgerStore::open_in_memory().unwrap();
    seed(&mut s, &["o-devops-polx"]);
    let class = PrefixClass::new("o-devops_pol").unwrap();
    assert!(s.transaction(|tx| tx.find_available(&class)).unwrap().is_none());
}
